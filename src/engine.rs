//! The fusion engine: session registry, classification dispatch and timers.
//!
//! Each user owns a session slot in a sharded map. Ingestion locks only
//! that user's session, and only for as long as it takes to update buffers and
//! hand out a classification ticket. Classification runs in a spawned task
//! with no lock held; the result is applied under the lock again.
//!
//! All methods that start background work must be called from within a tokio
//! runtime.

use crate::classifier::{classify_or_miss, Classifier, Verdict};
use crate::config::Config;
use crate::core::sample::{
    clamp_sensitivity, ActivityLevel, DeviceClass, IngestError, PerDevice, SamplePayload,
};
use crate::core::windowing::WindowShape;
use crate::fusion::{
    ClassificationTicket, Decision, EmergencyState, FusionParams, RecoveryReason,
    SessionSnapshot, UserSession, WindowPhase,
};
use crate::notifier::{AlertKind, EmergencyNotifier};
use crate::stats::SharedEngineStats;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

/// Source of "now" for liveness, cross-checks and inactivity.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry entry for one user.
///
/// Locks are std mutexes and are never held across an await point.
struct SessionSlot {
    session: Mutex<UserSession>,
    cooldown_timers: Mutex<PerDevice<Option<AbortHandle>>>,
    /// Last notification task; each new one waits for it to keep per-user order
    notify_chain: Mutex<Option<JoinHandle<()>>>,
}

impl SessionSlot {
    fn new(session: UserSession) -> Self {
        Self {
            session: Mutex::new(session),
            cooldown_timers: Mutex::new(PerDevice::default()),
            notify_chain: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UserSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers(&self) -> MutexGuard<'_, PerDevice<Option<AbortHandle>>> {
        self.cooldown_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_chain(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.notify_chain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_timers(&self) {
        let mut timers = self.timers();
        for device in DeviceClass::ALL {
            if let Some(handle) = timers.get_mut(device).take() {
                handle.abort();
            }
        }
    }
}

/// Clears the in-flight flag when dropped, unless the result was applied.
///
/// Covers classifier panics and tasks aborted at shutdown.
struct InFlightGuard {
    slot: Arc<SessionSlot>,
    device: DeviceClass,
    armed: bool,
}

impl InFlightGuard {
    fn new(slot: Arc<SessionSlot>, device: DeviceClass) -> Self {
        Self {
            slot,
            device,
            armed: true,
        }
    }

    /// Apply the result under the session lock and disarm.
    fn complete<R>(mut self, apply: impl FnOnce(&mut UserSession) -> R) -> R {
        let result = apply(&mut self.slot.lock());
        self.armed = false;
        result
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.slot.lock().release_in_flight(self.device);
        }
    }
}

/// Lightweight reply to an ingested sample.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEcho {
    /// Always 0: emergencies travel through the notifier, not the echo
    pub result: u8,
    pub status: ActivityLevel,
    /// Motion magnitude in g, two decimals
    pub svm: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub device: DeviceClass,
    pub phase: WindowPhase,
    pub emergency: EmergencyState,
}

/// Result of a successful ingestion.
#[derive(Debug)]
pub struct IngestReceipt {
    pub echo: StatusEcho,
    /// Classification started by this sample, if any
    pub classification: Option<JoinHandle<Decision>>,
}

/// Outcome of a manual cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotInEmergency,
    UnknownUser,
}

/// Multi-user fall-detection fusion engine.
pub struct FusionEngine {
    params: FusionParams,
    cooldown: Duration,
    idle_timeout: Option<Duration>,
    sweep_interval: Duration,
    shapes: PerDevice<WindowShape>,
    default_sensitivity: u8,
    sessions: DashMap<String, Arc<SessionSlot>>,
    /// Latest remotely configured sensitivity per user, applied at session creation
    remote_sensitivity: DashMap<String, u8>,
    classifier: Arc<dyn Classifier>,
    notifier: Arc<dyn EmergencyNotifier>,
    clock: Arc<dyn Clock>,
    stats: SharedEngineStats,
}

impl FusionEngine {
    pub fn new(
        config: &Config,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn EmergencyNotifier>,
        clock: Arc<dyn Clock>,
        stats: SharedEngineStats,
    ) -> Arc<Self> {
        Arc::new(Self {
            params: FusionParams::from(&config.fusion),
            cooldown: config.fusion.cooldown,
            idle_timeout: config.fusion.session_idle_timeout,
            sweep_interval: config.fusion.eviction_sweep_interval,
            shapes: PerDevice::new(config.wearable.window, config.handheld.window),
            default_sensitivity: config.fusion.default_sensitivity,
            sessions: DashMap::new(),
            remote_sensitivity: DashMap::new(),
            classifier,
            notifier,
            clock,
            stats,
        })
    }

    /// Validate and ingest one sample.
    ///
    /// Malformed payloads are rejected before any session is created or
    /// touched. If the sample completes a window, classification starts in
    /// the background and its handle is returned in the receipt.
    pub fn ingest(self: &Arc<Self>, payload: SamplePayload) -> Result<IngestReceipt, IngestError> {
        let now = self.clock.now();
        let incoming = match payload.validate(now) {
            Ok(incoming) => incoming,
            Err(e) => {
                self.stats.record_sample_rejected();
                tracing::debug!("Rejected sample: {}", e);
                return Err(e);
            }
        };

        let (slot, outcome) = loop {
            let slot = self.slot(&incoming.user_id);
            let mut session = slot.lock();
            // Lost a race with eviction; the next lookup creates a fresh session.
            if session.is_retired() {
                drop(session);
                self.sessions
                    .remove_if(&incoming.user_id, |_, current| Arc::ptr_eq(current, &slot));
                continue;
            }
            let outcome = session.observe(&incoming, &self.params);
            drop(session);
            break (slot, outcome);
        };

        self.stats.record_sample_accepted();
        self.stats.record_samples_dropped(outcome.dropped as u64);

        tracing::debug!(
            user = %incoming.user_id,
            device = %incoming.device,
            svm = outcome.magnitude,
            activity = outcome.activity.as_str(),
            "Sample ingested"
        );

        if let Some(reason) = outcome.recovered {
            self.stats.record_recovery();
            tracing::info!(user = %incoming.user_id, "Emergency cleared: {}", reason.source_description());
            self.notify(&slot, &incoming.user_id, AlertKind::Recovered, reason.source_description());
        }

        let alert = outcome.long_inactivity.then(|| {
            tracing::info!(
                user = %incoming.user_id,
                minutes = outcome.inactive_minutes,
                "Long inactivity"
            );
            format!("long inactivity: {} minutes", outcome.inactive_minutes)
        });

        let classification = outcome
            .dispatch
            .map(|ticket| self.dispatch(Arc::clone(&slot), ticket));

        Ok(IngestReceipt {
            echo: StatusEcho {
                result: 0,
                status: outcome.activity,
                svm: (outcome.magnitude * 100.0).round() / 100.0,
                alert,
                device: incoming.device,
                phase: outcome.phase,
                emergency: outcome.emergency,
            },
            classification,
        })
    }

    /// Existing slot for `user_id`, or a new one.
    ///
    /// The map guard is released before the caller locks the session.
    fn slot(&self, user_id: &str) -> Arc<SessionSlot> {
        if let Some(slot) = self.sessions.get(user_id) {
            return Arc::clone(slot.value());
        }

        let entry = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let sensitivity = self
                    .remote_sensitivity
                    .get(user_id)
                    .map(|s| *s)
                    .unwrap_or(self.default_sensitivity);
                tracing::info!(user = %user_id, sensitivity, "New session");
                Arc::new(SessionSlot::new(UserSession::new(
                    user_id,
                    self.shapes,
                    sensitivity,
                    self.clock.now(),
                )))
            });
        Arc::clone(entry.value())
    }

    fn existing_slot(&self, user_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.get(user_id).map(|slot| Arc::clone(slot.value()))
    }

    fn dispatch(
        self: &Arc<Self>,
        slot: Arc<SessionSlot>,
        ticket: ClassificationTicket,
    ) -> JoinHandle<Decision> {
        let summary = ticket.request.summary();
        tracing::info!(
            user = %ticket.request.user_id,
            device = %ticket.device(),
            samples = summary.samples,
            peak = summary.peak_magnitude,
            mean = summary.mean_magnitude,
            std_dev = summary.magnitude_std_dev,
            sensitivity = ticket.request.sensitivity,
            "Dispatching window for classification"
        );
        self.stats.record_classification();

        // Armed before spawning so an abort before the first poll still releases.
        let guard = InFlightGuard::new(Arc::clone(&slot), ticket.device());
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            let (verdict, failed) =
                classify_or_miss(engine.classifier.as_ref(), &ticket.request).await;
            if failed {
                engine.stats.record_classifier_failure();
            }

            let now = engine.clock.now();
            let decision = guard.complete(|session| {
                session.finish_classification(&ticket, verdict, now, &engine.params)
            });
            engine.handle_decision(&slot, &ticket, verdict, decision);
            decision
        })
    }

    fn handle_decision(
        self: &Arc<Self>,
        slot: &Arc<SessionSlot>,
        ticket: &ClassificationTicket,
        verdict: Verdict,
        decision: Decision,
    ) {
        let user_id = ticket.request.user_id.as_str();
        let device = ticket.device();

        match decision {
            Decision::Negative => {
                tracing::debug!(user = %user_id, device = %device, probability = verdict.probability, "No fall");
            }
            Decision::Absorbed => {
                tracing::debug!(user = %user_id, device = %device, "Positive absorbed, already in emergency");
            }
            Decision::AwaitingCounterpart => {
                tracing::info!(
                    user = %user_id,
                    device = %device,
                    probability = verdict.probability,
                    "Candidate fall, waiting for {} to agree",
                    device.counterpart()
                );
            }
            Decision::Stale => {
                self.stats.record_stale_result();
                tracing::debug!(user = %user_id, device = %device, "Discarded stale classification result");
            }
            Decision::Confirmed(confirmation) => {
                let source = confirmation.mode.source_description();
                tracing::warn!(
                    user = %user_id,
                    device = %device,
                    probability = verdict.probability,
                    "Fall confirmed: {}",
                    source
                );
                self.stats.record_emergency(confirmation.mode);
                self.schedule_cooldowns(slot, user_id, confirmation.cooldown_tokens);
                self.notify(slot, user_id, AlertKind::FallDetected, source);
            }
        }
    }

    fn schedule_cooldowns(&self, slot: &Arc<SessionSlot>, user_id: &str, tokens: PerDevice<u64>) {
        let mut timers = slot.timers();
        for device in DeviceClass::ALL {
            let weak = Arc::downgrade(slot);
            let token = *tokens.get(device);
            let delay = self.cooldown;
            let user = user_id.to_string();

            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(slot) = weak.upgrade() else {
                    return;
                };
                if slot.lock().expire_cooldown(device, token) {
                    tracing::debug!(user = %user, device = %device, "Cooldown over");
                }
            });

            if let Some(previous) = timers.get_mut(device).replace(handle.abort_handle()) {
                previous.abort();
            }
        }
    }

    /// Queue a notification behind the user's previous one.
    fn notify(&self, slot: &SessionSlot, user_id: &str, kind: AlertKind, source: &'static str) {
        let notifier = Arc::clone(&self.notifier);
        let stats = Arc::clone(&self.stats);
        let user = user_id.to_string();

        let mut chain = slot.notify_chain();
        let previous = chain.take();
        *chain = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let result = match kind {
                AlertKind::FallDetected => notifier.notify_emergency(&user, source).await,
                AlertKind::Recovered => notifier.notify_recovery(&user, source).await,
            };
            if let Err(e) = result {
                stats.record_notifier_failure();
                tracing::warn!(user = %user, "Notifier failed: {}", e);
            }
        }));
    }

    /// Wait until every queued notification for `user_id` has been delivered.
    pub async fn flush_notifications(&self, user_id: &str) {
        let Some(slot) = self.existing_slot(user_id) else {
            return;
        };
        loop {
            let pending = slot.notify_chain().take();
            match pending {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    /// Wait for every queued notification of every user.
    pub async fn flush_all_notifications(&self) {
        let users: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for user in users {
            self.flush_notifications(&user).await;
        }
    }

    /// Apply a remotely configured sensitivity.
    ///
    /// Takes effect for the next dispatched window, and is remembered for
    /// sessions created later. Returns the clamped value.
    pub fn update_sensitivity(&self, user_id: &str, sensitivity: i64) -> u8 {
        let value = clamp_sensitivity(sensitivity);
        self.remote_sensitivity.insert(user_id.to_string(), value);
        if let Some(slot) = self.existing_slot(user_id) {
            slot.lock().set_sensitivity(value);
        }
        tracing::info!(user = %user_id, sensitivity = value, "Sensitivity updated");
        value
    }

    /// Manual EMERGENCY → NORMAL transition by the person or a caregiver.
    ///
    /// The collaborator that requested it already knows, so the notifier is
    /// not called.
    pub fn cancel_emergency(&self, user_id: &str) -> CancelOutcome {
        let Some(slot) = self.existing_slot(user_id) else {
            return CancelOutcome::UnknownUser;
        };
        if !slot.lock().cancel_emergency() {
            return CancelOutcome::NotInEmergency;
        }

        self.stats.record_manual_cancellation();
        tracing::info!(
            user = %user_id,
            "Emergency cleared: {}",
            RecoveryReason::ManualCancel.source_description()
        );
        CancelOutcome::Cancelled
    }

    pub fn session_snapshot(&self, user_id: &str) -> Option<SessionSnapshot> {
        let slot = self.existing_slot(user_id)?;
        let now = self.clock.now();
        let snapshot = slot.lock().snapshot(now, &self.params);
        Some(snapshot)
    }

    pub fn emergency_state(&self, user_id: &str) -> Option<EmergencyState> {
        let slot = self.existing_slot(user_id)?;
        let state = slot.lock().emergency_state();
        Some(state)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> &SharedEngineStats {
        &self.stats
    }

    /// Drop sessions idle for longer than the configured timeout.
    ///
    /// Sessions in emergency or with a classification in flight are kept.
    /// Returns the number of sessions evicted; always 0 when eviction is off.
    pub fn evict_idle(&self) -> usize {
        let Some(idle) = self.idle_timeout else {
            return 0;
        };
        let idle = chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let now = self.clock.now();

        let mut evicted = 0;
        self.sessions.retain(|user_id, slot| {
            let mut session = slot.lock();
            if !session.is_evictable(now, idle) {
                return true;
            }
            session.retire();
            drop(session);
            slot.abort_timers();
            tracing::info!(user = %user_id, "Evicted idle session");
            evicted += 1;
            false
        });

        if evicted > 0 {
            self.stats.record_sessions_evicted(evicted as u64);
        }
        evicted
    }

    /// Start the periodic eviction sweep, if eviction is enabled.
    pub fn spawn_eviction_sweep(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.idle_timeout?;
        let engine = Arc::downgrade(self);
        let period = self.sweep_interval.max(Duration::from_millis(10));

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.evict_idle();
            }
        }))
    }
}
