//! Per-user fusion session.
//!
//! A `UserSession` owns every piece of mutable state for one monitored
//! person. It is plain data plus transitions: the engine wraps it in a lock
//! and feeds it samples, verdicts and timer expiries. Nothing here blocks or
//! spawns.

use crate::classifier::{ClassificationRequest, Verdict};
use crate::core::liveness::LivenessTracker;
use crate::core::sample::{ActivityLevel, DeviceClass, IncomingSample, PerDevice};
use crate::core::windowing::{WindowBuffer, WindowShape};
use crate::fusion::{
    Confirmation, ConfirmationMode, Decision, EmergencyState, FusionParams, RecoveryReason,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A window handed out for classification.
///
/// The ticket remembers the alert epoch it was dispatched under so that a
/// verdict computed over pre-alert samples cannot be applied after the fact.
#[derive(Debug, Clone)]
pub struct ClassificationTicket {
    pub request: ClassificationRequest,
    pub alert_epoch: u64,
}

impl ClassificationTicket {
    pub fn device(&self) -> DeviceClass {
        self.request.device
    }
}

/// Where a device's window currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPhase {
    Filling,
    Classifying,
    CoolingDown,
}

/// Everything the ingestion path learns from one sample.
#[derive(Debug, Clone)]
pub struct SampleOutcome {
    pub magnitude: f64,
    pub activity: ActivityLevel,
    /// Whole minutes since the last walking-level sample
    pub inactive_minutes: i64,
    pub long_inactivity: bool,
    /// Old samples dropped by backpressure
    pub dropped: usize,
    /// Set when this sample completed an auto-recovery
    pub recovered: Option<RecoveryReason>,
    pub phase: WindowPhase,
    pub emergency: EmergencyState,
    /// Window to classify, if this sample completed one
    pub dispatch: Option<ClassificationTicket>,
}

/// Serializable view of a session for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub emergency: EmergencyState,
    pub emergency_since: Option<DateTime<Utc>>,
    pub sensitivity: u8,
    pub recovery_streak: u32,
    pub alive: PerDevice<bool>,
    pub buffered: PerDevice<usize>,
    pub in_flight: PerDevice<bool>,
    pub cooling_down: PerDevice<bool>,
    pub last_packet_at: PerDevice<Option<DateTime<Utc>>>,
    pub last_candidate_at: PerDevice<Option<DateTime<Utc>>>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Mutable fusion state of one monitored person.
#[derive(Debug)]
pub struct UserSession {
    user_id: String,
    buffers: PerDevice<WindowBuffer>,
    liveness: LivenessTracker,
    in_flight: PerDevice<bool>,
    cooling_down: PerDevice<bool>,
    cooldown_token: PerDevice<u64>,
    last_candidate_at: PerDevice<Option<DateTime<Utc>>>,
    emergency: EmergencyState,
    emergency_since: Option<DateTime<Utc>>,
    alert_epoch: u64,
    recovery_streak: u32,
    sensitivity: u8,
    last_active_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    retired: bool,
}

impl UserSession {
    pub fn new(
        user_id: impl Into<String>,
        shapes: PerDevice<WindowShape>,
        sensitivity: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            buffers: PerDevice::new(
                WindowBuffer::new(shapes.wearable),
                WindowBuffer::new(shapes.handheld),
            ),
            liveness: LivenessTracker::new(),
            in_flight: PerDevice::default(),
            cooling_down: PerDevice::default(),
            cooldown_token: PerDevice::default(),
            last_candidate_at: PerDevice::default(),
            emergency: EmergencyState::Normal,
            emergency_since: None,
            alert_epoch: 0,
            recovery_streak: 0,
            sensitivity,
            last_active_at: now,
            created_at: now,
            retired: false,
        }
    }

    /// Ingest one validated sample.
    ///
    /// Updates liveness and activity, advances auto-recovery, buffers the
    /// sample and, if the device's window is ready, marks it in flight and
    /// hands out a ticket for classification.
    pub fn observe(&mut self, incoming: &IncomingSample, params: &FusionParams) -> SampleOutcome {
        let device = incoming.device;
        let now = incoming.received_at;

        self.liveness.record_packet(device, now);
        if let Some(sensitivity) = incoming.sensitivity {
            self.sensitivity = sensitivity;
        }

        let magnitude = incoming.sample.magnitude();
        let activity = ActivityLevel::classify(magnitude, params.walking_threshold_g);
        if activity.is_moving() {
            self.last_active_at = now;
        }
        let inactive_for = now - self.last_active_at;

        let recovered = self.advance_recovery(activity, params);

        let dropped = self.buffers.get_mut(device).append(incoming.sample);
        let dispatch = self.begin_classification(device);

        SampleOutcome {
            magnitude,
            activity,
            inactive_minutes: inactive_for.num_minutes(),
            long_inactivity: inactive_for >= params.inactivity_advisory,
            dropped,
            recovered,
            phase: self.phase(device),
            emergency: self.emergency,
            dispatch,
        }
    }

    /// Whether `device` has a full window and nothing blocking it.
    pub fn is_ready(&self, device: DeviceClass) -> bool {
        self.buffers.get(device).is_full()
            && !*self.in_flight.get(device)
            && !*self.cooling_down.get(device)
    }

    fn begin_classification(&mut self, device: DeviceClass) -> Option<ClassificationTicket> {
        if self.retired || !self.is_ready(device) {
            return None;
        }

        *self.in_flight.get_mut(device) = true;
        Some(ClassificationTicket {
            request: ClassificationRequest {
                user_id: self.user_id.clone(),
                device,
                window: self.buffers.get(device).snapshot(),
                sensitivity: self.sensitivity,
            },
            alert_epoch: self.alert_epoch,
        })
    }

    /// Apply a finished classification.
    ///
    /// Always releases the in-flight flag and slides the window, then feeds
    /// the verdict to the state machine unless the ticket is stale.
    pub fn finish_classification(
        &mut self,
        ticket: &ClassificationTicket,
        verdict: Verdict,
        now: DateTime<Utc>,
        params: &FusionParams,
    ) -> Decision {
        let device = ticket.device();
        self.release_in_flight(device);
        self.buffers.get_mut(device).drain_after_classification();

        if self.retired || ticket.alert_epoch != self.alert_epoch {
            return Decision::Stale;
        }

        self.apply_verdict(device, verdict, now, params)
    }

    /// Clear the in-flight flag without touching anything else.
    pub fn release_in_flight(&mut self, device: DeviceClass) {
        *self.in_flight.get_mut(device) = false;
    }

    /// Feed one device-level verdict into the state machine.
    pub fn apply_verdict(
        &mut self,
        device: DeviceClass,
        verdict: Verdict,
        now: DateTime<Utc>,
        params: &FusionParams,
    ) -> Decision {
        if !verdict.positive {
            return Decision::Negative;
        }
        if self.emergency == EmergencyState::Emergency {
            return Decision::Absorbed;
        }

        *self.last_candidate_at.get_mut(device) = Some(now);

        let other = device.counterpart();
        let self_alive = self.liveness.is_alive(device, now, params.liveness_timeout);
        let other_alive = self.liveness.is_alive(other, now, params.liveness_timeout);

        if self_alive && other_alive {
            let corroborated = self
                .last_candidate_at
                .get(other)
                .is_some_and(|at| now - at <= params.cross_check_window);
            if !corroborated {
                return Decision::AwaitingCounterpart;
            }
            // Consumed candidates must not validate a later event.
            self.last_candidate_at = PerDevice::default();
            Decision::Confirmed(self.confirm(ConfirmationMode::CrossValidated, now))
        } else {
            Decision::Confirmed(self.confirm(ConfirmationMode::SingleDevice { device }, now))
        }
    }

    fn confirm(&mut self, mode: ConfirmationMode, now: DateTime<Utc>) -> Confirmation {
        self.emergency = EmergencyState::Emergency;
        self.emergency_since = Some(now);
        self.alert_epoch += 1;
        self.recovery_streak = 0;

        for device in DeviceClass::ALL {
            *self.cooling_down.get_mut(device) = true;
            *self.cooldown_token.get_mut(device) += 1;
        }

        Confirmation {
            mode,
            cooldown_tokens: self.cooldown_token,
        }
    }

    fn advance_recovery(
        &mut self,
        activity: ActivityLevel,
        params: &FusionParams,
    ) -> Option<RecoveryReason> {
        if self.emergency != EmergencyState::Emergency {
            self.recovery_streak = 0;
            return None;
        }

        if activity.is_moving() {
            self.recovery_streak += 1;
        } else {
            self.recovery_streak = 0;
        }

        if self.recovery_streak >= params.recovery_streak {
            self.leave_emergency();
            Some(RecoveryReason::AutoRecovery)
        } else {
            None
        }
    }

    fn leave_emergency(&mut self) {
        self.emergency = EmergencyState::Normal;
        self.emergency_since = None;
        self.recovery_streak = 0;
    }

    /// Manual cancellation by the person or a caregiver.
    ///
    /// Returns false if there was no emergency to cancel.
    pub fn cancel_emergency(&mut self) -> bool {
        if self.emergency != EmergencyState::Emergency {
            return false;
        }
        self.leave_emergency();
        true
    }

    /// Clear the cooldown of `device` if `token` is still the current one.
    pub fn expire_cooldown(&mut self, device: DeviceClass, token: u64) -> bool {
        if *self.cooldown_token.get(device) != token || !*self.cooling_down.get(device) {
            return false;
        }
        *self.cooling_down.get_mut(device) = false;
        true
    }

    pub fn set_sensitivity(&mut self, sensitivity: u8) {
        self.sensitivity = sensitivity;
    }

    /// Mark the session as torn down. Late results are discarded from now on.
    pub fn retire(&mut self) {
        self.retired = true;
        for device in DeviceClass::ALL {
            self.buffers.get_mut(device).clear();
        }
    }

    /// Whether the session may be dropped from the registry.
    ///
    /// Sessions in emergency or with a classification in flight are kept.
    pub fn is_evictable(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        if self.emergency == EmergencyState::Emergency
            || DeviceClass::ALL.iter().any(|d| *self.in_flight.get(*d))
        {
            return false;
        }
        let last_seen = self.liveness.last_seen().unwrap_or(self.created_at);
        now - last_seen >= idle_timeout
    }

    pub fn phase(&self, device: DeviceClass) -> WindowPhase {
        if *self.cooling_down.get(device) {
            WindowPhase::CoolingDown
        } else if *self.in_flight.get(device) {
            WindowPhase::Classifying
        } else {
            WindowPhase::Filling
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>, params: &FusionParams) -> SessionSnapshot {
        let alive = |d| self.liveness.is_alive(d, now, params.liveness_timeout);
        SessionSnapshot {
            user_id: self.user_id.clone(),
            emergency: self.emergency,
            emergency_since: self.emergency_since,
            sensitivity: self.sensitivity,
            recovery_streak: self.recovery_streak,
            alive: PerDevice::new(alive(DeviceClass::Wearable), alive(DeviceClass::Handheld)),
            buffered: PerDevice::new(
                self.buffers.wearable.len(),
                self.buffers.handheld.len(),
            ),
            in_flight: self.in_flight,
            cooling_down: self.cooling_down,
            last_packet_at: PerDevice::new(
                self.liveness.last_packet_at(DeviceClass::Wearable),
                self.liveness.last_packet_at(DeviceClass::Handheld),
            ),
            last_candidate_at: self.last_candidate_at,
            last_active_at: self.last_active_at,
            created_at: self.created_at,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn emergency_state(&self) -> EmergencyState {
        self.emergency
    }

    pub fn is_in_flight(&self, device: DeviceClass) -> bool {
        *self.in_flight.get(device)
    }

    pub fn is_cooling_down(&self, device: DeviceClass) -> bool {
        *self.cooling_down.get(device)
    }

    pub fn recovery_streak(&self) -> u32 {
        self.recovery_streak
    }

    pub fn buffered(&self, device: DeviceClass) -> usize {
        self.buffers.get(device).len()
    }

    pub fn sensitivity(&self) -> u8 {
        self.sensitivity
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn last_candidate_at(&self, device: DeviceClass) -> Option<DateTime<Utc>> {
        *self.last_candidate_at.get(device)
    }
}
