//! End-to-end fusion scenarios against a scripted classifier and a manual clock.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use silverguard_fusion::classifier::{ClassificationRequest, Classifier, ClassifierError, Verdict};
use silverguard_fusion::core::{DeviceClass, PerDevice, SamplePayload, WindowShape};
use silverguard_fusion::engine::{FusionEngine, ManualClock};
use silverguard_fusion::fusion::{ConfirmationMode, Decision, EmergencyState};
use silverguard_fusion::notifier::{EmergencyNotifier, NotifierError};
use silverguard_fusion::stats::EngineStats;
use silverguard_fusion::Config;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy)]
enum Script {
    Fall,
    NoFall,
    Fail,
}

struct ScriptedClassifier {
    script: PerDevice<Script>,
}

impl ScriptedClassifier {
    fn new(wearable: Script, handheld: Script) -> Self {
        Self {
            script: PerDevice::new(wearable, handheld),
        }
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Verdict, ClassifierError> {
        match *self.script.get(request.device) {
            Script::Fall => Ok(Verdict::fall(0.9)),
            Script::NoFall => Ok(Verdict::miss()),
            Script::Fail => Err(ClassifierError::EmptyOutput),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Emergency { user: String, source: String },
    Recovery { user: String },
}

#[derive(Default)]
struct RecordingNotifier {
    calls: Mutex<Vec<Call>>,
    fail: bool,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn result(&self) -> Result<(), NotifierError> {
        if self.fail {
            Err(NotifierError::Network("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EmergencyNotifier for RecordingNotifier {
    async fn notify_emergency(&self, user_id: &str, source: &str) -> Result<(), NotifierError> {
        self.calls.lock().unwrap().push(Call::Emergency {
            user: user_id.to_string(),
            source: source.to_string(),
        });
        self.result()
    }

    async fn notify_recovery(&self, user_id: &str, _source: &str) -> Result<(), NotifierError> {
        self.calls.lock().unwrap().push(Call::Recovery {
            user: user_id.to_string(),
        });
        self.result()
    }
}

struct Harness {
    engine: Arc<FusionEngine>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(classifier: ScriptedClassifier, notifier: RecordingNotifier) -> Harness {
    let mut config = Config::default();
    config.wearable.window = WindowShape {
        capacity: 2,
        slide: 1,
    };
    config.handheld.window = WindowShape {
        capacity: 2,
        slide: 1,
    };

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let notifier = Arc::new(notifier);
    let engine = FusionEngine::new(
        &config,
        Arc::new(classifier),
        notifier.clone(),
        clock.clone(),
        Arc::new(EngineStats::new()),
    );
    Harness {
        engine,
        clock,
        notifier,
    }
}

fn sample(user: &str, device: DeviceClass, acc_z: f64) -> SamplePayload {
    SamplePayload {
        user_id: Some(user.to_string()),
        acc_x: Some(0.0),
        acc_y: Some(0.0),
        acc_z: Some(acc_z),
        device_type: Some(device.as_str().to_string()),
        ..Default::default()
    }
}

/// Feed resting samples until one dispatches, then wait for its decision.
async fn classify_next(h: &Harness, user: &str, device: DeviceClass) -> Decision {
    for _ in 0..10 {
        let receipt = h.engine.ingest(sample(user, device, 1.0)).unwrap();
        if let Some(handle) = receipt.classification {
            return handle.await.unwrap();
        }
    }
    panic!("{device} window never dispatched");
}

#[tokio::test]
async fn handheld_stale_wearable_fall_alerts_immediately() {
    let h = harness(
        ScriptedClassifier::new(Script::Fall, Script::NoFall),
        RecordingNotifier::default(),
    );

    h.engine
        .ingest(sample("u1", DeviceClass::Handheld, 1.0))
        .unwrap();
    h.clock.advance(ChronoDuration::seconds(11));

    let decision = classify_next(&h, "u1", DeviceClass::Wearable).await;
    match decision {
        Decision::Confirmed(c) => assert_eq!(
            c.mode,
            ConfirmationMode::SingleDevice {
                device: DeviceClass::Wearable
            }
        ),
        other => panic!("expected confirmation, got {other:?}"),
    }

    h.engine.flush_notifications("u1").await;
    assert_eq!(
        h.notifier.calls(),
        vec![Call::Emergency {
            user: "u1".to_string(),
            source: "wearable only (handheld offline)".to_string()
        }]
    );

    let snapshot = h.engine.session_snapshot("u1").unwrap();
    assert_eq!(snapshot.emergency, EmergencyState::Emergency);
    assert!(snapshot.cooling_down.wearable && snapshot.cooling_down.handheld);

    // Further samples are absorbed by the cooldown.
    let receipt = h
        .engine
        .ingest(sample("u1", DeviceClass::Wearable, 1.0))
        .unwrap();
    assert!(receipt.classification.is_none());
}

#[tokio::test]
async fn both_alive_cross_validated_within_window() {
    let h = harness(
        ScriptedClassifier::new(Script::Fall, Script::Fall),
        RecordingNotifier::default(),
    );

    h.engine
        .ingest(sample("u2", DeviceClass::Handheld, 1.0))
        .unwrap();
    let first = classify_next(&h, "u2", DeviceClass::Wearable).await;
    assert_eq!(first, Decision::AwaitingCounterpart);
    assert!(h.notifier.calls().is_empty());

    h.clock.advance(ChronoDuration::seconds(2));
    let second = classify_next(&h, "u2", DeviceClass::Handheld).await;
    match second {
        Decision::Confirmed(c) => assert_eq!(c.mode, ConfirmationMode::CrossValidated),
        other => panic!("expected confirmation, got {other:?}"),
    }

    h.engine.flush_notifications("u2").await;
    assert_eq!(
        h.notifier.calls(),
        vec![Call::Emergency {
            user: "u2".to_string(),
            source: "wearable+handheld (cross-validated)".to_string()
        }]
    );
    assert_eq!(h.engine.stats().stats().cross_validated_alerts, 1);
}

#[tokio::test]
async fn both_alive_counterpart_too_late() {
    let h = harness(
        ScriptedClassifier::new(Script::Fall, Script::Fall),
        RecordingNotifier::default(),
    );

    h.engine
        .ingest(sample("u2", DeviceClass::Handheld, 1.0))
        .unwrap();
    assert_eq!(
        classify_next(&h, "u2", DeviceClass::Wearable).await,
        Decision::AwaitingCounterpart
    );

    // The wearable's last packet is 5s old, still within liveness.
    h.clock.advance(ChronoDuration::seconds(5));
    let second = classify_next(&h, "u2", DeviceClass::Handheld).await;
    assert_eq!(second, Decision::AwaitingCounterpart);

    h.engine.flush_notifications("u2").await;
    assert!(h.notifier.calls().is_empty());
    assert_eq!(
        h.engine.emergency_state("u2"),
        Some(EmergencyState::Normal)
    );
}

#[tokio::test]
async fn failing_classifier_never_alerts() {
    let h = harness(
        ScriptedClassifier::new(Script::Fail, Script::Fail),
        RecordingNotifier::default(),
    );

    for _ in 0..3 {
        assert_eq!(
            classify_next(&h, "u3", DeviceClass::Handheld).await,
            Decision::Negative
        );
    }

    let snapshot = h.engine.session_snapshot("u3").unwrap();
    assert_eq!(snapshot.emergency, EmergencyState::Normal);
    assert!(!snapshot.in_flight.handheld);
    assert_eq!(h.engine.stats().stats().classifier_failures, 3);
    assert!(h.notifier.calls().is_empty());
}

#[tokio::test]
async fn sustained_motion_recovers_and_notifies_in_order() {
    let h = harness(
        ScriptedClassifier::new(Script::NoFall, Script::Fall),
        RecordingNotifier::default(),
    );

    assert!(classify_next(&h, "u4", DeviceClass::Handheld)
        .await
        .is_confirmed());

    for i in 0..30 {
        let receipt = h
            .engine
            .ingest(sample("u4", DeviceClass::Handheld, 1.5))
            .unwrap();
        let expected = if i < 29 {
            EmergencyState::Emergency
        } else {
            EmergencyState::Normal
        };
        assert_eq!(receipt.echo.emergency, expected, "sample {i}");
    }

    h.engine.flush_notifications("u4").await;
    let calls = h.notifier.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[0], Call::Emergency { .. }));
    assert_eq!(
        calls[1],
        Call::Recovery {
            user: "u4".to_string()
        }
    );
    assert_eq!(h.engine.stats().stats().recoveries, 1);
}

#[tokio::test]
async fn notifier_failure_keeps_emergency() {
    let h = harness(
        ScriptedClassifier::new(Script::Fall, Script::Fall),
        RecordingNotifier::failing(),
    );

    assert!(classify_next(&h, "u5", DeviceClass::Wearable)
        .await
        .is_confirmed());
    h.engine.flush_notifications("u5").await;

    assert_eq!(h.notifier.calls().len(), 1);
    assert_eq!(
        h.engine.emergency_state("u5"),
        Some(EmergencyState::Emergency)
    );
    assert_eq!(h.engine.stats().stats().notifier_failures, 1);
}

#[tokio::test]
async fn users_are_independent() {
    let h = harness(
        ScriptedClassifier::new(Script::Fall, Script::NoFall),
        RecordingNotifier::default(),
    );

    assert!(classify_next(&h, "a", DeviceClass::Wearable)
        .await
        .is_confirmed());
    assert_eq!(
        classify_next(&h, "b", DeviceClass::Handheld).await,
        Decision::Negative
    );

    assert_eq!(h.engine.emergency_state("a"), Some(EmergencyState::Emergency));
    assert_eq!(h.engine.emergency_state("b"), Some(EmergencyState::Normal));
    assert_eq!(h.engine.session_count(), 2);
}

#[tokio::test]
async fn cooldown_expires_in_real_time() {
    let mut config = Config::default();
    config.handheld.window = WindowShape {
        capacity: 2,
        slide: 1,
    };
    config.fusion.cooldown = Duration::from_millis(50);
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = FusionEngine::new(
        &config,
        Arc::new(ScriptedClassifier::new(Script::NoFall, Script::Fall)),
        notifier,
        Arc::new(ManualClock::new(Utc::now())),
        Arc::new(EngineStats::new()),
    );

    let mut handle = None;
    for _ in 0..2 {
        handle = engine
            .ingest(sample("u6", DeviceClass::Handheld, 1.0))
            .unwrap()
            .classification
            .or(handle);
    }
    assert!(handle.unwrap().await.unwrap().is_confirmed());

    let receipt = engine
        .ingest(sample("u6", DeviceClass::Handheld, 1.0))
        .unwrap();
    assert!(receipt.classification.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;

    // Cooldown over: the next sample dispatches a window, absorbed by the emergency.
    let receipt = engine
        .ingest(sample("u6", DeviceClass::Handheld, 1.0))
        .unwrap();
    let decision = receipt.classification.expect("dispatch after cooldown").await.unwrap();
    assert_eq!(decision, Decision::Absorbed);
}
