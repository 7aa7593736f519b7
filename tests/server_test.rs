//! Integration tests for the fusion HTTP server

#[cfg(feature = "server")]
mod server_tests {
    use async_trait::async_trait;
    use silverguard_fusion::classifier::{ClassificationRequest, Classifier, ClassifierError, Verdict};
    use silverguard_fusion::core::WindowShape;
    use silverguard_fusion::engine::{FusionEngine, SystemClock};
    use silverguard_fusion::notifier::LogNotifier;
    use silverguard_fusion::remote;
    use silverguard_fusion::server::{run, ServerConfig};
    use silverguard_fusion::stats::EngineStats;
    use silverguard_fusion::Config;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    struct AlwaysFall;

    #[async_trait]
    impl Classifier for AlwaysFall {
        async fn classify(&self, _: &ClassificationRequest) -> Result<Verdict, ClassifierError> {
            Ok(Verdict::fall(0.9))
        }
    }

    struct TestServer {
        addr: SocketAddr,
        engine: Arc<FusionEngine>,
        shutdown_tx: tokio::sync::oneshot::Sender<()>,
    }

    async fn start() -> TestServer {
        let mut config = Config::default();
        config.handheld.window = WindowShape {
            capacity: 3,
            slide: 1,
        };
        config.fusion.cooldown = Duration::from_millis(50);

        let engine = FusionEngine::new(
            &config,
            Arc::new(AlwaysFall),
            Arc::new(LogNotifier),
            Arc::new(SystemClock),
            Arc::new(EngineStats::new()),
        );
        let (handle, rx) = remote::channel(16);
        remote::spawn_listener(Arc::clone(&engine), rx);

        let (addr, shutdown_tx) = run(ServerConfig::new("127.0.0.1", 0), Arc::clone(&engine), handle)
            .await
            .expect("Failed to start server");

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        TestServer {
            addr,
            engine,
            shutdown_tx,
        }
    }

    fn sample(user: &str, device: &str) -> serde_json::Value {
        serde_json::json!({
            "userId": user,
            "acc_x": 0.1,
            "acc_y": 0.2,
            "acc_z": 9.6,
            "gyro_x": 0.0,
            "gyro_y": 0.0,
            "gyro_z": 0.0,
            "device_type": device
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let server = start().await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{}/health", server.addr))
            .send()
            .await
            .expect("Failed to send request");

        assert!(response.status().is_success());

        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["status"], "ok");
        assert!(body["version"].as_str().is_some());

        let _ = server.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_predict_echoes_status() {
        let server = start().await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/predict", server.addr))
            .json(&sample("u1", "phone"))
            .send()
            .await
            .expect("Failed to send request");

        assert!(response.status().is_success());

        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["result"], 0);
        assert_eq!(body["status"], "resting");
        assert_eq!(body["device"], "handheld");
        assert_eq!(body["phase"], "filling");
        // 9.6 m/s² is normalised to g.
        let svm = body["svm"].as_f64().unwrap();
        assert!((svm - 0.98).abs() < 0.01, "svm was {svm}");
        assert!(body.get("alert").is_none());

        assert_eq!(server.engine.session_count(), 1);

        let _ = server.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_malformed_sample_rejected() {
        let server = start().await;
        let client = reqwest::Client::new();

        let missing_axis = serde_json::json!({"userId": "u1", "acc_x": 0.1, "acc_y": 0.2});
        let response = client
            .post(format!("http://{}/predict", server.addr))
            .json(&missing_axis)
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status().as_u16(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "MALFORMED_SAMPLE");

        let unknown_device = sample("u1", "smart-fridge");
        let response = client
            .post(format!("http://{}/predict", server.addr))
            .json(&unknown_device)
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status().as_u16(), 400);

        let response = client
            .post(format!("http://{}/predict", server.addr))
            .header("Content-Type", "application/json")
            .body("{not json")
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status().as_u16(), 400);

        assert_eq!(server.engine.session_count(), 0);
        assert_eq!(server.engine.stats().stats().samples_rejected, 3);

        let _ = server.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_unknown_user_status() {
        let server = start().await;

        let response = reqwest::get(format!("http://{}/users/nobody", server.addr))
            .await
            .expect("Failed to send request");
        assert_eq!(response.status().as_u16(), 404);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "UNKNOWN_USER");

        let _ = server.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_fall_then_manual_cancel() {
        let server = start().await;
        let client = reqwest::Client::new();

        // Handheld alone: its positive verdict confirms immediately.
        for _ in 0..3 {
            let response = client
                .post(format!("http://{}/predict", server.addr))
                .json(&sample("u2", "phone"))
                .send()
                .await
                .expect("Failed to send request");
            assert!(response.status().is_success());
        }

        let mut emergency = false;
        for _ in 0..50 {
            let status: serde_json::Value = client
                .get(format!("http://{}/users/u2", server.addr))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if status["emergency"] == "emergency" {
                emergency = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(emergency, "fall was never confirmed");

        let response = client
            .post(format!("http://{}/users/u2/cancel", server.addr))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["outcome"], "cancelled");

        let status: serde_json::Value = client
            .get(format!("http://{}/users/u2", server.addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["emergency"], "normal");

        let stats: serde_json::Value = client
            .get(format!("http://{}/stats", server.addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["sessions"], 1);
        assert_eq!(stats["emergencies"], 1);
        assert_eq!(stats["manual_cancellations"], 1);

        let _ = server.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_sensitivity_update_is_clamped() {
        let server = start().await;
        let client = reqwest::Client::new();

        let response = client
            .put(format!("http://{}/users/u3/config", server.addr))
            .json(&serde_json::json!({"sensitivity": 0}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["sensitivity"], 1);

        client
            .post(format!("http://{}/predict", server.addr))
            .json(&sample("u3", "iot"))
            .send()
            .await
            .unwrap();

        let status: serde_json::Value = client
            .get(format!("http://{}/users/u3", server.addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["sensitivity"], 1);

        let response = client
            .post(format!("http://{}/users/u3/cancel", server.addr))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["outcome"], "not_in_emergency");

        let _ = server.shutdown_tx.send(());
    }
}
