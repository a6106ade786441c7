use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde_json::{json, Value};
use tempfile::tempdir;

use tidepool::crypto::canonical_envelope_bytes;
use tidepool::{api, AppState, Config};

/// A device-side identity for driving the signed-request protocol in tests
pub struct TestDevice {
    pub signing_key: SigningKey,
    pub public_key: String,
    pub hardware_hash: String,
}

impl TestDevice {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = hex::encode(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            public_key,
            hardware_hash: hex::encode(rand::random::<[u8; 16]>()),
        }
    }

    /// Build a signed envelope with a current timestamp
    pub fn envelope(&self, payload: Value, nonce: Option<String>) -> Value {
        self.envelope_at(payload, Utc::now().timestamp_millis(), nonce)
    }

    /// Build a signed envelope with an explicit timestamp (for freshness tests)
    pub fn envelope_at(&self, payload: Value, timestamp: i64, nonce: Option<String>) -> Value {
        let message =
            canonical_envelope_bytes(&payload, timestamp, &self.hardware_hash, nonce.as_deref())
                .expect("canonicalization");
        let signature = hex::encode(self.signing_key.sign(&message).to_bytes());

        json!({
            "payload": payload,
            "timestamp": timestamp,
            "hardware_hash": self.hardware_hash,
            "public_key": self.public_key,
            "signature": signature,
            "nonce": nonce,
        })
    }
}

/// Start a server on a random port with the given genesis keys
pub async fn spawn_test_server(genesis_keys: &[&str]) -> (SocketAddr, Arc<AppState>) {
    let dir = tempdir().expect("temp dir");
    let config = Config {
        data_dir: dir.keep(),
        host: "127.0.0.1".into(),
        port: 0,
        genesis_keys: genesis_keys.iter().map(|k| k.to_lowercase()).collect(),
        ..Config::default()
    };

    let state = AppState::new(config);
    let app = api::router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    // Give server time to start
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    (addr, state)
}
