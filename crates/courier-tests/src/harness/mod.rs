//! A client/server pair wired over an in-memory connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use courier::testing::{self, PairedConnection};
use courier::{Client, ClientConfig, Server, ServerConfig};
use courier_protocol::{ErrorDetail, StatusMessage};

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("courier=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Retry settings short enough for timing tests without flaking.
pub fn fast_client_config() -> ClientConfig {
    ClientConfig {
        ack_retry_delay: Duration::from_millis(50),
        max_ack_retries: 4,
        id_generator: None,
    }
}

pub fn fast_server_config(max_sender_inactivity: Duration) -> ServerConfig {
    ServerConfig {
        ack_retry_delay: Duration::from_millis(50),
        max_ack_retries: 4,
        max_sender_inactivity,
        id_generator: None,
    }
}

/// An opened client and server sharing an in-memory connection pair.
pub struct TestEnv {
    pub client: Client,
    pub server: Server,
    pub client_conn: Arc<PairedConnection>,
    pub server_conn: Arc<PairedConnection>,
}

impl TestEnv {
    pub async fn start() -> Result<Self> {
        Self::start_with(fast_client_config(), fast_server_config(Duration::from_secs(30))).await
    }

    pub async fn start_with(
        client_config: ClientConfig,
        server_config: ServerConfig,
    ) -> Result<Self> {
        init_tracing();
        let (client_conn, server_conn) = testing::pair();
        let server = Server::new(server_conn.clone(), server_config);
        let client = Client::new(client_conn.clone(), client_config);
        server.open().await?;
        client.open().await?;
        Ok(Self {
            client,
            server,
            client_conn,
            server_conn,
        })
    }
}

/// Extract the data from a success status, or panic.
pub fn unwrap_success(status: StatusMessage) -> serde_json::Value {
    match status {
        StatusMessage::Success { data, .. } => data,
        other => panic!("expected success status, got {other:?}"),
    }
}

/// Extract the error from a fail status, or panic.
pub fn unwrap_fail(status: StatusMessage) -> ErrorDetail {
    match status {
        StatusMessage::Fail { error, .. } => error,
        other => panic!("expected fail status, got {other:?}"),
    }
}
