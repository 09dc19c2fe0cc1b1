//! Server and controller exercised together over a real socket.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{ControllerConfig, LeaseController},
    server::{self, ServerConfig},
    Result,
};

mod controller;

pub struct TestServer {
    pub url: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        Self::start_with(ServerConfig::default()).await
    }

    pub async fn start_with_ttl(ttl: Duration) -> TestServer {
        Self::start_with(ServerConfig {
            ttl,
            ..Default::default()
        })
        .await
    }

    pub async fn start_with(config: ServerConfig) -> TestServer {
        let listener = server::bind("127.0.0.1", 0).await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server::serve(listener, config, cancel.clone()));
        TestServer { url, cancel, task }
    }

    pub fn controller(&self) -> LeaseController {
        LeaseController::new(ControllerConfig {
            url: self.url.clone(),
            ..Default::default()
        })
        .unwrap()
    }

    pub fn lease_url(&self, name: &str, owner: &str) -> String {
        format!("{}/lease/{}?owner={}", self.url, name, owner)
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await?
    }
}
