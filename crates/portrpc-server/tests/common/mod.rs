// Shared fixtures for the server integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use portrpc_common::payload::{Codec, JsonCodec};
use portrpc_common::transport::Listener;
use portrpc_server::{MethodSet, Server, Service};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize)]
pub struct Operands {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub result: i64,
}

pub struct Calculator;

impl Calculator {
    async fn add(self: Arc<Self>, _: CancellationToken, req: Operands) -> Result<Answer, String> {
        Ok(Answer { result: req.a + req.b })
    }

    async fn divide(self: Arc<Self>, _: CancellationToken, req: Operands) -> Result<Answer, String> {
        if req.b == 0 {
            return Err("division by zero".to_string());
        }
        Ok(Answer { result: req.a / req.b })
    }

    /// Blocks until the call is cancelled.
    async fn wait(self: Arc<Self>, cancel: CancellationToken, _: Operands) -> Result<Answer, String> {
        cancel.cancelled().await;
        Err("cancelled".to_string())
    }

    async fn slow_add(self: Arc<Self>, _: CancellationToken, req: Operands) -> Result<Answer, String> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Answer { result: req.a + req.b })
    }
}

impl Service for Calculator {
    fn methods<C: Codec>(methods: &mut MethodSet<Self, C>) {
        methods
            .method("Add", Self::add)
            .method("Divide", Self::divide)
            .method("Wait", Self::wait)
            .method("SlowAdd", Self::slow_add);
    }
}

pub fn operands(a: i64, b: i64) -> Operands {
    Operands { a, b }
}

/// Registers a [`Calculator`] and serves `listener` on a background task.
pub fn start_calculator(listener: Arc<dyn Listener>) -> (Arc<Server<JsonCodec>>, JoinHandle<portrpc_common::Result<()>>) {
    let server = Arc::new(Server::new(JsonCodec));
    server.register(Calculator).unwrap();

    let running = server.clone();
    let handle = tokio::spawn(async move { running.start(&CancellationToken::new(), listener).await });
    (server, handle)
}

/// Closes `server` and waits for its accept loop to finish.
pub async fn stop(server: &Server<JsonCodec>, handle: JoinHandle<portrpc_common::Result<()>>) {
    server.close().unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}
