#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Request server round trips over a real Unix socket.

mod common;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use inbd::request::UpdateResponse;
use inbd::server::RequestServer;
use inbd_core::exec::SHUTDOWN;

use common::{EMT, MB, Sandbox, runner_for};

struct Client {
    lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    write: tokio::net::unix::OwnedWriteHalf,
}

impl Client {
    async fn connect(path: &std::path::Path) -> Self {
        let (read, write) = UnixStream::connect(path).await.unwrap().into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn send(&mut self, request: &str) -> UpdateResponse {
        self.write.write_all(request.as_bytes()).await.unwrap();
        self.write.write_all(b"\n").await.unwrap();
        let line = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

#[tokio::test]
async fn config_commands_over_socket() {
    let sandbox = Sandbox::new();
    let orch = Arc::new(sandbox.orchestrator(runner_for(EMT), 10 * MB));
    let socket = sandbox.dir.path().join("run/inbd.sock");
    let server = RequestServer::bind(Arc::clone(&orch), &socket).unwrap();
    let handle = tokio::spawn(server.serve());

    let mut client = Client::connect(&socket).await;

    let resp = client
        .send(r#"{"command":"AppendConfig","path":"os_updater.trustedRepositories:https://mirror.example.org/"}"#)
        .await;
    assert_eq!(resp, UpdateResponse::ok());

    let resp = client
        .send(r#"{"command":"GetConfig","path":"os_updater.trustedRepositories"}"#)
        .await;
    assert_eq!(resp.status_code, UpdateResponse::OK);
    let repos: Vec<String> = serde_json::from_str(resp.value.as_deref().unwrap()).unwrap();
    assert_eq!(
        repos,
        vec![
            "https://repo.example.com/".to_string(),
            "https://mirror.example.org/".to_string()
        ]
    );

    let resp = client
        .send(r#"{"command":"SetConfig","path":"os_updater.proceedWithoutRollback:false"}"#)
        .await;
    assert_eq!(resp, UpdateResponse::ok());
    assert!(!orch.config().os_updater().await.unwrap().proceed_without_rollback);

    let resp = client
        .send(r#"{"command":"SetConfig","path":"os_updater.proceedWithoutRollback:maybe"}"#)
        .await;
    assert_eq!(resp.status_code, UpdateResponse::BAD_REQUEST);

    let resp = client
        .send(r#"{"command":"AppendConfig","path":"os_updater.proceedWithoutRollback:true"}"#)
        .await;
    assert_eq!(resp.status_code, UpdateResponse::BAD_REQUEST);

    let resp = client.send("not json").await;
    assert_eq!(resp.status_code, UpdateResponse::BAD_REQUEST);

    handle.abort();
}

#[tokio::test]
async fn power_off_and_update_over_socket() {
    let sandbox = Sandbox::new();
    let orch = Arc::new(sandbox.orchestrator(runner_for(EMT), 10 * MB));
    let socket = sandbox.dir.path().join("run/inbd.sock");
    let server = RequestServer::bind(Arc::clone(&orch), &socket).unwrap();
    let handle = tokio::spawn(server.serve());

    let mut client = Client::connect(&socket).await;
    let resp = client
        .send(r#"{"command":"SetPowerState","state":"OFF"}"#)
        .await;
    assert_eq!(resp, UpdateResponse::ok());
    assert!(orch.runner().ran(&[SHUTDOWN, "now"]));

    let resp = client
        .send(r#"{"command":"UpdateSystemSoftware","mode":"FULL","url":"ftp://repo.example.com/a.raw"}"#)
        .await;
    assert_eq!(resp.status_code, UpdateResponse::BAD_REQUEST);

    let resp = client
        .send(r#"{"command":"LoadConfig","uri":"https://evil.example.net/c.json"}"#)
        .await;
    assert_eq!(resp.status_code, UpdateResponse::INTERNAL);
    assert!(resp.error.contains("trusted"));

    handle.abort();
}
