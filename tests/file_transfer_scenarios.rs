//! S4 (download resume after a mid-transfer connection loss, with overall
//! MD5 validation) and S5 (priority preemption of a running package) driven
//! through the real `FileTransferEngine` against loopback fixture servers,
//! following the same pattern as the other scenario suites: exercise the
//! public API over a real socket rather than mocking the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axeda_agent::domain_types::{DeviceId, JobId, Priority, QueueByteBudget, ServerConfigId};
use axeda_agent::file_transfer::instruction::{DownloadInstruction, InstructionContext, InstructionKind, RestartCallback};
use axeda_agent::file_transfer::{FileTransferEngine, Package, PackageState};
use axeda_agent::queue::MessageQueue;
use axeda_agent::user_agent::UserAgent;
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct NoopRestart;
#[async_trait]
impl RestartCallback for NoopRestart {
    async fn restart(&self, _hard: bool) {}
}

fn ctx(base_dir: std::path::PathBuf) -> InstructionContext {
    InstructionContext { user_agent: Arc::new(UserAgent::new(Duration::from_secs(2))), restart_callback: Arc::new(NoopRestart), base_dir }
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn download_resumes_after_mid_transfer_disconnect_and_validates_overall_md5() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let total_len = 1024 * 1024;
    let cut_at = 131_072;
    let content: Vec<u8> = (0..total_len).map(|i| (i % 251) as u8).collect();
    let checksum = {
        let mut hasher = Md5::new();
        hasher.update(&content);
        hex::encode(hasher.finalize())
    };

    let content_for_server = content.clone();
    let server = tokio::spawn(async move {
        // First attempt: send a 200 with the full Content-Length but only the
        // first `cut_at` bytes, then drop the connection (simulated reset).
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_request_head(&mut socket).await;
        assert!(!head.contains("Range:"), "first request must not carry a Range header");
        socket
            .write_all(format!("HTTP/1.1 200 OK\r\nContent-Length: {total_len}\r\nConnection: close\r\n\r\n").as_bytes())
            .await
            .unwrap();
        socket.write_all(&content_for_server[..cut_at]).await.unwrap();
        drop(socket);

        // Retry: expect a Range request resuming exactly where the first
        // attempt left off, and serve the remainder to completion.
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_request_head(&mut socket).await;
        assert!(head.contains(&format!("Range: bytes={cut_at}-")), "expected resume Range header, got: {head}");
        let remaining = &content_for_server[cut_at..];
        socket
            .write_all(format!("HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", remaining.len()).as_bytes())
            .await
            .unwrap();
        socket.write_all(remaining).await.unwrap();
    });

    let work_dir = tempfile::tempdir().unwrap();
    let mut attrs = HashMap::new();
    attrs.insert("jobId".to_string(), "1".to_string());
    attrs.insert("url".to_string(), format!("http://127.0.0.1:{}/pkg/data.bin", addr.port()));
    attrs.insert("name".to_string(), "data.bin".to_string());
    attrs.insert("checksum".to_string(), checksum);
    attrs.insert("retryCount".to_string(), "3".to_string());
    attrs.insert("retryMinDelay".to_string(), "1".to_string());
    attrs.insert("retryMaxDelay".to_string(), "10".to_string());

    let instruction = InstructionKind::Download(DownloadInstruction::from_attrs(&attrs, work_dir.path()).unwrap());
    let package = Package::new(JobId::new(1), DeviceId::new(0), ServerConfigId::new(0), vec![instruction]);

    let queue = MessageQueue::new(QueueByteBudget::try_new(65_536).unwrap());
    let mut engine = FileTransferEngine::new(queue.clone(), ctx(work_dir.path().to_path_buf()));
    engine.submit(package);
    engine.process().await;

    tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();

    assert_eq!(engine.package_count(), 0, "package should have reached a terminal state and been reaped");
    assert_eq!(queue.len().await, 1);

    let written = tokio::fs::read(work_dir.path().join("data.bin")).await.unwrap();
    assert_eq!(written, content);
}

#[tokio::test]
async fn higher_priority_package_preempts_running_package_at_its_next_safe_point() {
    use axeda_agent::file_transfer::instruction::AgentRestartInstruction;

    let queue = MessageQueue::new(QueueByteBudget::try_new(65_536).unwrap());
    let work_dir = tempfile::tempdir().unwrap();
    let mut engine = FileTransferEngine::new(queue.clone(), ctx(work_dir.path().to_path_buf()));

    // Package A has two instructions, so it's still mid-package (not yet
    // terminal) after completing the first one.
    let restart_attrs = HashMap::new();
    let a = Package::new(
        JobId::new(1),
        DeviceId::new(0),
        ServerConfigId::new(0),
        vec![
            InstructionKind::AgentRestart(AgentRestartInstruction::from_attrs(&restart_attrs)),
            InstructionKind::AgentRestart(AgentRestartInstruction::from_attrs(&restart_attrs)),
        ],
    );
    engine.submit(a);

    // First tick: A starts and finishes its first (of two) instructions.
    engine.process().await;
    assert_eq!(engine.package_count(), 1, "A should still be in flight, not yet reaped");
    assert_eq!(engine.package_state(JobId::new(1)), Some(PackageState::Started));

    let mut b = Package::new(JobId::new(2), DeviceId::new(0), ServerConfigId::new(0), vec![]);
    b.add_instruction(InstructionKind::AgentRestart(AgentRestartInstruction::from_attrs(&restart_attrs)), Priority::Urgent);
    engine.submit(b);

    // B sorts ahead of A by priority. `AgentRestartInstruction::is_pending_request`
    // is always false, so A reaches a safe point immediately and is preempted
    // the moment preemption is evaluated, and B then runs to completion in the
    // same tick.
    engine.process().await;

    assert_eq!(engine.package_state(JobId::new(1)), Some(PackageState::Preempted));
    assert_eq!(engine.package_state(JobId::new(2)), None, "B should have run to completion and been reaped");
}
