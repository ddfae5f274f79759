//! Integration tests for lazyproxy

#![cfg(unix)]

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};

use lazyproxy::config::{BackendSpec, DialPolicy, ExitPolicy};
use lazyproxy::error::SupervisorError;
use lazyproxy::process::{BackendState, BackendStatus, Supervisor, SupervisorHandle, SupervisorSettings};
use lazyproxy::proxy::ProxyServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const ECHO_BACKEND: &str = env!("CARGO_BIN_EXE_echo-backend");
const LAZYPROXY: &str = env!("CARGO_BIN_EXE_lazyproxy");

/// Find a port nothing is listening on
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Wait until nothing accepts connections on a port any more
async fn wait_for_port_closed(port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn echo_spec(forward_port: u16) -> BackendSpec {
    BackendSpec::new(ECHO_BACKEND, "127.0.0.1:0", format!("127.0.0.1:{}", forward_port))
}

struct TestProxy {
    addr: SocketAddr,
    supervisor: SupervisorHandle,
    supervisor_task: JoinHandle<Result<(), SupervisorError>>,
    shutdown_tx: watch::Sender<bool>,
    proxy_task: JoinHandle<()>,
}

impl TestProxy {
    async fn start(spec: BackendSpec, idle_timeout: Duration, exit_policy: ExitPolicy) -> Self {
        let settings = SupervisorSettings {
            idle_timeout,
            idle_check_interval: Duration::from_millis(25),
            stop_grace_period: Duration::from_secs(2),
            exit_policy,
        };
        let forward = spec.forward.clone();
        let (supervisor, supervisor_task) = Supervisor::spawn(spec, settings);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let proxy = ProxyServer::bind(
            "127.0.0.1:0",
            forward,
            supervisor.clone(),
            DialPolicy::default(),
            shutdown_rx,
        )
        .await
        .unwrap();
        let addr = proxy.local_addr().unwrap();
        let proxy_task = tokio::spawn(async move {
            proxy.run().await.unwrap();
        });

        Self {
            addr,
            supervisor,
            supervisor_task,
            shutdown_tx,
            proxy_task,
        }
    }

    async fn status(&self) -> BackendStatus {
        self.supervisor.status().await.expect("supervisor running")
    }

    async fn wait_for_state(&self, state: BackendState, timeout: Duration) -> BackendStatus {
        let start = Instant::now();
        loop {
            let status = self.status().await;
            if status.state == state {
                return status;
            }
            assert!(
                start.elapsed() < timeout,
                "backend stuck in {:?}, expected {:?}",
                status.state,
                state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.supervisor.shutdown().await;
        let _ = self.proxy_task.await;
        let _ = self.supervisor_task.await;
    }
}

/// Send `payload` through the proxy and read back the echo
async fn echo_roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut reply))
        .await
        .expect("echo timed out")
        .unwrap();
    reply
}

// ============================================================================
// Lifecycle through the proxy
// ============================================================================

#[tokio::test]
async fn test_ping_then_idle_stop() {
    let port = free_port().await;
    let proxy = TestProxy::start(echo_spec(port), Duration::from_millis(200), ExitPolicy::Terminate).await;

    assert_eq!(proxy.status().await.state, BackendState::Stopped);

    let reply = echo_roundtrip(proxy.addr, b"ping").await;
    assert_eq!(reply, b"ping");

    let status = proxy.status().await;
    assert_eq!(status.state, BackendState::Running);
    assert_eq!(status.launches, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let status = proxy.wait_for_state(BackendState::Stopped, Duration::from_secs(2)).await;
    assert_eq!(status.launches, 1);
    assert!(wait_for_port_closed(port, Duration::from_secs(2)).await);

    proxy.stop().await;
}

#[tokio::test]
async fn test_two_clients_share_one_backend() {
    let port = free_port().await;
    let proxy = TestProxy::start(echo_spec(port), Duration::from_secs(30), ExitPolicy::Terminate).await;

    let first = tokio::spawn(echo_roundtrip(proxy.addr, b"first client"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = tokio::spawn(echo_roundtrip(proxy.addr, b"second client"));

    assert_eq!(first.await.unwrap(), b"first client");
    assert_eq!(second.await.unwrap(), b"second client");

    let status = proxy.status().await;
    assert_eq!(status.state, BackendState::Running);
    assert_eq!(status.launches, 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_restart_after_idle_stop() {
    let port = free_port().await;
    let proxy = TestProxy::start(echo_spec(port), Duration::from_millis(200), ExitPolicy::Terminate).await;

    assert_eq!(echo_roundtrip(proxy.addr, b"one").await, b"one");
    let first_pid = proxy.status().await.pid;
    proxy.wait_for_state(BackendState::Stopped, Duration::from_secs(3)).await;

    // Idle stop is planned: the proxy keeps serving
    assert_eq!(echo_roundtrip(proxy.addr, b"two").await, b"two");
    let status = proxy.status().await;
    assert_eq!(status.state, BackendState::Running);
    assert_eq!(status.launches, 2);
    assert_ne!(status.pid, first_pid);

    proxy.stop().await;
}

#[tokio::test]
async fn test_client_waits_for_slow_backend() {
    let port = free_port().await;
    let spec = echo_spec(port).with_env("STARTUP_DELAY_MS", "500");
    let proxy = TestProxy::start(spec, Duration::from_secs(30), ExitPolicy::Terminate).await;

    let started = Instant::now();
    let reply = echo_roundtrip(proxy.addr, b"patience").await;
    assert_eq!(reply, b"patience");
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(proxy.status().await.launches, 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_large_payload_relayed_intact() {
    let port = free_port().await;
    let proxy = TestProxy::start(echo_spec(port), Duration::from_secs(30), ExitPolicy::Terminate).await;

    let payload: Vec<u8> = (0..256 * 1024u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut reader, mut writer) = stream.split();

    let send = async {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
    };
    let receive = async {
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        received
    };
    let (_, received) = tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(send, receive) })
        .await
        .expect("relay timed out");

    assert_eq!(received.len(), payload.len());
    assert!(received == payload);

    proxy.stop().await;
}

// ============================================================================
// Backend exit handling
// ============================================================================

#[tokio::test]
async fn test_backend_crash_stops_supervisor() {
    let port = free_port().await;
    let proxy = TestProxy::start(echo_spec(port), Duration::from_secs(30), ExitPolicy::Terminate).await;

    let mut first = TcpStream::connect(proxy.addr).await.unwrap();
    let mut second = TcpStream::connect(proxy.addr).await.unwrap();
    for stream in [&mut first, &mut second] {
        stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
    }

    let pid = proxy.status().await.pid.expect("backend running");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }

    let TestProxy {
        supervisor_task,
        shutdown_tx,
        proxy_task,
        ..
    } = proxy;

    let result = tokio::time::timeout(Duration::from_secs(5), supervisor_task)
        .await
        .expect("supervisor should stop after backend crash")
        .unwrap();
    assert!(matches!(result, Err(SupervisorError::BackendExited { .. })));

    // Relays against the dead backend wind down on their own
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), first.read_to_end(&mut buf)).await;
    assert!(read.is_ok());

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;
}

#[tokio::test]
async fn test_backend_crash_with_restart_policy() {
    let port = free_port().await;
    let proxy = TestProxy::start(echo_spec(port), Duration::from_secs(30), ExitPolicy::Restart).await;

    assert_eq!(echo_roundtrip(proxy.addr, b"before").await, b"before");
    let pid = proxy.status().await.pid.expect("backend running");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    proxy.wait_for_state(BackendState::Stopped, Duration::from_secs(5)).await;

    assert_eq!(echo_roundtrip(proxy.addr, b"after").await, b"after");
    assert_eq!(proxy.status().await.launches, 2);

    proxy.stop().await;
}

#[tokio::test]
async fn test_waiting_client_served_after_failed_first_launch() {
    let port = free_port().await;
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("crashed-once");

    // First launch dies before listening, the next one serves
    let script = r#"if [ -f "$MARKER" ]; then exec "$ECHO_BACKEND"; fi; touch "$MARKER"; exit 1"#;
    let spec = BackendSpec::new("sh", "127.0.0.1:0", format!("127.0.0.1:{}", port))
        .with_args(["-c", script])
        .with_env("MARKER", marker.display().to_string())
        .with_env("ECHO_BACKEND", ECHO_BACKEND);
    let proxy = TestProxy::start(spec, Duration::from_secs(30), ExitPolicy::Restart).await;

    let reply = echo_roundtrip(proxy.addr, b"ping").await;
    assert_eq!(reply, b"ping");
    assert!(marker.exists());

    let status = proxy.status().await;
    assert_eq!(status.state, BackendState::Running);
    assert_eq!(status.launches, 2);

    proxy.stop().await;
}

// ============================================================================
// Binary
// ============================================================================

#[tokio::test]
async fn test_binary_requires_settings() {
    let output = tokio::process::Command::new(LAZYPROXY)
        .arg("--idle")
        .arg("1m")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("listen"), "stderr: {}", stderr);
}

#[tokio::test]
async fn test_binary_exits_nonzero_when_backend_dies() {
    let listen_port = free_port().await;
    let forward_port = free_port().await;

    let mut child = tokio::process::Command::new(LAZYPROXY)
        .args(["--idle", "1m", "--check-interval", "100ms"])
        .args(["--listen", &format!("127.0.0.1:{}", listen_port)])
        .args(["--forward", &format!("127.0.0.1:{}", forward_port)])
        .args(["--", "sh", "-c", "exit 7"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    assert!(wait_for_port(listen_port, Duration::from_secs(10)).await);
    // Any connection triggers the launch; the backend then dies at once
    let _client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("proxy should exit")
        .unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn test_binary_serves_and_shuts_down_on_sigterm() {
    let listen_port = free_port().await;
    let forward_port = free_port().await;

    let mut child = tokio::process::Command::new(LAZYPROXY)
        .args(["--idle", "1m"])
        .args(["--listen", &format!("127.0.0.1:{}", listen_port)])
        .args(["--forward", &format!("127.0.0.1:{}", forward_port)])
        .arg(ECHO_BACKEND)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    assert!(wait_for_port(listen_port, Duration::from_secs(10)).await);
    let addr: SocketAddr = format!("127.0.0.1:{}", listen_port).parse().unwrap();
    assert_eq!(echo_roundtrip(addr, b"through the binary").await, b"through the binary");

    let pid = child.id().unwrap();
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("proxy should exit")
        .unwrap();
    assert!(status.success());

    // The backend went down with it
    assert!(wait_for_port_closed(forward_port, Duration::from_secs(2)).await);
}
