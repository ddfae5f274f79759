use crate::config::DialPolicy;
use crate::error::ProxyError;
use crate::forward::forward;
use crate::process::SupervisorHandle;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) cannot spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts client connections and relays each one to the backend
pub struct ProxyServer {
    listener: TcpListener,
    supervisor: SupervisorHandle,
    forward_addr: String,
    dial: DialPolicy,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listening socket. Failure here means the proxy cannot
    /// provide its service at all.
    pub async fn bind(
        listen_addr: &str,
        forward_addr: impl Into<String>,
        supervisor: SupervisorHandle,
        dial: DialPolicy,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: listen_addr.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            supervisor,
            forward_addr: forward_addr.into(),
            dial,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown is signaled
    pub async fn run(self) -> anyhow::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(addr = %local_addr, forward = %self.forward_addr, "Proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(addr = %addr, "New connection");
                            let supervisor = self.supervisor.clone();
                            let forward_addr = self.forward_addr.clone();
                            let dial = self.dial;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, supervisor, &forward_addr, dial).await {
                                    warn!(addr = %addr, error = %e, "Connection dropped");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Proxy one client connection: make sure the backend is starting, wait
/// until it accepts a connection, then relay bytes until both sides finish.
pub async fn handle_connection(
    client: TcpStream,
    addr: SocketAddr,
    supervisor: SupervisorHandle,
    forward_addr: &str,
    dial: DialPolicy,
) -> Result<(), ProxyError> {
    if !supervisor.request_start() {
        debug!(addr = %addr, "Start request already pending");
    }

    let backend = dial_backend(forward_addr, dial, &supervisor).await?;
    supervisor.record_activity().await;

    let started = Instant::now();
    let stats = forward(client, backend).await;
    supervisor.record_activity().await;

    debug!(
        addr = %addr,
        client_to_backend = stats.client_to_backend,
        backend_to_client = stats.backend_to_client,
        duration_ms = started.elapsed().as_millis(),
        "Connection closed"
    );
    Ok(())
}

/// Connect to the backend, retrying while it is still coming up.
///
/// Every failed attempt repeats the start request, so a backend that died
/// before it started listening is launched again for the clients already
/// waiting on it.
pub async fn dial_backend(
    addr: &str,
    policy: DialPolicy,
    supervisor: &SupervisorHandle,
) -> Result<TcpStream, ProxyError> {
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if attempts > 0 {
                    debug!(
                        addr,
                        attempts,
                        waited_ms = started.elapsed().as_millis(),
                        "Backend accepted connection"
                    );
                }
                return Ok(stream);
            }
            Err(e) => {
                attempts = attempts.saturating_add(1);
                let waited = started.elapsed();
                if !policy.allows_retry(attempts, waited) {
                    return Err(ProxyError::BackendUnreachable {
                        addr: addr.to_string(),
                        attempts,
                        waited,
                    });
                }
                if attempts == 1 {
                    debug!(addr, error = %e, "Backend not accepting connections yet, retrying");
                }
                supervisor.request_start();
            }
        }
        tokio::time::sleep(policy.retry_interval).await;
    }
}
