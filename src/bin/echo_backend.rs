//! Minimal TCP echo server, handy as a demo backend for lazyproxy
//!
//! Environment variables:
//! - PORT: Port to listen on (required, set by lazyproxy from --forward)
//! - STARTUP_DELAY_MS: Delay before the listener is opened (default: 0)

use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = env::var("PORT")
        .map_err(|_| anyhow::anyhow!("PORT environment variable required"))?
        .parse()
        .map_err(|e| anyhow::anyhow!("PORT must be a valid port number: {}", e))?;

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if startup_delay > 0 {
        eprintln!("echo-backend: sleeping for {}ms before listening", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    eprintln!("echo-backend: listening on port {} (pid {})", port, std::process::id());

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(echo(stream));
            }
            Err(e) => {
                eprintln!("echo-backend: accept error: {}", e);
            }
        }
    }
}

async fn echo(mut stream: TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if stream.write_all(&buf[..n]).await.is_err() {
            return;
        }
    }
}
