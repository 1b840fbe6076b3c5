//! In-process SOCKS5 proxy that answers HTTP requests itself.
//!
//! Stands in for a ready engine inbound: it accepts the SOCKS handshake,
//! ignores the requested destination and answers the tunnelled HTTP request
//! according to a script.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What to do with the n-th tunnelled request. The last entry repeats.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    NoContent { delay: Duration },
    Status(u16),
    Hangup,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::NoContent {
            delay: Duration::ZERO,
        }
    }
}

pub struct FakeProxy {
    pub port: u16,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeProxy {
    pub async fn start(script: Vec<Reply>) -> Self {
        assert!(!script.is_empty());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let script = Arc::new(script);

        let counter = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let counter = Arc::clone(&counter);
                let script = Arc::clone(&script);
                tokio::spawn(async move {
                    let _ = serve(stream, &counter, &script).await;
                });
            }
        });

        Self { port, requests, task }
    }

    /// Tunnelled HTTP requests seen so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for FakeProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, counter: &AtomicUsize, script: &[Reply]) -> std::io::Result<()> {
    // Greeting. Readiness checks connect and hang up here.
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[5, 0]).await?;

    // CONNECT request.
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    match req[3] {
        1 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
        }
        3 => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
        }
        4 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
        }
        _ => return Ok(()),
    }
    let _port = stream.read_u16().await?;
    stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;

    // Tunnelled HTTP request headers.
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Ok(());
        }
        buf.push(byte[0]);
    }

    let n = counter.fetch_add(1, Ordering::SeqCst);
    match script[n.min(script.len() - 1)] {
        Reply::NoContent { delay } => {
            tokio::time::sleep(delay).await;
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
        }
        Reply::Status(code) => {
            let response = format!("HTTP/1.1 {code} Scripted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            stream.write_all(response.as_bytes()).await?;
        }
        Reply::Hangup => return Ok(()),
    }
    stream.shutdown().await
}

/// A loopback port with nothing listening on it.
pub fn closed_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

/// Whether a process with `pid` still exists (Linux only).
pub fn process_exists(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}
