#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ras::config::ServerConfig;
use ras::session::SessionRegistry;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A server running on an ephemeral localhost port with its own workdir.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: SessionRegistry,
    pub cancel: CancellationToken,
    pub dir: TempDir,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestServer {
    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }

    /// Connect and consume the banner, join notice, and first prompt.
    pub async fn join(&self) -> TestClient {
        let mut client = self.connect().await;
        client.read_until("% ").await;
        client
    }

    /// Cancel the server and wait for `serve` to return, which it does only
    /// after every session task has finished.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(TIMEOUT, handle)
                .await
                .expect("server did not stop")
                .unwrap()
                .unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

/// Start a server after letting the caller adjust the config.
pub async fn start_server_with(adjust: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig {
        bind: "127.0.0.1".parse().unwrap(),
        port: 0,
        default_path: "/bin:/usr/bin".into(),
        workdir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    adjust(&mut config);

    let listener = ras::server::bind(&config).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = SessionRegistry::from_config(&config);
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(ras::server::serve(
        listener,
        Arc::new(config),
        registry.clone(),
        cancel.clone(),
    ));

    TestServer {
        addr,
        registry,
        cancel,
        dir,
        handle: Some(handle),
    }
}

/// A raw TCP client that reads the server's text stream.
pub struct TestClient {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = tokio::time::timeout(TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.stream.local_addr().unwrap().port()
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
    }

    pub async fn send(&mut self, line: &str) {
        self.send_raw(format!("{line}\n").as_bytes()).await;
    }

    /// Read until `pattern` has been seen and return everything up to and
    /// including it. Bytes after the pattern are kept for the next read.
    pub async fn read_until(&mut self, pattern: &str) -> String {
        let pattern = pattern.as_bytes();
        loop {
            if let Some(pos) = find(&self.pending, pattern) {
                let rest = self.pending.split_off(pos + pattern.len());
                let found = std::mem::replace(&mut self.pending, rest);
                return String::from_utf8(found).unwrap();
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(TIMEOUT, self.stream.read(&mut chunk))
                .await
                .unwrap_or_else(|_| {
                    panic!(
                        "timed out waiting for {:?}, have {:?}",
                        String::from_utf8_lossy(pattern),
                        String::from_utf8_lossy(&self.pending)
                    )
                })
                .unwrap();
            assert!(
                n > 0,
                "connection closed waiting for {:?}, have {:?}",
                String::from_utf8_lossy(pattern),
                String::from_utf8_lossy(&self.pending)
            );
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send a command and return its output, without the trailing prompt.
    pub async fn run(&mut self, line: &str) -> String {
        self.send(line).await;
        let out = self.read_until("% ").await;
        out.strip_suffix("% ").unwrap_or(&out).to_string()
    }

    /// Read until the server closes the connection.
    pub async fn read_to_end(&mut self) -> String {
        let mut rest = Vec::new();
        tokio::time::timeout(TIMEOUT, self.stream.read_to_end(&mut rest))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        let mut out = std::mem::take(&mut self.pending);
        out.extend_from_slice(&rest);
        String::from_utf8(out).unwrap()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
