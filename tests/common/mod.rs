//! Shared fixtures for integration tests: a minimal in-process SOCKS5
//! proxy (no-auth, CONNECT only) and helpers to run a configured load test.
#![allow(dead_code)]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use proxy_loadtest::client::build_client;
use proxy_loadtest::config::RunConfig;
use proxy_loadtest::driver::RequestDriver;
use proxy_loadtest::fd_sampler::build_sampler;
use proxy_loadtest::orchestrator::{Orchestrator, RunOutcome};

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 proxy running on a background task. Aborted on drop.
pub struct Socks5Proxy {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl Socks5Proxy {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = serve_client(stream).await;
                });
            }
        });

        Self {
            addr,
            accepted,
            handle,
        }
    }

    /// Accepts connections and never answers the greeting.
    pub async fn black_hole() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        Self {
            addr,
            accepted,
            handle,
        }
    }

    /// `host:port`, as passed to `PROXY_ADDR`.
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for Socks5Proxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn reply(stream: &mut TcpStream, code: u8) -> io::Result<()> {
    stream
        .write_all(&[0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
}

async fn serve_client(mut inbound: TcpStream) -> io::Result<()> {
    inbound.set_nodelay(true).ok();

    // Greeting: VER NMETHODS METHODS
    let mut head = [0u8; 2];
    inbound.read_exact(&mut head).await?;
    if head[0] != 0x05 {
        return Ok(());
    }
    let mut methods = vec![0u8; head[1] as usize];
    inbound.read_exact(&mut methods).await?;
    if !methods.contains(&0x00) {
        inbound.write_all(&[0x05, 0xFF]).await?;
        return Ok(());
    }
    inbound.write_all(&[0x05, 0x00]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut req = [0u8; 4];
    inbound.read_exact(&mut req).await?;
    if req[1] != 0x01 {
        return reply(&mut inbound, REPLY_COMMAND_NOT_SUPPORTED).await;
    }

    let host = match req[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            inbound.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let len = inbound.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            inbound.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            inbound.read_exact(&mut ip).await?;
            format!("[{}]", Ipv6Addr::from(ip))
        }
        _ => return reply(&mut inbound, REPLY_ADDRESS_NOT_SUPPORTED).await,
    };
    let port = inbound.read_u16().await?;

    let mut outbound = match TcpStream::connect(format!("{}:{}", host, port)).await {
        Ok(s) => s,
        Err(_) => return reply(&mut inbound, REPLY_CONNECTION_REFUSED).await,
    };
    reply(&mut inbound, REPLY_SUCCEEDED).await?;

    io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    Ok(())
}

/// A local address nothing listens on: bound, then released.
pub fn refusing_proxy_addr() -> String {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

pub fn tool_available(program: &str, probe_arg: &str) -> bool {
    std::process::Command::new(program)
        .arg(probe_arg)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn curl_available() -> bool {
    tool_available("curl", "--version")
}

pub fn lsof_available() -> bool {
    tool_available("lsof", "-v") || tool_available("lsof", "-h")
}

/// Wires client, driver, sampler and orchestrator the way the binary does.
pub async fn run_load(config: &RunConfig) -> RunOutcome {
    config.validate().expect("test config must be valid");

    let client = build_client(&config.to_client_config()).expect("client builds");
    let driver = RequestDriver::new(client, config.hard_timeout_grace)
        .with_expected_body(config.expected_body.clone().map(String::into_bytes));

    let mut orchestrator =
        Orchestrator::new(Arc::new(driver), config.request_spec(), config.concurrency)
            .with_launch(config.launch);
    if let Some(pid) = config.monitor_pid {
        orchestrator =
            orchestrator.with_fd_monitor(build_sampler(config.sampler, config.sampler_timeout), pid);
    }

    orchestrator.run(&config.mode()).await
}
