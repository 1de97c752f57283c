//! In-process HTTP target for self-contained runs: answers every GET with a
//! fixed payload so success can be checked against the body, not only the
//! status code.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Payload served when none is configured.
pub const DEFAULT_PAYLOAD: &[u8] = b"Hello from SOCKS5 test server!";

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Failed to bind target fixture on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },
}

/// Running fixture. Stops when [`stop`](TargetFixture::stop)ped or dropped.
pub struct TargetFixture {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

async fn respond(req: Request<Body>, payload: Bytes) -> Result<Response<Body>, Infallible> {
    let mut response = if req.method() == Method::GET {
        Response::new(Body::from(payload))
    } else {
        let mut r = Response::new(Body::from("method not allowed"));
        *r.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        r
    };
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    Ok(response)
}

impl TargetFixture {
    /// Binds `addr` (port 0 picks a free port) and serves in the background.
    pub async fn start(addr: SocketAddr, payload: impl Into<Bytes>) -> Result<Self, FixtureError> {
        let payload: Bytes = payload.into();

        let make_svc = make_service_fn(move |_conn| {
            let payload = payload.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| respond(req, payload.clone())))
            }
        });

        let server = Server::try_bind(&addr)
            .map_err(|source| FixtureError::Bind { addr, source })?
            .serve(make_svc);
        let local_addr = server.local_addr();

        let (tx, rx) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async {
            let _ = rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(e) = graceful.await {
                error!(error = %e, "Target fixture error");
            }
            debug!(addr = %local_addr, "Target fixture stopped");
        });

        info!(addr = %local_addr, "Target fixture listening");

        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://<addr>/`
    pub fn url(&self) -> String {
        format!("http://{}/", self.local_addr)
    }

    /// Stops accepting connections and waits for in-flight ones to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TargetFixture {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
