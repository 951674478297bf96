//! Default health endpoint
//!
//! A tiny HTTP responder the registry polls when a service registers with
//! the default health target. It binds on all interfaces at a random port
//! from a fixed range and answers `GET /ping` with `pong`.

use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Range;

use axum::routing::get;
use axum::Router;
use regcache_common::protocol::{RegcacheError, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::random::RandomSource;

pub const PING_PATH: &str = "/ping";
pub const PING_BODY: &str = "pong";

/// Random ports tried before giving up.
const MAX_BIND_ATTEMPTS: usize = 32;

/// Running health responder.
pub struct HealthEndpoint {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl HealthEndpoint {
    /// Binds `0.0.0.0` on a random port from `ports`, retrying other ports
    /// when one is taken.
    pub async fn bind(ports: Range<u16>, random: &RandomSource) -> Result<Self> {
        if ports.is_empty() {
            return Err(RegcacheError::Configuration(format!(
                "health port range {:?} is empty",
                ports
            )));
        }

        let mut last_error = None;
        for _ in 0..MAX_BIND_ATTEMPTS {
            let port = random.between(i64::from(ports.start), i64::from(ports.end)) as u16;
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            match TcpListener::bind(addr).await {
                Ok(listener) => return Self::serve(listener),
                Err(e) => {
                    debug!("Health port {} unavailable: {}", port, e);
                    last_error = Some(e);
                }
            }
        }

        Err(RegcacheError::Transport(format!(
            "no free health port in {:?} after {} attempts: {}",
            ports,
            MAX_BIND_ATTEMPTS,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Binds an explicit address (port 0 picks an ephemeral port).
    pub async fn bind_addr(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RegcacheError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        Self::serve(listener)
    }

    fn serve(listener: TcpListener) -> Result<Self> {
        let addr = listener
            .local_addr()
            .map_err(|e| RegcacheError::Transport(format!("Failed to get local addr: {}", e)))?;

        let app = router();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Health endpoint on {} stopped: {}", addr, e);
            }
        });

        info!("Health endpoint listening on {}", addr);
        Ok(Self { addr, handle })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL the registry should poll, as seen from `host`.
    pub fn url_for(&self, host: &str) -> String {
        ping_url(host, self.port())
    }

    /// Stops serving.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// `http://<host>:<port>/ping`
pub fn ping_url(host: &str, port: u16) -> String {
    format!("http://{}:{}{}", host, port, PING_PATH)
}

fn router() -> Router {
    Router::new()
        .route(PING_PATH, get(ping))
        .layer(TraceLayer::new_for_http())
}

async fn ping() -> &'static str {
    PING_BODY
}
