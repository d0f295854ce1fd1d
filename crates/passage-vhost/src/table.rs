//! Routing table shared by the HTTP and HTTPS virtual-host routers.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Any bidirectional byte stream we can splice traffic into.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

impl fmt::Debug for dyn IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxedStream")
    }
}

pub type BoxedStream = Box<dyn IoStream>;

/// Supplies the backend stream for a matched route, typically by pulling a
/// work connection from the tunnel that registered it.
#[async_trait]
pub trait RouteTarget: Send + Sync {
    async fn open(&self) -> io::Result<BoxedStream>;
}

#[derive(Debug, Error)]
pub enum VhostError {
    #[error("route for host {host} location {location} already exists")]
    RouteInUse { host: String, location: String },

    #[error("no route for host {0}")]
    NoRoute(String),

    #[error("malformed request: {0}")]
    InvalidRequest(String),

    #[error("could not extract SNI from client hello")]
    SniExtraction,

    #[error("timed out reading request")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Registration record for one virtual host binding.
#[derive(Clone)]
pub struct VhostRoute {
    pub host: String,
    /// Path prefix; empty matches everything (used by SNI routes).
    pub location: String,
    /// Name of the owning proxy, for logs.
    pub name: String,
    /// Replacement Host header, when the tunnel asked for a rewrite.
    pub rewrite_host: Option<String>,
}

struct Route {
    binding: VhostRoute,
    target: Arc<dyn RouteTarget>,
}

/// Result of a successful lookup.
pub struct RouteMatch {
    pub name: String,
    pub rewrite_host: Option<String>,
    pub target: Arc<dyn RouteTarget>,
}

/// Host/path routing table. Longest matching location wins; ties go to the
/// earliest registration.
pub struct RouteTable {
    routes: Mutex<Vec<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
        }
    }

    pub fn register(
        &self,
        binding: VhostRoute,
        target: Arc<dyn RouteTarget>,
    ) -> Result<(), VhostError> {
        let mut routes = self.routes.lock().unwrap();
        if routes
            .iter()
            .any(|r| r.binding.host == binding.host && r.binding.location == binding.location)
        {
            return Err(VhostError::RouteInUse {
                host: binding.host,
                location: binding.location,
            });
        }

        debug!(
            "registered vhost route {}{} -> {}",
            binding.host, binding.location, binding.name
        );
        routes.push(Route { binding, target });
        Ok(())
    }

    pub fn unregister(&self, host: &str, location: &str) {
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|r| !(r.binding.host == host && r.binding.location == location));
    }

    /// Find the route for `host` + `path`. Strictly-longer prefixes win so
    /// ties resolve to registration order.
    pub fn lookup(&self, host: &str, path: &str) -> Option<RouteMatch> {
        let routes = self.routes.lock().unwrap();
        let mut best: Option<&Route> = None;
        for route in routes.iter() {
            if route.binding.host != host || !path.starts_with(route.binding.location.as_str()) {
                continue;
            }
            let better = match best {
                Some(b) => route.binding.location.len() > b.binding.location.len(),
                None => true,
            };
            if better {
                best = Some(route);
            }
        }

        best.map(|r| RouteMatch {
            name: r.binding.name.clone(),
            rewrite_host: r.binding.rewrite_host.clone(),
            target: r.target.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
