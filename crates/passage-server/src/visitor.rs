//! Secret-tunnel visitor pairing.
//!
//! A visitor proves knowledge of a proxy's secret key and is then spliced
//! onto a work connection pulled from the client that owns the tunnel.

use crate::service::ServerContext;
use passage_proto::msg::NewVisitorConn;
use passage_proto::{verify_privilege_key, AuthError};
use passage_vhost::BoxedStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Cap on visitors waiting for a work connection, per proxy.
const MAX_PENDING_VISITORS: usize = 8;

#[derive(Debug, Error)]
pub enum VisitorError {
    #[error("no visitor proxy named {0}")]
    NoSuchProxy(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("tunnel client for {0} is not connected")]
    ClientGone(String),

    #[error("too many pending visitors for {0}")]
    Busy(String),
}

#[derive(Clone)]
struct VisitorEntry {
    secret_key: String,
    run_id: String,
    inflight: Arc<AtomicUsize>,
}

/// Per-proxy secret keys and pending-visitor accounting for stcp/xtcp
/// tunnels.
pub struct VisitorRegistry {
    entries: Mutex<HashMap<String, VisitorEntry>>,
}

impl VisitorRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Called when an stcp/xtcp proxy registers. The name was already
    /// reserved globally by the proxy registry.
    pub fn register(&self, name: &str, secret_key: &str, run_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            name.to_string(),
            VisitorEntry {
                secret_key: secret_key.to_string(),
                run_id: run_id.to_string(),
                inflight: Arc::new(AtomicUsize::new(0)),
            },
        );
        debug!("visitor proxy {} registered", name);
    }

    pub fn unregister(&self, name: &str) {
        self.entries.lock().unwrap().remove(name);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Check a visitor's credentials and capacity without consuming the
    /// connection; the caller replies first and pairs after.
    pub fn validate(&self, ctx: &ServerContext, msg: &NewVisitorConn) -> Result<(), VisitorError> {
        let entry = self
            .entries
            .lock()
            .unwrap()
            .get(&msg.proxy_name)
            .cloned()
            .ok_or_else(|| VisitorError::NoSuchProxy(msg.proxy_name.clone()))?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        verify_privilege_key(
            &entry.secret_key,
            msg.timestamp,
            &msg.sign_key,
            ctx.cfg.auth_timeout,
            now,
        )?;

        if ctx.ctl_registry.get_by_id(&entry.run_id).is_none() {
            return Err(VisitorError::ClientGone(msg.proxy_name.clone()));
        }
        if entry.inflight.load(Ordering::Acquire) >= MAX_PENDING_VISITORS {
            return Err(VisitorError::Busy(msg.proxy_name.clone()));
        }
        Ok(())
    }

    /// Splice `conn` onto a work connection from the owning client. Spawns
    /// the pairing task; the visitor connection is consumed either way.
    pub fn pair(&self, ctx: Arc<ServerContext>, proxy_name: &str, mut conn: BoxedStream) {
        let entry = match self.entries.lock().unwrap().get(proxy_name).cloned() {
            Some(entry) => entry,
            None => {
                debug!("visitor proxy {} vanished before pairing", proxy_name);
                return;
            }
        };

        let proxy_name = proxy_name.to_string();
        tokio::spawn(async move {
            let ctl = match ctx.ctl_registry.get_by_id(&entry.run_id) {
                Some(ctl) => ctl,
                None => {
                    warn!(
                        "tunnel client for visitor proxy {} went away before pairing",
                        proxy_name
                    );
                    return;
                }
            };

            entry.inflight.fetch_add(1, Ordering::AcqRel);
            match ctl.get_work_conn().await {
                Ok(mut work_conn) => {
                    trace!("visitor paired for proxy {}", proxy_name);
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut conn, &mut work_conn).await
                    {
                        debug!("visitor splice for {} ended: {}", proxy_name, e);
                    }
                }
                Err(e) => {
                    warn!("no work connection for visitor to {}: {}", proxy_name, e);
                }
            }
            entry.inflight.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

impl Default for VisitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
