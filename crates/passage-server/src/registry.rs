//! Registries for live client sessions and for globally-named proxies.

use crate::control::Control;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("proxy name {0} is already in use")]
    NameInUse(String),
}

/// Run-id keyed map of live controls with single-writer takeover.
pub struct ControlRegistry {
    ctls: Mutex<HashMap<String, Arc<Control>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self {
            ctls: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically install `ctl` under `run_id`, returning the control it
    /// replaced. The caller must wait for the old control's shutdown to
    /// finish before starting the new one, so resource releases have
    /// happened.
    pub fn add(&self, run_id: &str, ctl: Arc<Control>) -> Option<Arc<Control>> {
        let mut ctls = self.ctls.lock().unwrap();
        let old = ctls.insert(run_id.to_string(), ctl);
        if old.is_some() {
            info!("client with run id {} reconnected, replacing old control", run_id);
        }
        old
    }

    pub fn get_by_id(&self, run_id: &str) -> Option<Arc<Control>> {
        self.ctls.lock().unwrap().get(run_id).cloned()
    }

    /// Remove `run_id` only while it still maps to `ctl`. A control that was
    /// taken over must not delete its replacement.
    pub fn del(&self, run_id: &str, ctl: &Arc<Control>) -> bool {
        let mut ctls = self.ctls.lock().unwrap();
        match ctls.get(run_id) {
            Some(current) if Arc::ptr_eq(current, ctl) => {
                ctls.remove(run_id);
                debug!("control for run id {} removed from registry", run_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.ctls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// What the proxy registry records per registered tunnel.
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub name: String,
    pub proxy_type: String,
    pub run_id: String,
}

/// Globally-unique proxy names across all clients.
pub struct ProxyRegistry {
    proxies: Mutex<HashMap<String, ProxyEntry>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self {
            proxies: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, entry: ProxyEntry) -> Result<(), RegistryError> {
        let mut proxies = self.proxies.lock().unwrap();
        if proxies.contains_key(&entry.name) {
            warn!("rejected duplicate proxy name {}", entry.name);
            return Err(RegistryError::NameInUse(entry.name));
        }
        debug!(
            "registered {} proxy {} for run id {}",
            entry.proxy_type, entry.name, entry.run_id
        );
        proxies.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn del(&self, name: &str) -> Option<ProxyEntry> {
        self.proxies.lock().unwrap().remove(name)
    }

    pub fn get_by_name(&self, name: &str) -> Option<ProxyEntry> {
        self.proxies.lock().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
