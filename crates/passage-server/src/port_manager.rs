//! Port allocation over the configured allow-list.
//!
//! One manager per L4 flavor (tcp, udp). Every successful acquire must be
//! paired with exactly one release on the owning session's teardown path.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Ports handed out when no allow-list is configured.
const UNRESTRICTED_RANGE: RangeInclusive<u16> = 1024..=65535;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port unavailable: {0} is already in use")]
    InUse(u16),

    #[error("port {0} is not allowed")]
    NotAllowed(u16),

    #[error("no free port available")]
    Exhausted,
}

pub struct PortManager {
    flavor: &'static str,
    allow: Vec<RangeInclusive<u16>>,
    used: Mutex<HashSet<u16>>,
}

impl PortManager {
    /// `allow` empty means any port in the unrestricted range.
    pub fn new(flavor: &'static str, allow: Vec<RangeInclusive<u16>>) -> Self {
        Self {
            flavor,
            allow,
            used: Mutex::new(HashSet::new()),
        }
    }

    fn is_allowed(&self, port: u16) -> bool {
        if self.allow.is_empty() {
            return UNRESTRICTED_RANGE.contains(&port);
        }
        self.allow.iter().any(|r| r.contains(&port))
    }

    /// Claim a specific port.
    pub fn acquire(&self, port: u16) -> Result<u16, PortError> {
        if !self.is_allowed(port) {
            return Err(PortError::NotAllowed(port));
        }

        let mut used = self.used.lock().unwrap();
        if !used.insert(port) {
            return Err(PortError::InUse(port));
        }
        debug!("{} port {} acquired", self.flavor, port);
        Ok(port)
    }

    /// Claim any free allowed port.
    pub fn acquire_any(&self) -> Result<u16, PortError> {
        let mut used = self.used.lock().unwrap();

        let candidates: Box<dyn Iterator<Item = u16>> = if self.allow.is_empty() {
            Box::new(UNRESTRICTED_RANGE)
        } else {
            Box::new(self.allow.iter().cloned().flatten())
        };

        for port in candidates {
            if used.insert(port) {
                debug!("{} port {} acquired", self.flavor, port);
                return Ok(port);
            }
        }
        Err(PortError::Exhausted)
    }

    pub fn release(&self, port: u16) {
        let mut used = self.used.lock().unwrap();
        if !used.remove(&port) {
            // Releasing a port we do not own is an accounting bug.
            warn!("{} port {} released but was not acquired", self.flavor, port);
        } else {
            debug!("{} port {} released", self.flavor, port);
        }
    }

    pub fn used_count(&self) -> usize {
        self.used.lock().unwrap().len()
    }
}
