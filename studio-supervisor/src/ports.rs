//! Host port reservations for deployments.
//!
//! One mutex guards the whole map. It is never held across an await.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};
use studio_core::error::{ErrorKind, StudioError};
use tracing::{debug, warn};

/// Reserved host ports and the deployment that owns each.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    probe_host: bool,
    reserved: Mutex<BTreeMap<u16, String>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, probe_host: bool) -> Self {
        Self {
            range,
            probe_host,
            reserved: Mutex::new(BTreeMap::new()),
        }
    }

    fn map(&self) -> MutexGuard<'_, BTreeMap<u16, String>> {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the lowest free port for `owner`.
    ///
    /// The reservation is released when the lease drops unless it is
    /// committed first.
    pub fn lease(self: &Arc<Self>, owner: &str) -> Result<PortLease, StudioError> {
        let mut map = self.map();
        let port = self
            .range
            .clone()
            .find(|p| !map.contains_key(p) && (!self.probe_host || host_port_free(*p)))
            .ok_or_else(|| {
                StudioError::new(
                    ErrorKind::ResourceExhausted,
                    format!(
                        "no free host port in {}-{}",
                        self.range.start(),
                        self.range.end()
                    ),
                )
            })?;
        map.insert(port, owner.to_string());
        debug!(port, owner, "Port reserved");
        Ok(PortLease {
            allocator: Arc::clone(self),
            port,
            owner: owner.to_string(),
            committed: false,
        })
    }

    /// Record an existing reservation (startup hydration, adoption).
    ///
    /// Returns `false` when the port is held by another owner.
    pub fn reserve(&self, port: u16, owner: &str) -> bool {
        let mut map = self.map();
        match map.get(&port) {
            Some(current) if current != owner => {
                warn!(port, owner, current = %current, "Port already reserved");
                false
            }
            _ => {
                map.insert(port, owner.to_string());
                true
            }
        }
    }

    /// Release `port` if `owner` holds it.
    pub fn release(&self, port: u16, owner: &str) -> bool {
        let mut map = self.map();
        if map.get(&port).is_some_and(|o| o == owner) {
            map.remove(&port);
            debug!(port, owner, "Port released");
            true
        } else {
            false
        }
    }

    pub fn owner(&self, port: u16) -> Option<String> {
        self.map().get(&port).cloned()
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.map().contains_key(&port)
    }

    /// Copy of the current reservations.
    pub fn snapshot(&self) -> BTreeMap<u16, String> {
        self.map().clone()
    }
}

fn host_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// A port reservation that is rolled back on drop unless committed.
#[derive(Debug)]
pub struct PortLease {
    allocator: Arc<PortAllocator>,
    port: u16,
    owner: String,
    committed: bool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keep the reservation past the lease.
    pub fn commit(mut self) -> u16 {
        self.committed = true;
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if !self.committed {
            self.allocator.release(self.port, &self.owner);
        }
    }
}
