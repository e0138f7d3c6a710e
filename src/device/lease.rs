//! Scoped exclusive ownership of a device.
//!
//! A task controls a device only while it holds a [`DeviceLease`]. The lease is
//! released on drop, so an aborted or panicking task never leaves the device
//! locked.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::DeviceBridge;

/// Errors that can occur when acquiring a device
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    /// Another task currently controls the device
    #[error("device '{device}' is already controlled by task {holder}")]
    Busy { device: String, holder: String },
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// Tracks which devices are currently controlled by a task
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    leases: Arc<DashMap<String, LeaseRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive control of the bridge's device on behalf of `holder`
    pub fn acquire(
        &self,
        bridge: Arc<dyn DeviceBridge>,
        holder: impl Into<String>,
    ) -> Result<DeviceLease, LeaseError> {
        let device = bridge.id().to_string();
        let holder = holder.into();
        match self.leases.entry(device.clone()) {
            Entry::Occupied(existing) => Err(LeaseError::Busy {
                device,
                holder: existing.get().holder.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(LeaseRecord {
                    holder: holder.clone(),
                    acquired_at: Utc::now(),
                });
                tracing::debug!(device = %device, holder = %holder, "device lease acquired");
                Ok(DeviceLease {
                    leases: Arc::clone(&self.leases),
                    device,
                    holder,
                    bridge,
                })
            }
        }
    }

    pub fn is_leased(&self, device: &str) -> bool {
        self.leases.contains_key(device)
    }

    /// Holder and acquisition time of the lease on `device`, if any
    pub fn holder(&self, device: &str) -> Option<(String, DateTime<Utc>)> {
        self.leases
            .get(device)
            .map(|r| (r.holder.clone(), r.acquired_at))
    }

    pub fn active(&self) -> usize {
        self.leases.len()
    }
}

/// Exclusive control of one device; dereferences to its bridge
pub struct DeviceLease {
    leases: Arc<DashMap<String, LeaseRecord>>,
    device: String,
    holder: String,
    bridge: Arc<dyn DeviceBridge>,
}

impl DeviceLease {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn bridge(&self) -> &Arc<dyn DeviceBridge> {
        &self.bridge
    }
}

impl Deref for DeviceLease {
    type Target = dyn DeviceBridge;

    fn deref(&self) -> &Self::Target {
        self.bridge.as_ref()
    }
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease")
            .field("device", &self.device)
            .field("holder", &self.holder)
            .finish()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        // Only remove our own record.
        self.leases
            .remove_if(&self.device, |_, record| record.holder == self.holder);
        tracing::debug!(device = %self.device, holder = %self.holder, "device lease released");
    }
}
