//! In-process registry and messaging backend.
//!
//! Honors the same contract as the remote services: device and twin share a
//! lifecycle, every write refreshes the twin's ETag, and a stale ETag is a
//! `Conflict`. Reported-property patches sent over a channel land in the
//! stored twin so round trips can be observed. A `null` property value in
//! either bag removes the key, as it does in the registry.

use super::{DeviceChannel, MessagingConnector, RegistryClient};
use crate::errors::{Error, Result};
use crate::model::{DeviceIdentity, PropertyBag, TelemetryMessage, TwinDocument};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct DeviceRecord {
    identity: DeviceIdentity,
    twin: TwinDocument,
}

/// A telemetry event as received by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub device_id: String,
    pub message: TelemetryMessage,
}

#[derive(Debug, Default)]
struct HubState {
    devices: DashMap<String, DeviceRecord>,
    sent: Mutex<Vec<SentMessage>>,
    connections_opened: AtomicUsize,
    open_channels: AtomicUsize,
    fail_channel_ops: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryHub {
    state: Arc<HubState>,
}

fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Telemetry events received so far, oldest first.
    pub async fn sent_messages(&self) -> Vec<SentMessage> {
        self.state.sent.lock().await.clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Channels connected but not yet closed or dropped.
    pub fn open_channels(&self) -> usize {
        self.state.open_channels.load(Ordering::SeqCst)
    }

    /// Makes every subsequent channel operation fail with a backend error.
    pub fn fail_channel_operations(&self, fail: bool) {
        self.state.fail_channel_ops.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryClient for InMemoryHub {
    async fn add_device(&self, device: &DeviceIdentity) -> Result<DeviceIdentity> {
        use dashmap::mapref::entry::Entry;

        match self.state.devices.entry(device.device_id.clone()) {
            Entry::Occupied(_) => Err(Error::Conflict(format!(
                "device {} already exists",
                device.device_id
            ))),
            Entry::Vacant(slot) => {
                let mut identity = device.clone();
                identity.etag = Some(new_etag());
                identity.status_updated_time = Some(Utc::now());
                identity.connection_state = Some("Disconnected".to_string());

                let mut twin = TwinDocument::empty(&device.device_id, new_etag());
                twin.status = Some(identity.status);

                slot.insert(DeviceRecord {
                    identity: identity.clone(),
                    twin,
                });
                Ok(identity)
            }
        }
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceIdentity>> {
        Ok(self
            .state
            .devices
            .get(device_id)
            .map(|record| record.identity.clone()))
    }

    async fn update_device(&self, device: &DeviceIdentity) -> Result<DeviceIdentity> {
        let mut record = self
            .state
            .devices
            .get_mut(&device.device_id)
            .ok_or_else(|| Error::NotFound(format!("device {}", device.device_id)))?;

        if let Some(etag) = &device.etag {
            if record.identity.etag.as_ref() != Some(etag) {
                return Err(Error::Conflict(format!(
                    "stale etag for device {}",
                    device.device_id
                )));
            }
        }

        let mut identity = device.clone();
        identity.etag = Some(new_etag());
        if identity.status != record.identity.status {
            identity.status_updated_time = Some(Utc::now());
        }
        record.twin.status = Some(identity.status);
        record.identity = identity.clone();
        Ok(identity)
    }

    async fn remove_device(&self, device_id: &str) -> Result<()> {
        self.state
            .devices
            .remove(device_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))
    }

    async fn get_twin(&self, device_id: &str) -> Result<Option<TwinDocument>> {
        Ok(self
            .state
            .devices
            .get(device_id)
            .map(|record| record.twin.clone()))
    }

    async fn update_twin(
        &self,
        device_id: &str,
        twin: &TwinDocument,
        etag: &str,
    ) -> Result<TwinDocument> {
        let mut record = self
            .state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::NotFound(format!("twin {}", device_id)))?;

        if etag != "*" && record.twin.etag != etag {
            return Err(Error::Conflict(format!("stale etag for twin {}", device_id)));
        }

        let desired = &mut record.twin.properties.desired;
        desired.merge(twin.properties.desired.as_map());
        desired.prune_nulls();
        record.twin.etag = new_etag();
        record.twin.version = Some(record.twin.version.unwrap_or(0) + 1);
        Ok(record.twin.clone())
    }
}

#[async_trait]
impl MessagingConnector for InMemoryHub {
    async fn connect(&self, device_id: &str) -> Result<Box<dyn DeviceChannel>> {
        if !self.state.devices.contains_key(device_id) {
            return Err(Error::Backend(format!(
                "connection refused: device {} is not registered",
                device_id
            )));
        }

        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        self.state.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            device_id: device_id.to_string(),
            hub: self.clone(),
        }))
    }
}

struct MemoryChannel {
    device_id: String,
    hub: InMemoryHub,
}

impl MemoryChannel {
    fn check_failure(&self) -> Result<()> {
        if self.hub.state.fail_channel_ops.load(Ordering::SeqCst) {
            return Err(Error::Backend(format!(
                "channel for {} lost",
                self.device_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceChannel for MemoryChannel {
    async fn send_event(&mut self, message: TelemetryMessage) -> Result<()> {
        self.check_failure()?;
        self.hub.state.sent.lock().await.push(SentMessage {
            device_id: self.device_id.clone(),
            message,
        });
        Ok(())
    }

    async fn update_reported_properties(&mut self, reported: PropertyBag) -> Result<()> {
        self.check_failure()?;
        let mut record = self
            .hub
            .state
            .devices
            .get_mut(&self.device_id)
            .ok_or_else(|| Error::NotFound(format!("twin {}", self.device_id)))?;

        let stored = &mut record.twin.properties.reported;
        stored.merge(reported.as_map());
        stored.prune_nulls();
        record.twin.etag = new_etag();
        record.twin.version = Some(record.twin.version.unwrap_or(0) + 1);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.hub.state.open_channels.fetch_sub(1, Ordering::SeqCst);
    }
}
