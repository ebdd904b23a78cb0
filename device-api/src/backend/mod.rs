//! Seams to the remote device registry and the device-facing messaging
//! channel. The facade only ever talks to these traits.

pub mod memory;
pub mod mqtt;
pub mod registry;

use crate::errors::Result;
use crate::model::{DeviceIdentity, PropertyBag, TelemetryMessage, TwinDocument};
use async_trait::async_trait;

pub use memory::InMemoryHub;
pub use mqtt::MqttConnector;
pub use registry::HttpRegistryClient;

/// Device identity and twin storage.
///
/// Lookups return `Ok(None)` for an absent device. Writes return
/// `Error::NotFound` when the device does not exist and `Error::Conflict`
/// when the device already exists or a concurrency token is stale.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn add_device(&self, device: &DeviceIdentity) -> Result<DeviceIdentity>;

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceIdentity>>;

    async fn update_device(&self, device: &DeviceIdentity) -> Result<DeviceIdentity>;

    async fn remove_device(&self, device_id: &str) -> Result<()>;

    async fn get_twin(&self, device_id: &str) -> Result<Option<TwinDocument>>;

    /// Writes the desired properties of `twin`, guarded by `etag`.
    async fn update_twin(
        &self,
        device_id: &str,
        twin: &TwinDocument,
        etag: &str,
    ) -> Result<TwinDocument>;
}

/// Opens a messaging session acting as a single device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagingConnector: Send + Sync {
    async fn connect(&self, device_id: &str) -> Result<Box<dyn DeviceChannel>>;
}

/// A live device session. Dropping it releases the underlying connection;
/// `close` does so gracefully.
#[async_trait]
pub trait DeviceChannel: Send {
    async fn send_event(&mut self, message: TelemetryMessage) -> Result<()>;

    async fn update_reported_properties(&mut self, reported: PropertyBag) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}
