//! Device operations over the registry and messaging backends.
//!
//! The facade holds no mutable state of its own. Registry writes are guarded
//! by the backend's concurrency tokens; messaging sessions are opened per call
//! and released before the call returns, whatever its outcome.

use crate::backend::{DeviceChannel, MessagingConnector, RegistryClient};
use crate::errors::{Error, Result};
use crate::metrics::{BACKEND_LATENCY_SECONDS, FAILURES_TOTAL, MESSAGES_SENT_TOTAL, REQUESTS_TOTAL};
use crate::model::{
    DeviceIdentity, DeviceStatus, PropertyBag, PropertyPatch, TelemetryMessage, TwinDocument,
};
use crate::validate::validate_device_id;
use clap::ValueEnum;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What deleting an unknown device does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DeletePolicy {
    /// Report success; the device is gone either way.
    #[default]
    Idempotent,
    /// Report `NotFound`.
    Strict,
}

#[derive(Debug, Clone)]
pub struct FacadeOptions {
    pub timeout: Duration,
    pub delete_policy: DeletePolicy,
}

impl Default for FacadeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            delete_policy: DeletePolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct DeviceFacade {
    registry: Arc<dyn RegistryClient>,
    messaging: Arc<dyn MessagingConnector>,
    options: FacadeOptions,
}

impl DeviceFacade {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        messaging: Arc<dyn MessagingConnector>,
        options: FacadeOptions,
    ) -> Self {
        Self {
            registry,
            messaging,
            options,
        }
    }

    pub async fn create_device(&self, device_id: &str) -> Result<DeviceIdentity> {
        self.run("create_device", device_id, async {
            let created = self
                .registry
                .add_device(&DeviceIdentity::new(device_id))
                .await?;
            info!(device_id, "Device created");
            Ok(created)
        })
        .await
    }

    pub async fn delete_device(&self, device_id: &str) -> Result<()> {
        self.run("delete_device", device_id, async {
            match self.registry.remove_device(device_id).await {
                Ok(()) => {
                    info!(device_id, "Device deleted");
                    Ok(())
                }
                Err(Error::NotFound(_))
                    if self.options.delete_policy == DeletePolicy::Idempotent =>
                {
                    debug!(device_id, "Delete of unknown device treated as success");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Sets the device status, `Enabled` when no target is given.
    pub async fn update_device(
        &self,
        device_id: &str,
        status: Option<DeviceStatus>,
    ) -> Result<DeviceIdentity> {
        self.run("update_device", device_id, async {
            let mut device = self
                .registry
                .get_device(device_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;

            device.status = status.unwrap_or(DeviceStatus::Enabled);
            let updated = self.registry.update_device(&device).await?;
            info!(device_id, status = ?updated.status, "Device updated");
            Ok(updated)
        })
        .await
    }

    pub async fn get_device(&self, device_id: &str) -> Result<DeviceIdentity> {
        self.run("get_device", device_id, async {
            self.registry
                .get_device(device_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))
        })
        .await
    }

    pub async fn get_device_twin(&self, device_id: &str) -> Result<TwinDocument> {
        self.run("get_device_twin", device_id, async {
            self.registry
                .get_twin(device_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("twin {}", device_id)))
        })
        .await
    }

    /// Read-merge-write of the desired bag, guarded by the twin's ETag.
    /// A concurrent writer makes this fail with `Conflict`; there is no retry.
    pub async fn update_desired_properties(
        &self,
        device_id: &str,
        patch: &PropertyPatch,
    ) -> Result<TwinDocument> {
        self.run("update_desired_properties", device_id, async {
            let mut twin = self
                .registry
                .get_twin(device_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("twin {}", device_id)))?;

            twin.properties.desired.merge(patch);
            let etag = twin.etag.clone();
            let updated = self.registry.update_twin(device_id, &twin, &etag).await?;
            info!(device_id, keys = patch.len(), "Desired properties updated");
            Ok(updated)
        })
        .await
    }

    /// Submits `patch` as a reported-property update from the device itself.
    /// Merging into the stored bag is left to the backend.
    pub async fn update_reported_properties(
        &self,
        device_id: &str,
        patch: &PropertyPatch,
    ) -> Result<()> {
        self.run("update_reported_properties", device_id, async {
            let mut reported = PropertyBag::new();
            reported.merge(patch);

            self.with_channel(device_id, |mut channel| async move {
                let outcome = channel.update_reported_properties(reported).await;
                (channel, outcome)
            })
            .await?;

            MESSAGES_SENT_TOTAL.with_label_values(&["reported"]).inc();
            info!(device_id, keys = patch.len(), "Reported properties updated");
            Ok(())
        })
        .await
    }

    pub async fn send_telemetry(&self, device_id: &str, payload: &PropertyPatch) -> Result<()> {
        self.run("send_telemetry", device_id, async {
            let message = TelemetryMessage::json(payload)?;
            let size = message.body.len();

            self.with_channel(device_id, |mut channel| async move {
                let outcome = channel.send_event(message).await;
                (channel, outcome)
            })
            .await?;

            MESSAGES_SENT_TOTAL.with_label_values(&["telemetry"]).inc();
            info!(device_id, bytes = size, "Telemetry sent");
            Ok(())
        })
        .await
    }

    /// Opens a channel for `device_id`, runs `op`, then closes the channel.
    /// The channel is released on every path: closed after `op`, or dropped
    /// if the future is cancelled.
    async fn with_channel<F, Fut>(&self, device_id: &str, op: F) -> Result<()>
    where
        F: FnOnce(Box<dyn DeviceChannel>) -> Fut,
        Fut: Future<Output = (Box<dyn DeviceChannel>, Result<()>)>,
    {
        let channel = self.messaging.connect(device_id).await?;
        let (channel, outcome) = op(channel).await;

        if let Err(e) = channel.close().await {
            warn!(device_id, "Failed to close device channel cleanly: {}", e);
        }
        outcome
    }

    /// Common wrapper: validation, per-call timeout, metrics and failure logging.
    async fn run<T, Fut>(&self, operation: &'static str, device_id: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        REQUESTS_TOTAL.with_label_values(&[operation]).inc();

        let outcome = match validate_device_id(device_id) {
            Err(e) => Err(e),
            Ok(()) => {
                let timer = BACKEND_LATENCY_SECONDS
                    .with_label_values(&[operation])
                    .start_timer();
                let outcome = match tokio::time::timeout(self.options.timeout, fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Timeout(self.options.timeout)),
                };
                timer.observe_duration();
                outcome
            }
        };

        if let Err(e) = &outcome {
            let kind = e.kind();
            FAILURES_TOTAL
                .with_label_values(&[operation, kind.as_str()])
                .inc();
            warn!(device_id, operation, kind = kind.as_str(), "Operation failed: {}", e);
        }
        outcome
    }
}
