use crate::connection_string::ConnectionString;
use crate::errors::{Error, Result};
use crate::facade::{DeletePolicy, FacadeOptions};
use clap::Parser;
use std::time::Duration;

/// Runtime configuration; every flag can also be set from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "device-api", version, about = "HTTP API for managing registry devices")]
pub struct Config {
    /// HTTP listen address
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: String,

    /// Registry management connection string (service policy)
    #[arg(long, env = "IOTHUB_CONNECTION_STRING", hide_env_values = true)]
    pub registry_connection_string: Option<String>,

    /// Device messaging connection string (device or hub policy)
    #[arg(long, env = "DEVICE_CONNECTION_STRING", hide_env_values = true)]
    pub device_connection_string: Option<String>,

    /// Timeout for each backend call, in milliseconds
    #[arg(long, env = "BACKEND_TIMEOUT_MS", default_value_t = 30_000)]
    pub backend_timeout_ms: u64,

    /// Outcome of deleting a device that does not exist
    #[arg(long, env = "DELETE_POLICY", value_enum, default_value_t = DeletePolicy::Idempotent)]
    pub delete_policy: DeletePolicy,

    /// Return raw backend error text in 5xx responses
    #[arg(long, env = "EXPOSE_BACKEND_ERRORS", default_value_t = false)]
    pub expose_backend_errors: bool,

    /// MQTT over TLS port of the messaging endpoint
    #[arg(long, env = "MQTT_PORT", default_value_t = 8883)]
    pub mqtt_port: u16,

    /// Lifetime of generated SAS tokens, in seconds
    #[arg(long, env = "SAS_TTL_SECS", default_value_t = 3600)]
    pub sas_ttl_secs: u64,
}

fn required_credentials(value: Option<&str>, name: &str) -> Result<ConnectionString> {
    match value {
        Some(v) if !v.trim().is_empty() => v
            .parse()
            .map_err(|e| Error::Config(format!("{} is invalid: {}", name, e))),
        _ => Err(Error::Config(format!("{} is missing or empty", name))),
    }
}

impl Config {
    pub fn registry_credentials(&self) -> Result<ConnectionString> {
        required_credentials(
            self.registry_connection_string.as_deref(),
            "IOTHUB_CONNECTION_STRING",
        )
    }

    pub fn device_credentials(&self) -> Result<ConnectionString> {
        required_credentials(
            self.device_connection_string.as_deref(),
            "DEVICE_CONNECTION_STRING",
        )
    }

    pub fn sas_ttl(&self) -> Duration {
        Duration::from_secs(self.sas_ttl_secs)
    }

    pub fn facade_options(&self) -> FacadeOptions {
        FacadeOptions {
            timeout: Duration::from_millis(self.backend_timeout_ms),
            delete_policy: self.delete_policy,
        }
    }
}
