use super::RegistryClient;
use crate::connection_string::{ConnectionString, URI_COMPONENT};
use crate::errors::{Error, Result};
use crate::model::{DeviceIdentity, PropertyBag, TwinDocument};
use async_trait::async_trait;
use percent_encoding::utf8_percent_encode;
use reqwest::header::{AUTHORIZATION, IF_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const API_VERSION: &str = "2021-04-12";

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Registry REST client authenticated with a service-policy credential.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    http: Client,
    credentials: ConnectionString,
    base_url: String,
    sas_ttl: Duration,
}

#[derive(Serialize)]
struct DesiredPatch<'a> {
    properties: DesiredOnly<'a>,
}

#[derive(Serialize)]
struct DesiredOnly<'a> {
    desired: &'a PropertyBag,
}

impl HttpRegistryClient {
    pub fn new(credentials: ConnectionString, sas_ttl: Duration) -> Result<Self> {
        if credentials.shared_access_key_name.is_none() {
            return Err(Error::Config(
                "registry connection string must name a shared access policy".to_string(),
            ));
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        let base_url = format!("https://{}", credentials.host_name);

        Ok(Self {
            http,
            credentials,
            base_url,
            sas_ttl,
        })
    }

    /// Points the client at another registry endpoint, e.g. a local emulator.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, collection: &str, device_id: &str) -> String {
        registry_url(&self.base_url, collection, device_id)
    }

    async fn execute(&self, request: RequestBuilder, resource: &str) -> Result<Response> {
        let token = self
            .credentials
            .sas_token(&self.credentials.host_name, self.sas_ttl)?;
        let response = request.header(AUTHORIZATION, token).send().await?;

        let status = response.status();
        debug!("Registry {} -> {}", resource, status);
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, resource, &body))
    }
}

fn registry_url(base_url: &str, collection: &str, device_id: &str) -> String {
    format!(
        "{}/{}/{}?api-version={}",
        base_url,
        collection,
        utf8_percent_encode(device_id, URI_COMPONENT),
        API_VERSION
    )
}

fn quoted_etag(etag: &str) -> String {
    if etag == "*" || etag.starts_with('"') {
        etag.to_string()
    } else {
        format!("\"{}\"", etag)
    }
}

/// Maps a non-success registry status onto the error taxonomy.
fn status_error(status: StatusCode, resource: &str, body: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(resource.to_string()),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            Error::Conflict(format!("{} ({}): {}", resource, status, body))
        }
        _ => {
            warn!("Registry returned {} for {}", status, resource);
            Error::Backend(format!("registry returned {} for {}: {}", status, resource, body))
        }
    }
}

fn absent_as_none<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn add_device(&self, device: &DeviceIdentity) -> Result<DeviceIdentity> {
        let resource = format!("device {}", device.device_id);
        let request = self
            .http
            .put(self.url("devices", &device.device_id))
            .json(device);
        Ok(self.execute(request, &resource).await?.json().await?)
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceIdentity>> {
        let resource = format!("device {}", device_id);
        let request = self.http.get(self.url("devices", device_id));
        let response = absent_as_none(self.execute(request, &resource).await)?;
        match response {
            Some(response) => Ok(Some(response.json().await?)),
            None => Ok(None),
        }
    }

    async fn update_device(&self, device: &DeviceIdentity) -> Result<DeviceIdentity> {
        let resource = format!("device {}", device.device_id);
        let etag = quoted_etag(device.etag.as_deref().unwrap_or("*"));
        let request = self
            .http
            .put(self.url("devices", &device.device_id))
            .header(IF_MATCH, etag)
            .json(device);
        Ok(self.execute(request, &resource).await?.json().await?)
    }

    async fn remove_device(&self, device_id: &str) -> Result<()> {
        let resource = format!("device {}", device_id);
        let request = self
            .http
            .delete(self.url("devices", device_id))
            .header(IF_MATCH, "*");
        self.execute(request, &resource).await?;
        Ok(())
    }

    async fn get_twin(&self, device_id: &str) -> Result<Option<TwinDocument>> {
        let resource = format!("twin {}", device_id);
        let request = self.http.get(self.url("twins", device_id));
        let response = absent_as_none(self.execute(request, &resource).await)?;
        match response {
            Some(response) => Ok(Some(response.json().await?)),
            None => Ok(None),
        }
    }

    async fn update_twin(
        &self,
        device_id: &str,
        twin: &TwinDocument,
        etag: &str,
    ) -> Result<TwinDocument> {
        let resource = format!("twin {}", device_id);
        let patch = DesiredPatch {
            properties: DesiredOnly {
                desired: &twin.properties.desired,
            },
        };
        let request = self
            .http
            .patch(self.url("twins", device_id))
            .header(IF_MATCH, quoted_etag(etag))
            .json(&patch);
        Ok(self.execute(request, &resource).await?.json().await?)
    }
}
