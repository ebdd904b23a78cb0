//! Hub connection strings and shared access signature tokens.
//!
//! Two shapes are accepted:
//!
//! - service policy: `HostName=<hub>;SharedAccessKeyName=<policy>;SharedAccessKey=<key>`
//! - device: `HostName=<hub>;DeviceId=<id>;SharedAccessKey=<key>`

use crate::errors::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// RFC 3986 unreserved characters stay as-is, everything else is escaped.
pub const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub shared_access_key: String,
    pub shared_access_key_name: Option<String>,
    pub device_id: Option<String>,
}

// Keeps the key out of logs.
impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(Error::Config("connection string is empty".to_string()));
        }

        let mut host_name = None;
        let mut shared_access_key = None;
        let mut shared_access_key_name = None;
        let mut device_id = None;

        for part in s.trim().split(';').filter(|p| !p.is_empty()) {
            // Keys are base64 and may end in '='
            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::Config(format!("malformed connection string segment {:?}", key_only(part)))
            })?;
            let value = value.trim().to_string();
            match key.trim() {
                "HostName" => host_name = Some(value),
                "SharedAccessKey" => shared_access_key = Some(value),
                "SharedAccessKeyName" => shared_access_key_name = Some(value),
                "DeviceId" => device_id = Some(value),
                _ => {}
            }
        }

        let host_name = host_name
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config("connection string is missing HostName".to_string()))?;
        let shared_access_key = shared_access_key.filter(|k| !k.is_empty()).ok_or_else(|| {
            Error::Config("connection string is missing SharedAccessKey".to_string())
        })?;

        if shared_access_key_name.is_none() && device_id.is_none() {
            return Err(Error::Config(
                "connection string needs either SharedAccessKeyName or DeviceId".to_string(),
            ));
        }

        Ok(Self {
            host_name,
            shared_access_key,
            shared_access_key_name,
            device_id,
        })
    }
}

fn key_only(part: &str) -> &str {
    part.split('=').next().unwrap_or_default()
}

impl ConnectionString {
    /// Resource URI a device authenticates against.
    pub fn device_resource(&self, device_id: &str) -> String {
        format!("{}/devices/{}", self.host_name, device_id)
    }

    /// Builds a token for `resource_uri` valid for `ttl` from now.
    pub fn sas_token(&self, resource_uri: &str, ttl: Duration) -> Result<String> {
        let expiry = Utc::now().timestamp() + ttl.as_secs() as i64;
        generate_sas_token(
            resource_uri,
            &self.shared_access_key,
            self.shared_access_key_name.as_deref(),
            expiry,
        )
    }
}

pub fn generate_sas_token(
    resource_uri: &str,
    key: &str,
    key_name: Option<&str>,
    expiry: i64,
) -> Result<String> {
    let encoded_uri = utf8_percent_encode(resource_uri, URI_COMPONENT).to_string();
    let to_sign = format!("{}\n{}", encoded_uri, expiry);

    let key_bytes = STANDARD
        .decode(key)
        .map_err(|e| Error::Config(format!("shared access key is not valid base64: {}", e)))?;
    let mut mac = HmacSha256::new_from_slice(&key_bytes)
        .map_err(|e| Error::Config(format!("invalid signing key: {}", e)))?;
    mac.update(to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_uri,
        utf8_percent_encode(&signature, URI_COMPONENT),
        expiry
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&utf8_percent_encode(name, URI_COMPONENT).to_string());
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

    #[test]
    fn test_parse_service_connection_string() {
        let cs: ConnectionString = format!(
            "HostName=hub.example.net;SharedAccessKeyName=iothubowner;SharedAccessKey={}",
            KEY
        )
        .parse()
        .unwrap();

        assert_eq!(cs.host_name, "hub.example.net");
        assert_eq!(cs.shared_access_key, KEY);
        assert_eq!(cs.shared_access_key_name.as_deref(), Some("iothubowner"));
        assert_eq!(cs.device_id, None);
    }

    #[test]
    fn test_parse_device_connection_string() {
        let cs: ConnectionString = format!(
            "HostName=hub.example.net;DeviceId=dev-1;SharedAccessKey={}",
            KEY
        )
        .parse()
        .unwrap();

        assert_eq!(cs.device_id.as_deref(), Some("dev-1"));
        assert_eq!(cs.device_resource("dev-1"), "hub.example.net/devices/dev-1");
    }

    #[test]
    fn test_parse_rejects_blank_and_incomplete() {
        assert!("".parse::<ConnectionString>().is_err());
        assert!("   ".parse::<ConnectionString>().is_err());
        assert!("HostName=hub.example.net".parse::<ConnectionString>().is_err());
        assert!(format!("HostName=hub.example.net;SharedAccessKey={}", KEY)
            .parse::<ConnectionString>()
            .is_err());
        assert!("HostName;DeviceId=d".parse::<ConnectionString>().is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let cs: ConnectionString = format!("HostName=h;DeviceId=d;SharedAccessKey={}", KEY)
            .parse()
            .unwrap();
        assert!(!format!("{:?}", cs).contains(KEY));
    }

    #[test]
    fn test_sas_token_shape() {
        let token = generate_sas_token(
            "hub.example.net/devices/dev-1",
            KEY,
            Some("iothubowner"),
            1_700_000_000,
        )
        .unwrap();

        assert!(token
            .starts_with("SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdev-1&sig="));
        assert!(token.contains("&se=1700000000"));
        assert!(token.ends_with("&skn=iothubowner"));
    }

    #[test]
    fn test_sas_token_is_deterministic_per_key() {
        let a = generate_sas_token("hub", KEY, None, 42).unwrap();
        let b = generate_sas_token("hub", KEY, None, 42).unwrap();
        let other = generate_sas_token("hub", "b3RoZXIta2V5", None, 42).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert!(!a.contains("skn="));
    }

    #[test]
    fn test_sas_token_rejects_bad_key() {
        assert!(matches!(
            generate_sas_token("hub", "not base64!", None, 42),
            Err(Error::Config(_))
        ));
    }
}
