use crate::errors::{Error, Result};

const DEVICE_ID_MAX_LEN: usize = 128;
const DEVICE_ID_SPECIAL_CHARS: &str = "-.%_*?!(),:=@$'";

/// Validates a caller-supplied device id against the registry's id rules
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.is_empty() {
        return Err(Error::InvalidInput("Device ID cannot be empty".to_string()));
    }

    if device_id.len() > DEVICE_ID_MAX_LEN {
        return Err(Error::InvalidInput(format!(
            "Device ID length {} exceeds maximum of {}",
            device_id.len(),
            DEVICE_ID_MAX_LEN
        )));
    }

    if let Some(c) = device_id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !DEVICE_ID_SPECIAL_CHARS.contains(*c))
    {
        return Err(Error::InvalidInput(format!(
            "Device ID contains invalid character {:?}",
            c
        )));
    }

    Ok(())
}
