//! Device-GUID blob: same envelope as credentials (spec §6), payload is a
//! `u32` version (currently `1`) followed by a UTF-8 string of at most 128
//! characters.

use crate::blob::{self, DecodingError};
use bytes::{Buf, BufMut, BytesMut};

const DEVICE_GUID_VERSION: u32 = 1;
const MAX_GUID_CHARS: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum DeviceGuidError {
    #[error("device guid exceeds {MAX_GUID_CHARS} characters")]
    TooLong,
    #[error(transparent)]
    Decoding(#[from] DecodingError),
}

/// Serializes `guid` into the device-guid payload, then wraps it in the
/// shared envelope, ready to be passed to [`blob::write_atomic`].
pub fn encode(guid: &str) -> Result<Vec<u8>, DeviceGuidError> {
    if guid.chars().count() > MAX_GUID_CHARS {
        return Err(DeviceGuidError::TooLong);
    }
    let mut payload = BytesMut::with_capacity(4 + guid.len());
    payload.put_u32(DEVICE_GUID_VERSION);
    payload.put_slice(guid.as_bytes());
    Ok(blob::wrap(&payload))
}

/// Unwraps and parses a previously-[`encode`]d device-guid blob.
pub fn decode(wrapped: &[u8]) -> Result<String, DeviceGuidError> {
    let mut payload: &[u8] = &blob::unwrap(wrapped)?;
    if payload.len() < 4 {
        return Err(DecodingError::Truncated {
            expected: 4,
            actual: payload.len(),
        }
        .into());
    }
    let _version = payload.get_u32();
    let guid = String::from_utf8_lossy(payload).to_string();
    if guid.chars().count() > MAX_GUID_CHARS {
        return Err(DeviceGuidError::TooLong);
    }
    Ok(guid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let encoded = encode("a-device-guid").unwrap();
        assert_eq!(decode(&encoded).unwrap(), "a-device-guid");
    }

    #[test]
    fn rejects_overly_long_guid() {
        let too_long = "x".repeat(129);
        assert!(matches!(encode(&too_long), Err(DeviceGuidError::TooLong)));
    }

    #[test]
    fn exactly_max_length_is_accepted() {
        let max_len = "x".repeat(128);
        let encoded = encode(&max_len).unwrap();
        assert_eq!(decode(&encoded).unwrap(), max_len);
    }
}
