//! The credential / device-guid blob envelope and its atomic on-disk write
//! for locally saved credentials and device identifiers.
//!
//! Layout: magic `HEAD` (4 bytes), `u32` version (currently always `1`),
//! `u32` payload length, the payload itself, a `u32` MurmurHash2 checksum of
//! the payload, and a trailing magic `TAIL` (4 bytes). Writes are atomic via
//! an atomic `.new` / `.old` rotation, so a crash between steps
//! never leaves neither file readable.

use crate::murmur2::murmur2_32;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

const HEAD_MAGIC: &[u8; 4] = b"HEAD";
const TAIL_MAGIC: &[u8; 4] = b"TAIL";
const ENVELOPE_VERSION: u32 = 1;
const CHECKSUM_SEED: u32 = 0;

/// Reasons an envelope failed to decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodingError {
    #[error("truncated envelope: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("bad header magic")]
    BadHeaderMagic,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("declared payload length {declared} does not match remaining {remaining} bytes")]
    LengthMismatch { declared: u32, remaining: usize },
    #[error("checksum mismatch: expected {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("bad trailer magic")]
    BadTrailerMagic,
}

/// Wraps `payload` in the envelope format.
pub fn wrap(payload: &[u8]) -> Vec<u8> {
    let checksum = murmur2_32(payload, CHECKSUM_SEED);
    let mut buf = BytesMut::with_capacity(4 + 4 + 4 + payload.len() + 4 + 4);
    buf.put_slice(HEAD_MAGIC);
    buf.put_u32(ENVELOPE_VERSION);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.put_u32(checksum);
    buf.put_slice(TAIL_MAGIC);
    buf.to_vec()
}

/// Unwraps a previously-[`wrap`]ped envelope, validating every field.
/// `unwrap(wrap(x)) == x` for any payload.
pub fn unwrap(data: &[u8]) -> Result<Vec<u8>, DecodingError> {
    const MIN_LEN: usize = 4 + 4 + 4 + 4 + 4;
    if data.len() < MIN_LEN {
        return Err(DecodingError::Truncated {
            expected: MIN_LEN,
            actual: data.len(),
        });
    }

    let mut bytes = data;
    let head = &bytes[..4];
    if head != HEAD_MAGIC {
        return Err(DecodingError::BadHeaderMagic);
    }
    bytes.advance(4);

    let version = bytes.get_u32();
    if version != ENVELOPE_VERSION {
        return Err(DecodingError::UnsupportedVersion(version));
    }

    let declared_len = bytes.get_u32();
    let remaining_after_payload = bytes.len().saturating_sub(declared_len as usize);
    if bytes.len() < declared_len as usize + 8 || remaining_after_payload != 8 {
        return Err(DecodingError::LengthMismatch {
            declared: declared_len,
            remaining: bytes.len(),
        });
    }

    let payload = bytes[..declared_len as usize].to_vec();
    bytes.advance(declared_len as usize);

    let expected_checksum = bytes.get_u32();
    let computed_checksum = murmur2_32(&payload, CHECKSUM_SEED);
    if expected_checksum != computed_checksum {
        return Err(DecodingError::ChecksumMismatch {
            expected: expected_checksum,
            computed: computed_checksum,
        });
    }

    let tail = &bytes[..4];
    if tail != TAIL_MAGIC {
        return Err(DecodingError::BadTrailerMagic);
    }

    Ok(payload)
}

/// Atomically writes `payload` (already wrapped) to `path`: write `.new`,
/// rotate any existing primary file to `.old`, rename `.new` into place, then
/// delete `.old`. On read, callers should try the primary path and fall back
/// to `.old` — idempotent even if interrupted between the
/// rename and the `.old` delete.
pub async fn write_atomic(path: &std::path::Path, wrapped: &[u8]) -> std::io::Result<()> {
    let new_path = path.with_extension("new");
    let old_path = path.with_extension("old");

    tokio::fs::write(&new_path, wrapped).await?;

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::rename(path, &old_path).await?;
    }
    tokio::fs::rename(&new_path, path).await?;

    // If the process is interrupted before this point, a subsequent read
    // still finds a valid primary file (just-renamed) and an `.old` replica;
    // both decode, so idempotence holds regardless of when the crash lands.
    let _ = tokio::fs::remove_file(&old_path).await;
    Ok(())
}

/// Reads and unwraps the blob at `path`, falling back to `path.old` if the
/// primary is missing or fails to decode.
pub async fn read_with_fallback(path: &std::path::Path) -> Result<Vec<u8>, DecodingError> {
    if let Ok(data) = tokio::fs::read(path).await {
        if let Ok(payload) = unwrap(&data) {
            return Ok(payload);
        }
    }
    let old_path = path.with_extension("old");
    let data = tokio::fs::read(&old_path)
        .await
        .map_err(|_| DecodingError::Truncated {
            expected: 0,
            actual: 0,
        })?;
    unwrap(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let payload = b"guest-credentials-blob".to_vec();
        let wrapped = wrap(&payload);
        assert_eq!(unwrap(&wrapped).unwrap(), payload);
    }

    #[test]
    fn empty_payload_round_trips() {
        let wrapped = wrap(&[]);
        assert_eq!(unwrap(&wrapped).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn corrupt_header_magic_fails() {
        let mut wrapped = wrap(b"data");
        wrapped[0] = b'X';
        assert_eq!(unwrap(&wrapped), Err(DecodingError::BadHeaderMagic));
    }

    #[test]
    fn corrupt_version_fails() {
        let mut wrapped = wrap(b"data");
        wrapped[4] = 0xff;
        assert!(matches!(
            unwrap(&wrapped),
            Err(DecodingError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn corrupt_length_fails() {
        let mut wrapped = wrap(b"data");
        wrapped[8] = 0xff;
        assert!(matches!(
            unwrap(&wrapped),
            Err(DecodingError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn corrupt_payload_byte_fails_checksum() {
        let mut wrapped = wrap(b"data");
        let payload_start = 12;
        wrapped[payload_start] ^= 0xff;
        assert!(matches!(
            unwrap(&wrapped),
            Err(DecodingError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn corrupt_checksum_fails() {
        let mut wrapped = wrap(b"data");
        let checksum_start = wrapped.len() - 8;
        wrapped[checksum_start] ^= 0xff;
        assert!(matches!(
            unwrap(&wrapped),
            Err(DecodingError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn corrupt_trailer_fails() {
        let mut wrapped = wrap(b"data");
        let last = wrapped.len() - 1;
        wrapped[last] = b'X';
        assert_eq!(unwrap(&wrapped), Err(DecodingError::BadTrailerMagic));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir();
        let path = dir.join("credentials.bin");
        let payload = b"round-trip-payload".to_vec();
        write_atomic(&path, &wrap(&payload)).await.unwrap();
        let read_back = read_with_fallback(&path).await.unwrap();
        assert_eq!(read_back, payload);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn read_falls_back_to_old_if_primary_missing() {
        let dir = tempdir();
        let path = dir.join("credentials.bin");
        let payload = b"fallback-payload".to_vec();
        write_atomic(&path, &wrap(&payload)).await.unwrap();
        // Simulate an interrupt that left only the `.old` replica behind.
        tokio::fs::rename(&path, path.with_extension("old"))
            .await
            .unwrap();
        let read_back = read_with_fallback(&path).await.unwrap();
        assert_eq!(read_back, payload);
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "session-supervisor-blob-test-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
