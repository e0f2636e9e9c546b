//! Checksum calculation and logic.
//!

pub mod unordered;

use crate::error::Error::ParseError;
use crate::error::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crc32c::crc32c_append;
use md5::{Digest, Md5};

/// Compute the hex-encoded MD5 sum of the data.
pub fn md5_hex(data: &[u8]) -> String {
    let mut ctx = Md5::new();
    ctx.update(data);
    hex::encode(ctx.finalize())
}

/// A streaming CRC32C accumulator.
///
/// The digest is the 4-byte big-endian representation of the CRC, which is
/// the byte order Google Storage uses when it base64-encodes the value into
/// object metadata.
#[derive(Debug, Clone, Default)]
pub struct Crc32c(u32);

impl Crc32c {
    /// Create a new accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the checksum with some data.
    pub fn update(&mut self, data: &[u8]) {
        self.0 = crc32c_append(self.0, data);
    }

    /// Finalize into the big-endian digest bytes.
    pub fn digest(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Get the hex-encoded digest.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.digest())
    }

    /// Get the digest in the form Google Storage assigns to objects.
    pub fn gcs_b64(&self) -> String {
        STANDARD.encode(self.digest())
    }
}

/// Compute the S3 multipart composite ETag from hex-encoded per-part MD5
/// sums. Each part sum is decoded to its 16 binary bytes, the concatenation
/// is MD5-summed, and the part count is appended after a dash.
pub fn composite_etag(part_md5s: &[String]) -> Result<String> {
    let mut concat = Vec::with_capacity(part_md5s.len() * 16);
    for sum in part_md5s {
        let bytes =
            hex::decode(sum).map_err(|err| ParseError(format!("invalid part md5: {}", err)))?;
        concat.extend(bytes);
    }

    Ok(format!("{}-{}", md5_hex(&concat), part_md5s.len()))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use anyhow::Result;

    pub(crate) const EXPECTED_MD5_SUM: &str = "9e107d9d372bb6826bd81d3542a419d6"; // pragma: allowlist secret
    pub(crate) const EXPECTED_CRC32C_B64: &str = "ImIEBA==";

    pub(crate) fn test_data() -> &'static [u8] {
        b"The quick brown fox jumps over the lazy dog"
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(test_data()), EXPECTED_MD5_SUM);
    }

    #[test]
    fn test_crc32c_known_value() {
        // RFC 3720 test vector, crc32c(b"123456789") == 0xe3069283.
        let mut ctx = Crc32c::new();
        ctx.update(b"123456789");
        assert_eq!(ctx.hex_digest(), "e3069283");
        assert_eq!(ctx.gcs_b64(), "4waSgw==");
    }

    #[test]
    fn test_crc32c_gcs_b64() {
        let mut ctx = Crc32c::new();
        ctx.update(test_data());
        assert_eq!(ctx.gcs_b64(), EXPECTED_CRC32C_B64);
    }

    #[test]
    fn test_crc32c_streaming_matches_oneshot() {
        let mut streamed = Crc32c::new();
        for chunk in test_data().chunks(5) {
            streamed.update(chunk);
        }

        let mut oneshot = Crc32c::new();
        oneshot.update(test_data());

        assert_eq!(streamed.gcs_b64(), oneshot.gcs_b64());
    }

    #[test]
    fn test_composite_etag() -> Result<()> {
        let parts = vec![md5_hex(b"first part"), md5_hex(b"second part")];

        let mut concat = hex::decode(&parts[0])?;
        concat.extend(hex::decode(&parts[1])?);
        let expected = format!("{}-2", md5_hex(&concat));

        assert_eq!(composite_etag(&parts)?, expected);

        Ok(())
    }

    #[test]
    fn test_composite_etag_rejects_invalid_hex() {
        assert!(composite_etag(&["not-hex".to_string()]).is_err());
    }
}
