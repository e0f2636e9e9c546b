//! Checksums over parts that arrive in arbitrary order from a concurrent
//! fetcher.
//!

use crate::checksum::{composite_etag, md5_hex, Crc32c};
use crate::error::Result;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Accumulates per-part MD5 sums and produces the S3 composite ETag.
///
/// Parts can be added in any order because each part sum is independent;
/// ordering is restored with a sort at digest time.
#[derive(Debug, Default)]
pub struct S3EtagUnordered {
    checksums: Vec<(u64, String)>,
}

impl S3EtagUnordered {
    /// Create a new unordered ETag accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a part's data under its part number.
    pub fn update(&mut self, part_number: u64, data: &[u8]) {
        self.checksums.push((part_number, md5_hex(data)));
    }

    /// Finalize into the composite ETag.
    pub fn hex_digest(mut self) -> Result<String> {
        self.checksums.sort();
        let sums = self
            .checksums
            .into_iter()
            .map(|(_, sum)| sum)
            .collect::<Vec<_>>();

        composite_etag(&sums)
    }
}

/// Accumulates CRC32C over parts that may arrive out of order.
///
/// CRC32C composition is not commutative over arbitrary boundaries, so parts
/// ahead of the next expected number are buffered and folded into the
/// rolling checksum only once the run up to them is contiguous.
#[derive(Debug, Default)]
pub struct GsCrc32cUnordered {
    next_part_number: u64,
    buffered: BTreeMap<u64, Bytes>,
    checksum: Crc32c,
}

impl GsCrc32cUnordered {
    /// Create a new unordered CRC32C accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a part's data under its part number, draining any contiguous run
    /// into the rolling checksum.
    pub fn update(&mut self, part_number: u64, data: Bytes) {
        self.buffered.insert(part_number, data);
        while let Some(data) = self.buffered.remove(&self.next_part_number) {
            self.checksum.update(&data);
            self.next_part_number += 1;
        }
    }

    /// Finalize into the Google Storage base64 form, flushing any buffered
    /// parts in ascending order.
    pub fn gcs_b64(mut self) -> String {
        for (_, data) in std::mem::take(&mut self.buffered) {
            self.checksum.update(&data);
        }
        self.checksum.gcs_b64()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::checksum::test::test_data;
    use anyhow::Result;

    #[test]
    fn test_s3_etag_unordered_matches_ordered() -> Result<()> {
        let parts: Vec<&[u8]> = vec![b"part zero", b"part one", b"part two", b"part three"];

        let mut unordered = S3EtagUnordered::new();
        for number in [3u64, 0, 2, 1] {
            unordered.update(number, parts[number as usize]);
        }

        let sums = parts.iter().map(|part| md5_hex(part)).collect::<Vec<_>>();
        let expected = composite_etag(&sums)?;

        assert_eq!(unordered.hex_digest()?, expected);

        Ok(())
    }

    #[test]
    fn test_gs_crc32c_unordered_shuffled_parts() {
        let data = test_data();
        let parts = data.chunks(11).map(Bytes::copy_from_slice).collect::<Vec<_>>();

        let mut order = (0..parts.len() as u64).collect::<Vec<_>>();
        order.reverse();
        order.swap(0, parts.len() / 2);

        let mut unordered = GsCrc32cUnordered::new();
        for number in order {
            unordered.update(number, parts[number as usize].clone());
        }

        let mut expected = Crc32c::new();
        expected.update(data);

        assert_eq!(unordered.gcs_b64(), expected.gcs_b64());
    }

    #[test]
    fn test_gs_crc32c_unordered_explicit_sequence() {
        let (d0, d1, d2, d3): (&[u8], &[u8], &[u8], &[u8]) =
            (b"alpha", b"beta", b"gamma", b"delta");

        let mut unordered = GsCrc32cUnordered::new();
        for (number, data) in [(3u64, d3), (0, d0), (2, d2), (1, d1)] {
            unordered.update(number, Bytes::copy_from_slice(data));
        }

        let mut expected = Crc32c::new();
        expected.update(b"alphabetagammadelta");

        assert_eq!(unordered.gcs_b64(), expected.gcs_b64());
    }

    #[test]
    fn test_gs_crc32c_unordered_empty() {
        let unordered = GsCrc32cUnordered::new();
        assert_eq!(unordered.gcs_b64(), Crc32c::new().gcs_b64());
    }
}
