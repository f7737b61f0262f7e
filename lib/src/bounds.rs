//! Overflow-safe range checks shared by the partition, image and device layers.

use crate::{Error, Result};

/// Check that `bytes` starting at `offset` stay within `max`.
///
/// Each operand is compared against `max` on its own before the remaining
/// room is computed, so no intermediate value can wrap.
pub fn check_offset_and_bytes(max: u64, offset: u64, bytes: u64) -> Result<()> {
  if offset > max || bytes > max || bytes > max - offset {
    tracing::error!("offset={} bytes={} out of range, max={}", offset, bytes, max);
    return Err(Error::InvalidParameter(format!(
      "offset {} + {} bytes exceeds {}",
      offset, bytes, max
    )));
  }

  Ok(())
}

/// End of the range `[offset, offset + len)`, or `None` if it wraps.
pub fn checked_range_end(offset: u64, len: u64) -> Option<u64> {
  offset.checked_add(len)
}

/// Whether `[offset, offset + len)` lies inside a region of `capacity` bytes.
pub fn fits_within(offset: u64, len: u64, capacity: u64) -> bool {
  checked_range_end(offset, len).is_some_and(|end| end <= capacity)
}

pub(crate) fn byte_len(buf: &[u8]) -> u64 {
  buf.len() as u64
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_exact_fit() {
    assert!(check_offset_and_bytes(4096, 0, 4096).is_ok());
    assert!(check_offset_and_bytes(4096, 4096, 0).is_ok());
    assert!(check_offset_and_bytes(4096, 1000, 3096).is_ok());
  }

  #[test]
  fn rejects_past_end() {
    assert!(check_offset_and_bytes(4096, 1, 4096).is_err());
    assert!(check_offset_and_bytes(4096, 4097, 0).is_err());
    assert!(check_offset_and_bytes(4096, 0, 4097).is_err());
  }

  #[test]
  fn no_wraparound_near_u64_max() {
    assert!(check_offset_and_bytes(u64::MAX, u64::MAX, 1).is_err());
    assert!(check_offset_and_bytes(u64::MAX, 1, u64::MAX).is_err());
    assert!(check_offset_and_bytes(u64::MAX, u64::MAX, 0).is_ok());
    assert!(check_offset_and_bytes(1024, u64::MAX, u64::MAX).is_err());
  }

  #[test]
  fn range_helpers() {
    assert_eq!(checked_range_end(10, 20), Some(30));
    assert_eq!(checked_range_end(u64::MAX, 1), None);
    assert!(fits_within(512, 512, 1024));
    assert!(!fits_within(513, 512, 1024));
    assert!(!fits_within(u64::MAX - 1, 2, u64::MAX));
  }
}
