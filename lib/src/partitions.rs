//! Boot chains and the partition naming convention that ties A/B copies together.
//!
//! `<base>` and `<base>_a` belong to chain A, `<base>_b` to chain B. A handful
//! of reserved names never come in pairs and are always treated as active.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Pseudo-partition whose writes carry a GPT describing the inactive chain.
pub const UPDATE_INACTIVE_PARTITIONS: &str = "update-inactive-partitions";
/// Boot ROM boot configuration table holding the chain-select slots.
pub const BR_BCT_PARTITION: &str = "BCT";
pub const BR_BCT_BACKUP_PARTITION: &str = "BCT-boot-chain_backup";
pub const MB2_APPLET_PARTITION: &str = "mb2-applet";

const CHAIN_A_SUFFIX: &str = "_a";
const CHAIN_B_SUFFIX: &str = "_b";

lazy_static! {
  /// Names that are never part of an A/B pair.
  pub static ref RESERVED_PARTITION_NAMES: HashSet<&'static str> = {
    let mut s = HashSet::new();
    s.insert(BR_BCT_PARTITION);
    s.insert(BR_BCT_BACKUP_PARTITION);
    s.insert(MB2_APPLET_PARTITION);
    s.insert(UPDATE_INACTIVE_PARTITIONS);
    s
  };

  /// Firmware images recognized when the config does not list its own.
  pub static ref DEFAULT_IMAGE_NAMES: HashSet<&'static str> = {
    let mut s = HashSet::new();
    s.insert(BR_BCT_PARTITION);
    s.insert(BR_BCT_BACKUP_PARTITION);
    s.insert(MB2_APPLET_PARTITION);
    s.insert("mb1");
    s.insert("MB1_BCT");
    s.insert("MEM_BCT");
    s.insert("mb2");
    s.insert("cpu-bootloader");
    s.insert("secure-os");
    s.insert("bpmp-fw");
    s.insert("bpmp-fw-dtb");
    s.insert("sc7");
    s.insert("psc_bl1");
    s.insert("psc-fw");
    s.insert("mts-mce");
    s.insert("spe-fw");
    s.insert("rce-fw");
    s.insert("tsec-fw");
    s.insert("nvdec");
    s.insert("uefi_variables");
    s
  };
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootChain {
  A,
  B,
}

impl BootChain {
  pub fn from_id(id: u32) -> Option<Self> {
    match id {
      0 => Some(BootChain::A),
      1 => Some(BootChain::B),
      _ => None,
    }
  }

  pub fn id(self) -> u32 {
    match self {
      BootChain::A => 0,
      BootChain::B => 1,
    }
  }

  pub fn other(self) -> Self {
    match self {
      BootChain::A => BootChain::B,
      BootChain::B => BootChain::A,
    }
  }
}

impl std::fmt::Display for BootChain {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      BootChain::A => write!(f, "A"),
      BootChain::B => write!(f, "B"),
    }
  }
}

pub fn is_reserved_name(name: &str) -> bool {
  RESERVED_PARTITION_NAMES.contains(name)
}

/// Split a partition name into its image base name and chain.
///
/// Returns `None` for reserved names and names with nothing left after the suffix.
pub fn split_partition_name(name: &str) -> Option<(&str, BootChain)> {
  if is_reserved_name(name) {
    return None;
  }

  let (base, chain) = if let Some(base) = name.strip_suffix(CHAIN_B_SUFFIX) {
    (base, BootChain::B)
  } else if let Some(base) = name.strip_suffix(CHAIN_A_SUFFIX) {
    (base, BootChain::A)
  } else {
    (name, BootChain::A)
  };

  if base.is_empty() {
    return None;
  }

  Some((base, chain))
}

/// Image name a partition belongs to; reserved names are their own image.
pub fn image_base_name(name: &str) -> &str {
  split_partition_name(name).map(|(base, _)| base).unwrap_or(name)
}

/// Whether `name` belongs to `active`. Names outside the A/B scheme always do.
pub fn is_active_partition(name: &str, active: BootChain) -> bool {
  match split_partition_name(name) {
    Some((_, chain)) => chain == active,
    None => true,
  }
}

/// Name of the `chain` copy of the image `base`.
pub fn boot_chain_partition_name(base: &str, chain: BootChain) -> String {
  match chain {
    BootChain::A => base.to_string(),
    BootChain::B => format!("{}{}", base, CHAIN_B_SUFFIX),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chain_ids() {
    assert_eq!(BootChain::from_id(0), Some(BootChain::A));
    assert_eq!(BootChain::from_id(1), Some(BootChain::B));
    assert_eq!(BootChain::from_id(2), None);
    assert_eq!(BootChain::B.id(), 1);
    assert_eq!(BootChain::A.other(), BootChain::B);
  }

  #[test]
  fn split_names() {
    assert_eq!(split_partition_name("mb1"), Some(("mb1", BootChain::A)));
    assert_eq!(split_partition_name("mb1_a"), Some(("mb1", BootChain::A)));
    assert_eq!(split_partition_name("mb1_b"), Some(("mb1", BootChain::B)));
    assert_eq!(split_partition_name("psc_bl1"), Some(("psc_bl1", BootChain::A)));
    assert_eq!(split_partition_name("_b"), None);
    assert_eq!(split_partition_name("BCT"), None);
    assert_eq!(split_partition_name("BCT-boot-chain_backup"), None);
    assert_eq!(split_partition_name(UPDATE_INACTIVE_PARTITIONS), None);
  }

  #[test]
  fn activity() {
    assert!(is_active_partition("mb1", BootChain::A));
    assert!(!is_active_partition("mb1_b", BootChain::A));
    assert!(is_active_partition("mb1_b", BootChain::B));
    assert!(!is_active_partition("mb1", BootChain::B));
    assert!(is_active_partition("mb2-applet", BootChain::B));
  }

  #[test]
  fn chain_partition_names() {
    assert_eq!(boot_chain_partition_name("mb2", BootChain::A), "mb2");
    assert_eq!(boot_chain_partition_name("mb2", BootChain::B), "mb2_b");
    assert_eq!(image_base_name("mb2_b"), "mb2");
    assert_eq!(image_base_name("BCT"), "BCT");
  }

  #[test]
  fn default_images_include_reserved_firmware() {
    assert!(DEFAULT_IMAGE_NAMES.contains("BCT"));
    assert!(DEFAULT_IMAGE_NAMES.contains("mb2-applet"));
    assert!(!DEFAULT_IMAGE_NAMES.contains(UPDATE_INACTIVE_PARTITIONS));
  }
}
