use crate::{
  partitions::DEFAULT_IMAGE_NAMES, Error, Result, DEFAULT_BOOT_CHAIN_COUNT, DEFAULT_BR_BCT_SLOT_SIZE,
  DEFAULT_CONFIG, DEFAULT_MAX_FW_IMAGES, DEFAULT_MAX_FW_PARTITIONS, DEFAULT_MAX_RESET_COUNT,
  SUPPORTED_CONFIG_VERSION,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fs::read_to_string, path::Path};

/// Platform firmware update settings.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FwConfig {
  pub metadata_version: usize,
  /// Image names the registry accepts. Falls back to the built-in list when absent.
  pub image_names: Option<Vec<String>>,
  /// Allow writes to partitions on the running chain.
  #[serde(default)]
  pub overwrite_active_partition: bool,
  #[serde(default = "default_max_fw_partitions")]
  pub max_fw_partitions: usize,
  #[serde(default = "default_max_fw_images")]
  pub max_fw_images: usize,
  /// Expose chain B partitions through the image layer.
  #[serde(default = "default_true")]
  pub enable_b_partitions: bool,
  #[serde(default = "default_max_reset_count")]
  pub max_reset_count: u32,
  #[serde(default = "default_boot_chain_count")]
  pub boot_chain_count: u32,
  pub br_bct: Option<BrBctConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BrBctConfig {
  #[serde(default = "default_br_bct_slot_size")]
  pub logical_slot_size: u64,
  /// Compare a slot with the data first and skip the write when it already matches.
  #[serde(default)]
  pub verify_before_write: bool,
}

impl Default for BrBctConfig {
  fn default() -> Self {
    Self {
      logical_slot_size: DEFAULT_BR_BCT_SLOT_SIZE,
      verify_before_write: false,
    }
  }
}

/// Facts about the current boot handed over by earlier boot stages.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformInfo {
  pub active_boot_chain: u32,
  /// Boot ROM chain-select metadata was flagged as needing a rewrite.
  #[serde(default)]
  pub br_bct_update_flag: bool,
}

impl PlatformInfo {
  pub fn from_standalone(json: &str) -> Result<Self> {
    Ok(serde_json::from_str(json)?)
  }
}

fn default_max_fw_partitions() -> usize {
  DEFAULT_MAX_FW_PARTITIONS
}

fn default_max_fw_images() -> usize {
  DEFAULT_MAX_FW_IMAGES
}

fn default_true() -> bool {
  true
}

fn default_max_reset_count() -> u32 {
  DEFAULT_MAX_RESET_COUNT
}

fn default_boot_chain_count() -> u32 {
  DEFAULT_BOOT_CHAIN_COUNT
}

fn default_br_bct_slot_size() -> u64 {
  DEFAULT_BR_BCT_SLOT_SIZE
}

impl Default for FwConfig {
  fn default() -> Self {
    Self {
      metadata_version: SUPPORTED_CONFIG_VERSION,
      image_names: None,
      overwrite_active_partition: false,
      max_fw_partitions: DEFAULT_MAX_FW_PARTITIONS,
      max_fw_images: DEFAULT_MAX_FW_IMAGES,
      enable_b_partitions: true,
      max_reset_count: DEFAULT_MAX_RESET_COUNT,
      boot_chain_count: DEFAULT_BOOT_CHAIN_COUNT,
      br_bct: None,
    }
  }
}

impl FwConfig {
  /// Create a new FwConfig from a standalone json document
  pub fn from_standalone(json: &str) -> Result<Self> {
    let this: FwConfig = serde_json::from_str(json)?;
    this.check_config_supported()?;
    Ok(this)
  }

  /// Load a FwConfig from a json file on disk.
  ///
  /// # Parameters
  /// - `path`: path to the json file
  pub fn from_file(path: &Path) -> Result<Self> {
    if !path.exists() || !path.is_file() {
      return Err(Error::NoConfig(path.to_owned()));
    }

    let json = read_to_string(path)?;
    Self::from_standalone(&json)
  }

  /// Create a new FwConfig using the built-in defaults
  pub fn from_default() -> Result<Self> {
    let this: FwConfig = serde_json::from_slice(DEFAULT_CONFIG)?;
    this.check_config_supported()?;
    Ok(this)
  }

  /// The set of image names the partition registry will accept.
  pub fn recognized_images(&self) -> HashSet<String> {
    match &self.image_names {
      Some(names) => names.iter().cloned().collect(),
      None => DEFAULT_IMAGE_NAMES.iter().map(|n| n.to_string()).collect(),
    }
  }

  pub fn br_bct_config(&self) -> BrBctConfig {
    self.br_bct.clone().unwrap_or_default()
  }

  fn check_config_supported(&self) -> Result<()> {
    if self.metadata_version != SUPPORTED_CONFIG_VERSION {
      return Err(Error::UnsupportedVersion(self.metadata_version));
    }

    if self.max_fw_partitions == 0 || self.max_fw_images == 0 {
      return Err(Error::InvalidConfig("partition and image limits must be non-zero".into()));
    }

    if self.boot_chain_count != DEFAULT_BOOT_CHAIN_COUNT {
      return Err(Error::InvalidConfig(format!(
        "{} boot chains configured, only {} are supported",
        self.boot_chain_count, DEFAULT_BOOT_CHAIN_COUNT
      )));
    }

    if self.max_reset_count == 0 {
      return Err(Error::InvalidConfig("maxResetCount must be at least 1".into()));
    }

    if let Some(br_bct) = &self.br_bct {
      if br_bct.logical_slot_size == 0 {
        return Err(Error::InvalidConfig("brBct.logicalSlotSize must be non-zero".into()));
      }
    }

    if let Some(names) = &self.image_names {
      if let Some(bad) = names.iter().find(|n| n.is_empty()) {
        return Err(Error::InvalidConfig(format!("invalid image name {:?}", bad)));
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_parses() {
    let config = FwConfig::from_default().unwrap();
    assert_eq!(config.metadata_version, 1);
    assert_eq!(config.max_fw_partitions, 64);
    assert_eq!(config.max_reset_count, 3);
    assert!(config.enable_b_partitions);
    assert!(!config.overwrite_active_partition);
    assert_eq!(config.br_bct_config().logical_slot_size, 16384);
    assert!(config.recognized_images().contains("mb1"));
  }

  #[test]
  fn minimal_config_gets_defaults() {
    let config = FwConfig::from_standalone(r#"{ "metadataVersion": 1, "imageNames": ["mb1", "BCT"] }"#).unwrap();
    assert_eq!(config.max_fw_images, 32);
    assert_eq!(config.boot_chain_count, 2);
    assert_eq!(config.br_bct_config(), BrBctConfig::default());
    assert_eq!(config.recognized_images().len(), 2);
  }

  #[test]
  #[should_panic]
  fn unsupported_version() {
    FwConfig::from_standalone(r#"{ "metadataVersion": 2 }"#).unwrap();
  }

  #[test]
  #[should_panic]
  fn zero_partition_limit() {
    FwConfig::from_standalone(r#"{ "metadataVersion": 1, "maxFwPartitions": 0 }"#).unwrap();
  }

  #[test]
  #[should_panic]
  fn three_boot_chains() {
    FwConfig::from_standalone(r#"{ "metadataVersion": 1, "bootChainCount": 3 }"#).unwrap();
  }

  #[test]
  fn missing_file() {
    let err = FwConfig::from_file(Path::new("/nonexistent/bootchain.json")).unwrap_err();
    assert!(matches!(err, Error::NoConfig(_)));
  }

  #[test]
  fn platform_info() {
    let info = PlatformInfo::from_standalone(r#"{ "activeBootChain": 1 }"#).unwrap();
    assert_eq!(info.active_boot_chain, 1);
    assert!(!info.br_bct_update_flag);
  }
}
