use crate::{
  brbct::BrBctUpdater,
  config::{FwConfig, PlatformInfo},
  device::DeviceRef,
  image::{FwImageTable, ImageFlags},
  partitions::BootChain,
  registry::PartitionRegistry,
  Error, Result,
};

/// Everything the firmware update core owns for one boot: the config, the
/// partition registry and the image table built on top of it.
pub struct FwContext {
  config: FwConfig,
  platform: PlatformInfo,
  registry: PartitionRegistry,
  images: FwImageTable,
}

impl FwContext {
  pub fn init(config: FwConfig, platform: PlatformInfo) -> Result<Self> {
    let active = BootChain::from_id(platform.active_boot_chain)
      .ok_or_else(|| Error::InvalidParameter(format!("invalid active boot chain {}", platform.active_boot_chain)))?;
    tracing::info!("firmware context on boot chain {}", active);

    let registry = PartitionRegistry::new(active, &config);
    let images = FwImageTable::new(active, &config);
    Ok(Self {
      config,
      platform,
      registry,
      images,
    })
  }

  pub fn config(&self) -> &FwConfig {
    &self.config
  }

  pub fn platform(&self) -> &PlatformInfo {
    &self.platform
  }

  pub fn active_chain(&self) -> BootChain {
    self.registry.active_chain()
  }

  pub fn registry(&self) -> &PartitionRegistry {
    &self.registry
  }

  pub fn images(&self) -> &FwImageTable {
    &self.images
  }

  fn rebuild_images(&mut self) {
    self.images = FwImageTable::from_registry(&self.registry, &self.config);
  }

  /// Register the firmware partitions listed in the backup GPT of `device`.
  pub fn add_device(&mut self, device: &DeviceRef) -> Result<usize> {
    let added = self.registry.add_from_device_gpt(device)?;
    self.rebuild_images();
    Ok(added)
  }

  /// Register a partition at a fixed location, for devices without a GPT.
  pub fn add_partition(&mut self, name: &str, device: DeviceRef, offset: u64, length: u64) -> Result<()> {
    self.registry.add(name, device, offset, length)?;
    self.rebuild_images();
    Ok(())
  }

  /// Expose the inactive-partition update pseudo-partition backed by `device`.
  pub fn enable_inactive_partition_updates(&mut self, device: DeviceRef) -> Result<()> {
    self.registry.add_pseudo_partition(device)?;
    self.rebuild_images();
    Ok(())
  }

  pub fn bind_mm_device(&mut self, device: DeviceRef) {
    self.registry.bind_mm_device(device);
  }

  pub fn read_image(&self, name: &str, offset: u64, buf: &mut [u8], flags: ImageFlags) -> Result<()> {
    self.images.read(&self.registry, name, offset, buf, flags)
  }

  pub fn write_image(&mut self, name: &str, offset: u64, data: &[u8], flags: ImageFlags) -> Result<()> {
    self.images.write(&mut self.registry, name, offset, data, flags)
  }

  /// Chain-switch primitive over this context's BCT partition.
  pub fn br_bct_updater(&self, erase_block_size: u64) -> Result<BrBctUpdater> {
    BrBctUpdater::new(&self.registry, erase_block_size, &self.config)
  }

  /// Drop all partitions and images.
  pub fn deinit(&mut self) {
    self.registry.deinit();
    self.images = FwImageTable::new(self.registry.active_chain(), &self.config);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    device::MemoryDevice,
    gpt::{BackupGpt, GptEntry},
  };
  use std::sync::Arc;

  #[test]
  fn rejects_unknown_chain() {
    let info = PlatformInfo {
      active_boot_chain: 7,
      br_bct_update_flag: false,
    };
    assert!(matches!(
      FwContext::init(FwConfig::default(), info),
      Err(Error::InvalidParameter(_))
    ));
  }

  #[test]
  fn device_scan_builds_images() {
    let mem = Arc::new(MemoryDevice::new("emmc", 1024 * 1024, 512));
    BackupGpt::build(
      1024 * 1024,
      &[GptEntry::new("mb1", 40, 47), GptEntry::new("mb1_b", 48, 55)],
    )
    .unwrap()
    .write_to(mem.as_ref())
    .unwrap();

    let mut ctx = FwContext::init(FwConfig::default(), PlatformInfo::default()).unwrap();
    let dev: DeviceRef = mem;
    assert_eq!(ctx.add_device(&dev).unwrap(), 2);
    assert!(ctx.images().is_ready("mb1"));

    ctx.write_image("mb1", 0, b"fw", ImageFlags::empty()).unwrap();
    let mut buf = [0u8; 2];
    ctx.read_image("mb1", 0, &mut buf, ImageFlags::FORCE_PARTITION_B).unwrap();
    assert_eq!(&buf, b"fw");

    ctx.deinit();
    assert!(ctx.registry().is_empty());
    assert_eq!(ctx.images().count(), 0);
  }
}
