//! Logical firmware images: the A/B pair of partitions behind one image name.

use crate::{
  bounds::{byte_len, check_offset_and_bytes},
  config::FwConfig,
  partitions::{split_partition_name, BootChain, BR_BCT_PARTITION},
  registry::{PartitionKind, PartitionRegistry},
  Error, Result,
};

bitflags::bitflags! {
  /// Per-call overrides for which copy of an image is accessed.
  #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
  pub struct ImageFlags: u32 {
    const FORCE_PARTITION_A = 0x0000_0001;
    const FORCE_PARTITION_B = 0x0000_0002;
    const READ_INACTIVE_IMAGE = 0x0000_0004;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
  Unbound,
  PartiallyBound,
  Bound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageAttributes {
  /// Size of the copy a default read goes to.
  pub read_bytes: u64,
  /// Size of the copy a default write goes to.
  pub write_bytes: u64,
  pub block_size: u32,
}

#[derive(Debug, Clone)]
pub struct LogicalImage {
  name: String,
  chain_a: Option<usize>,
  chain_b: Option<usize>,
  /// The image has no chain B copy on this platform.
  single: bool,
  attributes: ImageAttributes,
}

impl LogicalImage {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Registry index of the copy on `chain`.
  pub fn partition(&self, chain: BootChain) -> Option<usize> {
    match chain {
      BootChain::A => self.chain_a,
      BootChain::B => self.chain_b,
    }
  }

  pub fn attributes(&self) -> ImageAttributes {
    self.attributes
  }

  pub fn binding_state(&self) -> BindingState {
    match (self.chain_a, self.chain_b) {
      (None, None) => BindingState::Unbound,
      (Some(_), Some(_)) => BindingState::Bound,
      _ if self.single => BindingState::Bound,
      _ => BindingState::PartiallyBound,
    }
  }

  /// Both expected copies are present.
  pub fn is_ready(&self) -> bool {
    self.binding_state() == BindingState::Bound
  }

  fn select(&self, flags: ImageFlags, active: BootChain, inactive: bool) -> Result<usize> {
    let index = if flags.contains(ImageFlags::FORCE_PARTITION_A) {
      self.chain_a
    } else if flags.contains(ImageFlags::FORCE_PARTITION_B) {
      self.chain_b
    } else if self.chain_a.is_some() && self.chain_b.is_some() {
      let chain = if inactive { active.other() } else { active };
      self.partition(chain)
    } else {
      self.chain_a.or(self.chain_b)
    };

    index.ok_or_else(|| Error::NotFound(format!("no partition bound for {} with {:?}", self.name, flags)))
  }
}

/// Image name a partition is grouped under, `None` when it is never exposed.
fn image_slot(name: &str) -> Option<(String, BootChain, bool)> {
  if name == BR_BCT_PARTITION {
    return None;
  }

  match split_partition_name(name) {
    Some((base, chain)) => Some((base.to_string(), chain, false)),
    None => Some((name.to_string(), BootChain::A, true)),
  }
}

pub struct FwImageTable {
  images: Vec<LogicalImage>,
  active_chain: BootChain,
  enable_b_partitions: bool,
  max_images: usize,
}

impl FwImageTable {
  pub fn new(active_chain: BootChain, config: &FwConfig) -> Self {
    Self {
      images: Vec::new(),
      active_chain,
      enable_b_partitions: config.enable_b_partitions,
      max_images: config.max_fw_images,
    }
  }

  /// Build the table from every partition in `registry`.
  ///
  /// Partitions that cannot be bound are logged and left out.
  pub fn from_registry(registry: &PartitionRegistry, config: &FwConfig) -> Self {
    let mut this = Self::new(registry.active_chain(), config);
    for index in 0..registry.count() {
      if let Err(e) = this.bind(registry, index) {
        tracing::warn!("not binding partition index {}: {}", index, e);
      }
    }
    this
  }

  /// Attach the partition at registry `index` to its image, creating the image if needed.
  pub fn bind(&mut self, registry: &PartitionRegistry, index: usize) -> Result<()> {
    let record = registry
      .get(index)
      .ok_or_else(|| Error::NotFound(format!("partition index {}", index)))?;
    let Some((name, chain, single)) = image_slot(record.name()) else {
      tracing::debug!("{} is not exposed as an image", record.name());
      return Ok(());
    };

    if chain == BootChain::B && !self.enable_b_partitions {
      tracing::debug!("B partitions disabled, skipping {}", record.name());
      return Ok(());
    }

    let position = match self.images.iter().position(|i| i.name == name) {
      Some(position) => position,
      None => {
        if self.images.len() >= self.max_images {
          return Err(Error::OutOfResources(format!(
            "image limit {} reached adding {}",
            self.max_images, name
          )));
        }
        self.images.push(LogicalImage {
          name: name.clone(),
          chain_a: None,
          chain_b: None,
          single: single || !self.enable_b_partitions,
          attributes: ImageAttributes::default(),
        });
        self.images.len() - 1
      }
    };

    let image = &mut self.images[position];
    let slot = match chain {
      BootChain::A => &mut image.chain_a,
      BootChain::B => &mut image.chain_b,
    };
    if slot.is_some() {
      return Err(Error::AlreadyRegistered(format!("{} chain {}", name, chain)));
    }
    *slot = Some(index);

    if let (Some(a), Some(b)) = (image.chain_a, image.chain_b) {
      let a_bytes = registry.get(a).map(|r| r.byte_length());
      let b_bytes = registry.get(b).map(|r| r.byte_length());
      if a_bytes != b_bytes {
        tracing::error!("{}: A/B sizes differ ({:?} vs {:?})", name, a_bytes, b_bytes);
        match chain {
          BootChain::A => image.chain_a = None,
          BootChain::B => image.chain_b = None,
        }
        return Err(Error::Unsupported(format!("{} copies differ in size", name)));
      }
    }

    self.refresh_image(registry, position)?;
    tracing::info!(
      "image {} bound to {} ({:?})",
      name,
      record.name(),
      self.images[position].binding_state()
    );
    Ok(())
  }

  fn refresh_image(&mut self, registry: &PartitionRegistry, position: usize) -> Result<()> {
    let image = &self.images[position];
    let read = image.select(ImageFlags::empty(), self.active_chain, false).ok();
    let write = image.select(ImageFlags::empty(), self.active_chain, true).ok();

    let bytes = |index: Option<usize>| index.and_then(|i| registry.get(i)).map(|r| r.byte_length()).unwrap_or(0);
    let block_size = [image.chain_a, image.chain_b]
      .into_iter()
      .flatten()
      .filter_map(|i| registry.get(i))
      .map(|r| r.device().block_size())
      .max()
      .unwrap_or(0);

    self.images[position].attributes = ImageAttributes {
      read_bytes: bytes(read),
      write_bytes: bytes(write),
      block_size,
    };
    Ok(())
  }

  /// Recompute the attributes of every image from the registry.
  pub fn refresh_attributes(&mut self, registry: &PartitionRegistry) -> Result<()> {
    for position in 0..self.images.len() {
      self.refresh_image(registry, position)?;
    }
    Ok(())
  }

  pub fn find(&self, name: &str) -> Option<&LogicalImage> {
    self.images.iter().find(|i| i.name == name)
  }

  pub fn count(&self) -> usize {
    self.images.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &LogicalImage> {
    self.images.iter()
  }

  pub fn names(&self) -> Vec<&str> {
    self.images.iter().map(|i| i.name.as_str()).collect()
  }

  pub fn binding_state(&self, name: &str) -> BindingState {
    self
      .find(name)
      .map(LogicalImage::binding_state)
      .unwrap_or(BindingState::Unbound)
  }

  pub fn is_ready(&self, name: &str) -> bool {
    self.binding_state(name) == BindingState::Bound
  }

  pub fn attributes(&self, name: &str) -> Result<ImageAttributes> {
    Ok(self.lookup(name)?.attributes)
  }

  fn lookup(&self, name: &str) -> Result<&LogicalImage> {
    self.find(name).ok_or_else(|| Error::NotFound(format!("image {}", name)))
  }

  /// Registry index a read of `name` with `flags` goes to.
  pub fn resolve_read(&self, name: &str, flags: ImageFlags) -> Result<usize> {
    let inactive = flags.contains(ImageFlags::READ_INACTIVE_IMAGE);
    self.lookup(name)?.select(flags, self.active_chain, inactive)
  }

  /// Registry index a write of `name` with `flags` goes to. Defaults to the inactive copy.
  pub fn resolve_write(&self, name: &str, flags: ImageFlags) -> Result<usize> {
    self.lookup(name)?.select(flags, self.active_chain, true)
  }

  pub fn read(&self, registry: &PartitionRegistry, name: &str, offset: u64, buf: &mut [u8], flags: ImageFlags) -> Result<()> {
    check_offset_and_bytes(self.lookup(name)?.attributes.read_bytes, offset, byte_len(buf))?;
    let index = self.resolve_read(name, flags)?;
    tracing::trace!("image {} read -> partition index {}", name, index);
    registry.read_at(index, offset, buf)
  }

  pub fn write(
    &mut self,
    registry: &mut PartitionRegistry,
    name: &str,
    offset: u64,
    data: &[u8],
    flags: ImageFlags,
  ) -> Result<()> {
    check_offset_and_bytes(self.lookup(name)?.attributes.write_bytes, offset, byte_len(data))?;
    let index = self.resolve_write(name, flags)?;
    tracing::debug!("image {} write -> partition index {}", name, index);
    registry.write_at(index, offset, data)?;

    if registry.get(index).map(|r| r.kind()) == Some(PartitionKind::UpdateInactivePartitions) {
      self.refresh_attributes(registry)?;
    }
    Ok(())
  }
}
