//! Registry of the firmware partitions found on the platform's devices.

use crate::{
  bounds::{byte_len, check_offset_and_bytes, fits_within},
  config::FwConfig,
  device::DeviceRef,
  gpt::{self, GptHeader, GptSlot},
  partitions::{
    image_base_name, is_active_partition, split_partition_name, BootChain, UPDATE_INACTIVE_PARTITIONS,
  },
  Error, Result, FW_PARTITION_NAME_LENGTH, GPT_BLOCK_SIZE, PSEUDO_PARTITION_SIZE,
};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
  /// A byte range on a storage device.
  Storage,
  /// Accepts a GPT describing the inactive chain and re-points inactive partitions at it.
  UpdateInactivePartitions,
}

#[derive(Clone)]
pub struct PartitionRecord {
  name: String,
  device: DeviceRef,
  byte_offset: u64,
  byte_length: u64,
  is_active_chain: bool,
  kind: PartitionKind,
}

impl std::fmt::Debug for PartitionRecord {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PartitionRecord")
      .field("name", &self.name)
      .field("device", &self.device.name())
      .field("byte_offset", &self.byte_offset)
      .field("byte_length", &self.byte_length)
      .field("is_active_chain", &self.is_active_chain)
      .field("kind", &self.kind)
      .finish()
  }
}

impl PartitionRecord {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn device(&self) -> &DeviceRef {
    &self.device
  }

  pub fn byte_offset(&self) -> u64 {
    self.byte_offset
  }

  pub fn byte_length(&self) -> u64 {
    self.byte_length
  }

  pub fn is_active_chain(&self) -> bool {
    self.is_active_chain
  }

  pub fn kind(&self) -> PartitionKind {
    self.kind
  }

  /// Chain the partition belongs to, `None` for names outside the A/B scheme.
  pub fn chain(&self) -> Option<BootChain> {
    split_partition_name(&self.name).map(|(_, chain)| chain)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAttributes {
  pub bytes: u64,
  pub block_size: u32,
}

pub struct PartitionRegistry {
  records: Vec<PartitionRecord>,
  max_partitions: usize,
  active_chain: BootChain,
  overwrite_active: bool,
  recognized: HashSet<String>,
  mm_device: Option<DeviceRef>,
}

impl PartitionRegistry {
  pub fn new(active_chain: BootChain, config: &FwConfig) -> Self {
    tracing::debug!(
      "partition registry: active chain={} max partitions={}",
      active_chain,
      config.max_fw_partitions
    );

    Self {
      records: Vec::new(),
      max_partitions: config.max_fw_partitions,
      active_chain,
      overwrite_active: config.overwrite_active_partition,
      recognized: config.recognized_images(),
      mm_device: None,
    }
  }

  /// Drop every record and any bound management-mode device.
  pub fn deinit(&mut self) {
    tracing::debug!("partition registry: dropping {} partitions", self.records.len());
    self.records.clear();
    self.mm_device = None;
  }

  pub fn active_chain(&self) -> BootChain {
    self.active_chain
  }

  pub fn overwrite_active(&self) -> bool {
    self.overwrite_active
  }

  /// Whether `name` maps to an image on the allow-list.
  pub fn is_recognized(&self, name: &str) -> bool {
    self.recognized.contains(image_base_name(name))
  }

  /// Register a partition covering `length` bytes at `offset` on `device`.
  ///
  /// Names whose image is not recognized are skipped and reported as success.
  pub fn add(&mut self, name: &str, device: DeviceRef, offset: u64, length: u64) -> Result<()> {
    if !self.is_recognized(name) {
      tracing::debug!("skipping unrecognized partition {}", name);
      return Ok(());
    }

    if name.is_empty() || name.encode_utf16().count() > FW_PARTITION_NAME_LENGTH {
      return Err(Error::InvalidParameter(format!("bad partition name {:?}", name)));
    }

    if !fits_within(offset, length, device.capacity()) {
      tracing::error!(
        "{}: offset={} length={} does not fit on {} ({} bytes)",
        name,
        offset,
        length,
        device.name(),
        device.capacity()
      );
      return Err(Error::InvalidParameter(format!(
        "{} range {}+{} exceeds device {}",
        name,
        offset,
        length,
        device.name()
      )));
    }

    self.insert(PartitionRecord {
      name: name.to_string(),
      is_active_chain: is_active_partition(name, self.active_chain),
      device,
      byte_offset: offset,
      byte_length: length,
      kind: PartitionKind::Storage,
    })
  }

  /// Register the inactive-partition update pseudo-partition on `device`.
  pub fn add_pseudo_partition(&mut self, device: DeviceRef) -> Result<()> {
    self.insert(PartitionRecord {
      name: UPDATE_INACTIVE_PARTITIONS.to_string(),
      device,
      byte_offset: 0,
      byte_length: PSEUDO_PARTITION_SIZE,
      is_active_chain: false,
      kind: PartitionKind::UpdateInactivePartitions,
    })
  }

  fn insert(&mut self, record: PartitionRecord) -> Result<()> {
    if self.find(&record.name).is_some() {
      tracing::error!("partition {} already registered", record.name);
      return Err(Error::AlreadyRegistered(record.name));
    }

    if self.records.len() >= self.max_partitions {
      tracing::error!("cannot add {}: already have {} partitions", record.name, self.records.len());
      return Err(Error::OutOfResources(format!(
        "partition limit {} reached adding {}",
        self.max_partitions, record.name
      )));
    }

    tracing::info!(
      "added partition {} on {}: offset={} bytes={} active={}",
      record.name,
      record.device.name(),
      record.byte_offset,
      record.byte_length,
      record.is_active_chain
    );
    self.records.push(record);
    Ok(())
  }

  /// Validate a partition table and register every named entry on `device`.
  ///
  /// Returns the number of partitions added; a table with none is `NotFound`.
  pub fn add_from_partition_table(&mut self, header: &GptHeader, entries: &[u8], device: &DeviceRef) -> Result<usize> {
    gpt::validate_table(header, entries)?;

    let before = self.records.len();
    for slot in gpt::parse_entries(header, entries)? {
      let entry = match slot {
        GptSlot::Used(entry) if !entry.name.is_empty() => entry,
        _ => continue,
      };
      if !self.is_recognized(&entry.name) {
        tracing::debug!("skipping unrecognized partition {}", entry.name);
        continue;
      }

      let blocks = entry
        .size_in_blocks()
        .ok_or_else(|| Error::InvalidParameter(format!("{} has an inverted lba range", entry.name)))?;
      let offset = entry
        .starting_lba
        .checked_mul(GPT_BLOCK_SIZE)
        .ok_or_else(|| Error::InvalidParameter(format!("{} starting lba overflows", entry.name)))?;
      let length = blocks
        .checked_mul(GPT_BLOCK_SIZE)
        .ok_or_else(|| Error::InvalidParameter(format!("{} size overflows", entry.name)))?;

      self.add(&entry.name, device.clone(), offset, length)?;
    }

    let added = self.records.len() - before;
    if added == 0 {
      tracing::error!("no firmware partitions found on {}", device.name());
      return Err(Error::NotFound(format!("no firmware partitions on {}", device.name())));
    }

    Ok(added)
  }

  /// Read and validate the backup GPT at the end of `device` and register its partitions.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  pub fn add_from_device_gpt(&mut self, device: &DeviceRef) -> Result<usize> {
    let capacity = device.capacity();
    let header_offset = gpt::backup_header_offset(capacity, GPT_BLOCK_SIZE)
      .ok_or_else(|| Error::InvalidParameter(format!("{} is too small for a GPT", device.name())))?;

    tracing::debug!("reading backup GPT header from {} at {}", device.name(), header_offset);
    let mut block = vec![0u8; GPT_BLOCK_SIZE as usize];
    device.read(header_offset, &mut block)?;
    let header = gpt::validate_header(&block).inspect_err(|e| {
      tracing::error!("invalid backup GPT header on {}: {}", device.name(), e);
    })?;

    let table_offset = gpt::partition_table_offset(&header, capacity)?;
    let mut table = vec![0u8; header.table_size_bytes()?];
    device.read(table_offset, &mut table)?;
    gpt::validate_table(&header, &table).inspect_err(|e| {
      tracing::error!("invalid backup GPT table on {}: {}", device.name(), e);
    })?;

    self.add_from_partition_table(&header, &table, device)
  }

  /// Device that receives a copy of every inactive-partition update.
  pub fn bind_mm_device(&mut self, device: DeviceRef) {
    tracing::debug!("bound management-mode device {}", device.name());
    self.mm_device = Some(device);
  }

  pub fn find(&self, name: &str) -> Option<&PartitionRecord> {
    self.records.iter().find(|r| r.name == name)
  }

  pub fn find_index(&self, name: &str) -> Option<usize> {
    self.records.iter().position(|r| r.name == name)
  }

  pub fn get(&self, index: usize) -> Option<&PartitionRecord> {
    self.records.get(index)
  }

  pub fn count(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &PartitionRecord> {
    self.records.iter()
  }

  pub fn attributes(&self, name: &str) -> Result<PartitionAttributes> {
    let record = self.lookup(name)?;
    Ok(PartitionAttributes {
      bytes: record.byte_length,
      block_size: record.device.block_size(),
    })
  }

  fn lookup(&self, name: &str) -> Result<&PartitionRecord> {
    self.find(name).ok_or_else(|| Error::NotFound(format!("partition {}", name)))
  }

  fn record_at(&self, index: usize) -> Result<&PartitionRecord> {
    self
      .records
      .get(index)
      .ok_or_else(|| Error::NotFound(format!("partition index {}", index)))
  }

  pub fn read(&self, name: &str, offset: u64, buf: &mut [u8]) -> Result<()> {
    let index = self.find_index(name).ok_or_else(|| Error::NotFound(format!("partition {}", name)))?;
    self.read_at(index, offset, buf)
  }

  pub fn write(&mut self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
    let index = self.find_index(name).ok_or_else(|| Error::NotFound(format!("partition {}", name)))?;
    self.write_at(index, offset, data)
  }

  /// Read from the partition at `index`, `offset` bytes into it.
  pub fn read_at(&self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
    let record = self.record_at(index)?;
    check_offset_and_bytes(record.byte_length, offset, byte_len(buf))?;
    if record.kind == PartitionKind::UpdateInactivePartitions {
      return Err(Error::InvalidParameter(format!("{} cannot be read", record.name)));
    }

    let device_offset = self.device_offset(record, offset)?;
    tracing::trace!("read {}: offset={} bytes={}", record.name, offset, buf.len());
    record.device.read(device_offset, buf)
  }

  /// Write to the partition at `index`, `offset` bytes into it.
  pub fn write_at(&mut self, index: usize, offset: u64, data: &[u8]) -> Result<()> {
    let record = self.record_at(index)?;
    check_offset_and_bytes(record.byte_length, offset, byte_len(data))?;
    if record.kind == PartitionKind::UpdateInactivePartitions {
      if offset != 0 {
        return Err(Error::InvalidParameter(format!("{} must be written from offset 0", record.name)));
      }
      return self.update_inactive_partitions(data);
    }

    let device_offset = self.device_offset(record, offset)?;
    if record.is_active_chain && !self.overwrite_active {
      tracing::error!("refusing to write active partition {}", record.name);
      return Err(Error::WriteProtected(record.name.clone()));
    }

    tracing::debug!("write {}: offset={} bytes={}", record.name, offset, data.len());
    record.device.write(device_offset, data)
  }

  fn device_offset(&self, record: &PartitionRecord, offset: u64) -> Result<u64> {
    check_offset_and_bytes(record.device.capacity(), record.byte_offset, record.byte_length)?;
    record
      .byte_offset
      .checked_add(offset)
      .ok_or_else(|| Error::InvalidParameter(format!("{}: offset {} overflows", record.name, offset)))
  }

  /// Parse a GPT header block plus entry array and move every registered
  /// inactive-chain partition it names to its new location.
  fn update_inactive_partitions(&mut self, data: &[u8]) -> Result<()> {
    let block = data
      .get(..GPT_BLOCK_SIZE as usize)
      .ok_or_else(|| Error::InvalidParameter(format!("{} bytes is too short for a GPT", data.len())))?;
    let header = gpt::validate_header(block)?;

    let table_size = header.table_size_bytes()?;
    let table = data
      .get(GPT_BLOCK_SIZE as usize..GPT_BLOCK_SIZE as usize + table_size)
      .ok_or_else(|| Error::InvalidParameter(format!("GPT table needs {} bytes", table_size)))?;
    gpt::validate_table(&header, table)?;

    let inactive = self.active_chain.other();
    let mut moves = Vec::new();
    for slot in gpt::parse_entries(&header, table)? {
      let entry = match slot {
        GptSlot::Used(entry) => entry,
        GptSlot::Unused => continue,
      };
      match split_partition_name(&entry.name) {
        Some((_, chain)) if chain == inactive => {}
        _ => continue,
      }
      let Some(index) = self.find_index(&entry.name) else {
        tracing::debug!("{} is not registered, ignoring", entry.name);
        continue;
      };

      let record = &self.records[index];
      let offset = entry.starting_lba.checked_mul(GPT_BLOCK_SIZE);
      let length = entry.size_in_blocks().and_then(|b| b.checked_mul(GPT_BLOCK_SIZE));
      match (offset, length) {
        (Some(offset), Some(length)) if fits_within(offset, length, record.device.capacity()) => {
          moves.push((index, offset, length));
        }
        _ => {
          tracing::error!(
            "{}: new range lba {}..={} does not fit on {}",
            entry.name,
            entry.starting_lba,
            entry.ending_lba,
            record.device.name()
          );
          return Err(Error::InvalidParameter(format!("{} new range exceeds device", entry.name)));
        }
      }
    }

    if let Some(mm) = &self.mm_device {
      tracing::debug!("forwarding inactive partition update to {}", mm.name());
      mm.write(0, data)?;
    }

    for (index, offset, length) in &moves {
      let record = &mut self.records[*index];
      tracing::info!(
        "{}: offset {} -> {}, bytes {} -> {}",
        record.name,
        record.byte_offset,
        offset,
        record.byte_length,
        length
      );
      record.byte_offset = *offset;
      record.byte_length = *length;
    }

    tracing::info!("updated {} inactive partitions", moves.len());
    Ok(())
  }
}
