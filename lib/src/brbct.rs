//! Boot ROM chain selection through the slots of the BCT partition.
//!
//! The partition holds four logical slots. The boot ROM boots chain A while
//! slot A0 holds a valid BCT and falls back to chain B once A0 is erased, so
//! switching chains is a matter of copying and erasing slots.

use crate::{
  bounds::{byte_len, check_offset_and_bytes},
  config::FwConfig,
  partitions::{BootChain, BR_BCT_PARTITION},
  registry::{PartitionRecord, PartitionRegistry},
  update::ChainSwitch,
  Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrBctSlot {
  A0 = 0,
  B0 = 1,
  A1 = 2,
  B1 = 3,
}

impl BrBctSlot {
  fn index(self) -> u64 {
    self as u64
  }
}

pub struct BrBctUpdater {
  partition: PartitionRecord,
  active_chain: BootChain,
  slot_size: u64,
  verify_before_write: bool,
  overwrite_active: bool,
}

impl BrBctUpdater {
  /// Locate the BCT partition in `registry`. Slots are at least one erase block.
  pub fn new(registry: &PartitionRegistry, erase_block_size: u64, config: &FwConfig) -> Result<Self> {
    let partition = registry
      .find(BR_BCT_PARTITION)
      .ok_or_else(|| Error::NotFound(format!("{} partition", BR_BCT_PARTITION)))?
      .clone();
    let br_bct = config.br_bct_config();
    let slot_size = std::cmp::max(erase_block_size, br_bct.logical_slot_size);

    tracing::debug!(
      "BR-BCT on {}: offset={} bytes={} slot size={}",
      partition.device().name(),
      partition.byte_offset(),
      partition.byte_length(),
      slot_size
    );

    Ok(Self {
      partition,
      active_chain: registry.active_chain(),
      slot_size,
      verify_before_write: br_bct.verify_before_write,
      overwrite_active: config.overwrite_active_partition,
    })
  }

  pub fn slot_size(&self) -> u64 {
    self.slot_size
  }

  /// Device offset of `slot`, checked to lie inside the partition.
  fn slot_offset(&self, slot: BrBctSlot) -> Result<u64> {
    let relative = slot.index() * self.slot_size;
    check_offset_and_bytes(self.partition.byte_length(), relative, self.slot_size)?;
    Ok(self.partition.byte_offset() + relative)
  }

  pub fn read_slot(&self, slot: BrBctSlot) -> Result<Vec<u8>> {
    tracing::debug!("reading BR-BCT slot {:?}", slot);
    let offset = self.slot_offset(slot)?;
    let mut buf = vec![0u8; self.slot_size as usize];
    self.partition.device().read(offset, &mut buf).inspect_err(|e| {
      tracing::error!("error reading slot {:?}: {}", slot, e);
    })?;
    Ok(buf)
  }

  fn write_slot(&self, slot: BrBctSlot, data: &[u8]) -> Result<()> {
    tracing::debug!("writing BR-BCT slot {:?}", slot);
    let offset = self.slot_offset(slot)?;
    self.partition.device().write(offset, data).inspect_err(|e| {
      tracing::error!("error writing slot {:?}: {}", slot, e);
    })
  }

  fn verify_slot(&self, slot: BrBctSlot, data: &[u8]) -> Result<()> {
    let current = self.read_slot(slot)?;
    if current[..data.len()] != *data {
      return Err(Error::VolumeCorrupted(format!("slot {:?} does not match", slot)));
    }
    Ok(())
  }

  fn write_and_verify_slot(&self, slot: BrBctSlot, data: &[u8]) -> Result<()> {
    if self.verify_before_write && self.verify_slot(slot, data).is_ok() {
      tracing::info!("slot {:?} bytes={} no update needed", slot, data.len());
      return Ok(());
    }

    self.write_slot(slot, data)?;
    self.verify_slot(slot, data)
  }

  /// Copy `input` into `output`. Both must be even or both odd.
  pub fn copy_slot(&self, output: BrBctSlot, input: BrBctSlot) -> Result<()> {
    tracing::debug!("copying slot {:?} to slot {:?}", input, output);
    if (output.index() ^ input.index()) & 1 != 0 {
      return Err(Error::InvalidParameter(format!(
        "slots {:?} and {:?} are not both odd or even",
        input, output
      )));
    }

    let data = self.read_slot(input)?;
    self.write_and_verify_slot(output, &data)
  }

  fn erase_slot(&self, slot: BrBctSlot) -> Result<()> {
    tracing::debug!("erasing BR-BCT slot {:?}", slot);
    if slot != BrBctSlot::A0 {
      return Err(Error::InvalidParameter(format!("can only erase A0, not {:?}", slot)));
    }

    let offset = self.slot_offset(slot)?;
    self.partition.device().erase(offset, self.slot_size)
  }

  /// Write a new BCT into slot A0.
  ///
  /// Only possible while running chain A with writes to active partitions allowed.
  pub fn update_bct(&self, data: &[u8]) -> Result<()> {
    if byte_len(data) > self.partition.byte_length() || byte_len(data) > self.slot_size {
      return Err(Error::InvalidParameter(format!("BCT of {} bytes does not fit a slot", data.len())));
    }

    if self.active_chain != BootChain::A || !self.overwrite_active {
      return Err(Error::Unsupported(format!(
        "BCT update on chain {} with overwrite={}",
        self.active_chain, self.overwrite_active
      )));
    }

    self.write_and_verify_slot(BrBctSlot::A0, data)
  }
}

impl ChainSwitch for BrBctUpdater {
  fn update_fw_chain(&mut self, chain: u32) -> Result<()> {
    tracing::info!("BR-BCT: active chain={} new chain={}", self.active_chain, chain);
    match BootChain::from_id(chain) {
      Some(BootChain::A) => self.copy_slot(BrBctSlot::A0, BrBctSlot::A1),
      Some(BootChain::B) => {
        // A0 may be what booted us, keep a copy in A1 before dropping it
        self.copy_slot(BrBctSlot::A1, BrBctSlot::A0).inspect_err(|e| {
          tracing::error!("error copying slot A0 to A1 before erasing A0: {}", e);
        })?;
        self.erase_slot(BrBctSlot::A0)
      }
      None => Err(Error::InvalidParameter(format!("no boot chain {}", chain))),
    }
  }
}
