mod bounds;
mod brbct;
mod context;
mod image;
mod partitions;
mod registry;
mod state;
mod update;

pub mod config;
pub mod device;
pub mod gpt;
pub mod variables;

use std::sync::Arc;

pub use bounds::{check_offset_and_bytes, checked_range_end, fits_within};
pub use brbct::{BrBctSlot, BrBctUpdater};
pub use context::FwContext;
pub use image::{BindingState, FwImageTable, ImageAttributes, ImageFlags, LogicalImage};
pub use partitions::*;
pub use registry::{PartitionAttributes, PartitionKind, PartitionRecord, PartitionRegistry};
pub use state::{finish_plan, transition, Action, BootFacts, StatusCode, UpdateState};
pub use update::{BootAction, BootChainUpdater, ChainSwitch, PlatformControl};

pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// an update to the given chain was requested for the next boot
  UpdateRequested(u32),
  /// persisted update status changed
  StatusChanged(StatusCode),
  /// chain-select metadata now points at the given chain
  ChainSwitched(u32),
  /// cold reset into the given chain is about to happen
  Resetting(u32),
  /// handing off to the OS on the given chain
  BootingOs(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("invalid parameter: {0}")]
  InvalidParameter(String),
  #[error("partition {0} is already registered")]
  AlreadyRegistered(String),
  #[error("out of resources: {0}")]
  OutOfResources(String),
  #[error("partition {0} is write protected")]
  WriteProtected(String),
  #[error("not found: {0}")]
  NotFound(String),
  #[error("unsupported: {0}")]
  Unsupported(String),
  #[error("volume corrupted: {0}")]
  VolumeCorrupted(String),
  #[error("device error: {0}")]
  Device(String),
  #[error("GPT error: {0}")]
  Gpt(#[from] gpt::GptError),
  #[error("variable store error: {0}")]
  Variable(String),
  #[error("an update is already in progress")]
  UpdateInProgress,
  #[error("unsupported config version: {0}")]
  UnsupportedVersion(usize),
  #[error("invalid config: {0}")]
  InvalidConfig(String),
  #[error("could not find config at {0}")]
  NoConfig(std::path::PathBuf),
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("failed to deserialize json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("slice conversion error: {0}")]
  Bytes(#[from] std::array::TryFromSliceError),
}

const SUPPORTED_CONFIG_VERSION: usize = 1;

const DEFAULT_CONFIG: &[u8] = include_bytes!("../resources/default-config.json");

/// Block size GPT LBAs are expressed in, independent of the device block size.
pub const GPT_BLOCK_SIZE: u64 = 512;
/// Longest partition name a GPT entry can hold, in UTF-16 units.
pub const FW_PARTITION_NAME_LENGTH: usize = 36;

const DEFAULT_MAX_FW_PARTITIONS: usize = 64;
const DEFAULT_MAX_FW_IMAGES: usize = 32;
const DEFAULT_MAX_RESET_COUNT: u32 = 3;
const DEFAULT_BOOT_CHAIN_COUNT: u32 = 2;
const DEFAULT_BR_BCT_SLOT_SIZE: u64 = 16 * 1024;

// block-io writes that don't cover whole blocks are staged through a buffer of this many blocks
const BLOCK_IO_LOCAL_BUFFER_BLOCKS: usize = 8;
const ERASE_CHUNK_SIZE: usize = 8 * GPT_BLOCK_SIZE as usize;
// the update pseudo-partition takes a GPT header block followed by up to 128 entries
const PSEUDO_PARTITION_SIZE: u64 = GPT_BLOCK_SIZE + 128 * 128;
