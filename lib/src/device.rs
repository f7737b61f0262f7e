//! Storage devices partitions live on.

use crate::{
  bounds::{byte_len, check_offset_and_bytes},
  Error, Result, BLOCK_IO_LOCAL_BUFFER_BLOCKS, ERASE_CHUNK_SIZE,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to a device. Several partitions usually point at one device.
pub type DeviceRef = Arc<dyn BlockDevice>;

/// Byte-addressed access to a storage device.
pub trait BlockDevice: Send + Sync {
  /// Name used in logs.
  fn name(&self) -> &str;

  /// Fill `buf` from the device starting at `offset`.
  fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

  /// Write all of `data` at `offset`.
  fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

  /// Native block size in bytes.
  fn block_size(&self) -> u32;

  /// Total size in bytes.
  fn capacity(&self) -> u64;

  /// Set `bytes` starting at `offset` to the erased value (0xff).
  fn erase(&self, offset: u64, bytes: u64) -> Result<()> {
    check_offset_and_bytes(self.capacity(), offset, bytes)?;

    let chunk = vec![0xffu8; ERASE_CHUNK_SIZE];
    let mut done = 0u64;
    while done < bytes {
      let len = std::cmp::min(ERASE_CHUNK_SIZE as u64, bytes - done) as usize;
      self.write(offset + done, &chunk[..len])?;
      done += len as u64;
    }

    Ok(())
  }
}

fn to_index(offset: u64) -> Result<usize> {
  usize::try_from(offset).map_err(|_| Error::InvalidParameter(format!("offset {} not addressable", offset)))
}

#[derive(Debug)]
struct MemoryInner {
  data: Vec<u8>,
  fail_reads: bool,
  fail_writes: bool,
  writes: usize,
}

/// RAM-backed device with fault injection, used for tests and staging.
#[derive(Debug)]
pub struct MemoryDevice {
  name: String,
  block_size: u32,
  capacity: u64,
  inner: Mutex<MemoryInner>,
}

impl MemoryDevice {
  /// Zero-filled device of `capacity` bytes.
  pub fn new(name: impl Into<String>, capacity: usize, block_size: u32) -> Self {
    Self::from_bytes(name, vec![0u8; capacity], block_size)
  }

  pub fn from_bytes(name: impl Into<String>, data: Vec<u8>, block_size: u32) -> Self {
    Self {
      name: name.into(),
      block_size,
      capacity: byte_len(&data),
      inner: Mutex::new(MemoryInner {
        data,
        fail_reads: false,
        fail_writes: false,
        writes: 0,
      }),
    }
  }

  pub fn into_ref(self) -> DeviceRef {
    Arc::new(self)
  }

  /// Make every following read fail with [Error::Device].
  pub fn set_fail_reads(&self, fail: bool) -> Result<()> {
    self.lock()?.fail_reads = fail;
    Ok(())
  }

  /// Make every following write fail with [Error::Device].
  pub fn set_fail_writes(&self, fail: bool) -> Result<()> {
    self.lock()?.fail_writes = fail;
    Ok(())
  }

  /// Number of successful write calls so far.
  pub fn write_count(&self) -> Result<usize> {
    Ok(self.lock()?.writes)
  }

  /// Copy of the whole device contents.
  pub fn snapshot(&self) -> Result<Vec<u8>> {
    Ok(self.lock()?.data.clone())
  }

  fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
    self
      .inner
      .lock()
      .map_err(|_| Error::Device(format!("{}: lock poisoned", self.name)))
  }
}

impl BlockDevice for MemoryDevice {
  fn name(&self) -> &str {
    &self.name
  }

  fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
    check_offset_and_bytes(self.capacity, offset, byte_len(buf))?;
    let inner = self.lock()?;
    if inner.fail_reads {
      return Err(Error::Device(format!("{}: read failed at offset={}", self.name, offset)));
    }

    let start = to_index(offset)?;
    buf.copy_from_slice(&inner.data[start..start + buf.len()]);
    Ok(())
  }

  fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
    check_offset_and_bytes(self.capacity, offset, byte_len(data))?;
    let mut inner = self.lock()?;
    if inner.fail_writes {
      return Err(Error::Device(format!("{}: write failed at offset={}", self.name, offset)));
    }

    let start = to_index(offset)?;
    inner.data[start..start + data.len()].copy_from_slice(data);
    inner.writes += 1;
    Ok(())
  }

  fn block_size(&self) -> u32 {
    self.block_size
  }

  fn capacity(&self) -> u64 {
    self.capacity
  }
}

/// Block-granular device access, as exposed by block-io firmware drivers.
pub trait BlockIo: Send + Sync {
  fn block_size(&self) -> u32;

  /// Index of the last addressable block.
  fn last_block(&self) -> u64;

  /// `buf.len()` is always a multiple of the block size.
  fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<()>;

  /// `data.len()` is always a multiple of the block size.
  fn write_blocks(&self, lba: u64, data: &[u8]) -> Result<()>;
}

/// Byte-addressed view over a [BlockIo].
///
/// Reads need a block-aligned offset and length. Writes need a block-aligned
/// offset; a trailing partial block is zero padded before it is written.
pub struct BlockIoDevice<B: BlockIo> {
  name: String,
  io: B,
}

impl<B: BlockIo> BlockIoDevice<B> {
  pub fn new(name: impl Into<String>, io: B) -> Self {
    Self { name: name.into(), io }
  }

  pub fn inner(&self) -> &B {
    &self.io
  }

  fn block_bytes(&self) -> Result<u64> {
    match self.io.block_size() {
      0 => {
        tracing::error!("{}: block size is zero", self.name);
        Err(Error::InvalidParameter(format!("{}: block size is zero", self.name)))
      }
      size => Ok(size as u64),
    }
  }

  fn check_aligned(&self, what: &str, value: u64) -> Result<u64> {
    let block_bytes = self.block_bytes()?;
    if value % block_bytes != 0 {
      tracing::error!("{}: {} {} not aligned to block size {}", self.name, what, value, block_bytes);
      return Err(Error::InvalidParameter(format!(
        "{} {} not a multiple of block size {}",
        what, value, block_bytes
      )));
    }

    Ok(block_bytes)
  }
}

impl<B: BlockIo> BlockDevice for BlockIoDevice<B> {
  fn name(&self) -> &str {
    &self.name
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
    let block_bytes = self.check_aligned("offset", offset)?;
    self.check_aligned("length", byte_len(buf))?;
    check_offset_and_bytes(self.capacity(), offset, byte_len(buf))?;

    self.io.read_blocks(offset / block_bytes, buf)
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
    let block_bytes = self.check_aligned("offset", offset)?;
    check_offset_and_bytes(self.capacity(), offset, byte_len(data))?;

    let block_size = block_bytes as usize;
    let mut lba = offset / block_bytes;
    if data.len() % block_size == 0 {
      return self.io.write_blocks(lba, data);
    }

    let mut local = vec![0u8; BLOCK_IO_LOCAL_BUFFER_BLOCKS * block_size];
    for chunk in data.chunks(local.len()) {
      let padded = chunk.len().div_ceil(block_size) * block_size;
      local[..chunk.len()].copy_from_slice(chunk);
      local[chunk.len()..padded].fill(0);

      tracing::trace!("{}: writing lba={} bytes={} padded={}", self.name, lba, chunk.len(), padded);
      self.io.write_blocks(lba, &local[..padded])?;
      lba += (padded / block_size) as u64;
    }

    Ok(())
  }

  fn block_size(&self) -> u32 {
    self.io.block_size()
  }

  /// Saturates at `u64::MAX`; zero when the block size is zero.
  fn capacity(&self) -> u64 {
    let block_bytes = self.io.block_size() as u64;
    self
      .io
      .last_block()
      .checked_add(1)
      .and_then(|blocks| blocks.checked_mul(block_bytes))
      .unwrap_or(if block_bytes == 0 { 0 } else { u64::MAX })
  }

  fn erase(&self, offset: u64, bytes: u64) -> Result<()> {
    let block_bytes = self.check_aligned("offset", offset)?;
    self.check_aligned("length", bytes)?;
    check_offset_and_bytes(self.capacity(), offset, bytes)?;

    let block_size = block_bytes as usize;
    let erased = vec![0xffu8; BLOCK_IO_LOCAL_BUFFER_BLOCKS * block_size];
    let mut lba = offset / block_bytes;
    let mut remaining = bytes as usize;
    while remaining > 0 {
      let len = std::cmp::min(remaining, erased.len());
      self.io.write_blocks(lba, &erased[..len])?;
      lba += (len / block_size) as u64;
      remaining -= len;
    }

    Ok(())
  }
}
