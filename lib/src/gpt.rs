//! GUID partition table parsing, validation and encoding.
//!
//! Only the backup copy at the end of a device is consumed by the registry,
//! but headers and tables are validated the same way regardless of which copy
//! they came from.

use crate::{bounds::checked_range_end, device::BlockDevice, FW_PARTITION_NAME_LENGTH, GPT_BLOCK_SIZE};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;
pub const GPT_HEADER_SIZE: usize = 92;
pub const GPT_ENTRY_SIZE: usize = 128;
pub const GPT_DEFAULT_ENTRY_COUNT: u32 = 128;
const MAX_PARTITION_ENTRIES: u32 = 1024;
// primary header block plus a 128-entry table
const FIRST_USABLE_LBA: u64 = 34;

/// Basic data partition type, stored in GPT mixed-endian order.
pub const BASIC_DATA_TYPE_GUID: Guid = [
  0xa2, 0xa0, 0xd0, 0xeb, 0xe5, 0xb9, 0x33, 0x44, 0x87, 0xc0, 0x68, 0xb6, 0xb7, 0x26, 0x99, 0xc7,
];

pub type Guid = [u8; 16];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GptError {
  #[error("invalid GPT signature")]
  InvalidSignature,
  #[error("{what} checksum mismatch: stored={stored:#010x} computed={computed:#010x}")]
  ChecksumMismatch {
    what: &'static str,
    stored: u32,
    computed: u32,
  },
  #[error("size inconsistent: {0}")]
  SizeInconsistent(String),
}

type GptResult<T> = std::result::Result<T, GptError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
  pub revision: u32,
  pub header_size: u32,
  pub header_crc32: u32,
  pub my_lba: u64,
  pub alternate_lba: u64,
  pub first_usable_lba: u64,
  pub last_usable_lba: u64,
  pub disk_guid: Guid,
  pub partition_entry_lba: u64,
  pub number_of_partition_entries: u32,
  pub size_of_partition_entry: u32,
  pub partition_entry_array_crc32: u32,
}

fn le_u32(buf: &[u8], at: usize) -> GptResult<u32> {
  buf
    .get(at..at + 4)
    .and_then(|b| b.try_into().ok())
    .map(u32::from_le_bytes)
    .ok_or_else(|| GptError::SizeInconsistent(format!("truncated field at byte {}", at)))
}

fn le_u64(buf: &[u8], at: usize) -> GptResult<u64> {
  buf
    .get(at..at + 8)
    .and_then(|b| b.try_into().ok())
    .map(u64::from_le_bytes)
    .ok_or_else(|| GptError::SizeInconsistent(format!("truncated field at byte {}", at)))
}

fn guid(buf: &[u8], at: usize) -> GptResult<Guid> {
  buf
    .get(at..at + 16)
    .and_then(|b| b.try_into().ok())
    .ok_or_else(|| GptError::SizeInconsistent(format!("truncated guid at byte {}", at)))
}

impl GptHeader {
  /// Bytes occupied by the partition entry array this header describes.
  pub fn table_size_bytes(&self) -> GptResult<usize> {
    (self.number_of_partition_entries as usize)
      .checked_mul(self.size_of_partition_entry as usize)
      .ok_or_else(|| {
        GptError::SizeInconsistent(format!(
          "{} entries of {} bytes overflow",
          self.number_of_partition_entries, self.size_of_partition_entry
        ))
      })
  }

  /// Encode the header with a freshly computed header checksum.
  pub fn to_bytes(&self) -> Vec<u8> {
    let len = (self.header_size as usize).clamp(GPT_HEADER_SIZE, GPT_BLOCK_SIZE as usize);
    let mut buf = vec![0u8; len];
    buf[0..8].copy_from_slice(GPT_SIGNATURE);
    buf[8..12].copy_from_slice(&self.revision.to_le_bytes());
    buf[12..16].copy_from_slice(&(len as u32).to_le_bytes());
    buf[24..32].copy_from_slice(&self.my_lba.to_le_bytes());
    buf[32..40].copy_from_slice(&self.alternate_lba.to_le_bytes());
    buf[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
    buf[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
    buf[56..72].copy_from_slice(&self.disk_guid);
    buf[72..80].copy_from_slice(&self.partition_entry_lba.to_le_bytes());
    buf[80..84].copy_from_slice(&self.number_of_partition_entries.to_le_bytes());
    buf[84..88].copy_from_slice(&self.size_of_partition_entry.to_le_bytes());
    buf[88..92].copy_from_slice(&self.partition_entry_array_crc32.to_le_bytes());

    let crc = crc32(&buf);
    buf[16..20].copy_from_slice(&crc.to_le_bytes());
    buf
  }
}

/// Parse and validate a GPT header at the start of `buf`.
///
/// Checks the signature, the declared header size, the header checksum
/// (computed with its own field zeroed), and that the entry array size is
/// sane and computable without overflow.
pub fn validate_header(buf: &[u8]) -> GptResult<GptHeader> {
  if buf.len() < GPT_HEADER_SIZE {
    return Err(GptError::SizeInconsistent(format!(
      "{} bytes is too small for a header",
      buf.len()
    )));
  }

  if &buf[0..8] != GPT_SIGNATURE {
    tracing::debug!("bad GPT signature: {:02x?}", &buf[0..8]);
    return Err(GptError::InvalidSignature);
  }

  let header_size = le_u32(buf, 12)?;
  if (header_size as usize) < GPT_HEADER_SIZE
    || header_size as u64 > GPT_BLOCK_SIZE
    || header_size as usize > buf.len()
  {
    return Err(GptError::SizeInconsistent(format!("header size {}", header_size)));
  }

  let stored = le_u32(buf, 16)?;
  let mut scratch = buf[..header_size as usize].to_vec();
  scratch[16..20].fill(0);
  let computed = crc32(&scratch);
  if stored != computed {
    return Err(GptError::ChecksumMismatch {
      what: "header",
      stored,
      computed,
    });
  }

  let header = GptHeader {
    revision: le_u32(buf, 8)?,
    header_size,
    header_crc32: stored,
    my_lba: le_u64(buf, 24)?,
    alternate_lba: le_u64(buf, 32)?,
    first_usable_lba: le_u64(buf, 40)?,
    last_usable_lba: le_u64(buf, 48)?,
    disk_guid: guid(buf, 56)?,
    partition_entry_lba: le_u64(buf, 72)?,
    number_of_partition_entries: le_u32(buf, 80)?,
    size_of_partition_entry: le_u32(buf, 84)?,
    partition_entry_array_crc32: le_u32(buf, 88)?,
  };

  let entry_size = header.size_of_partition_entry;
  if (entry_size as usize) < GPT_ENTRY_SIZE || entry_size % 8 != 0 {
    return Err(GptError::SizeInconsistent(format!("partition entry size {}", entry_size)));
  }

  let count = header.number_of_partition_entries;
  if count == 0 || count > MAX_PARTITION_ENTRIES {
    return Err(GptError::SizeInconsistent(format!("partition entry count {}", count)));
  }

  header.table_size_bytes()?;
  Ok(header)
}

/// Verify the entry array checksum for a validated header.
pub fn validate_table(header: &GptHeader, entries: &[u8]) -> GptResult<()> {
  let size = header.table_size_bytes()?;
  let table = entries.get(..size).ok_or_else(|| {
    GptError::SizeInconsistent(format!("table needs {} bytes, got {}", size, entries.len()))
  })?;

  let computed = crc32(table);
  if computed != header.partition_entry_array_crc32 {
    return Err(GptError::ChecksumMismatch {
      what: "partition table",
      stored: header.partition_entry_array_crc32,
      computed,
    });
  }

  Ok(())
}

/// Byte offset of the backup header on a device of `device_bytes`.
pub fn backup_header_offset(device_bytes: u64, block_size: u64) -> Option<u64> {
  if block_size == 0 {
    return None;
  }

  (device_bytes / block_size).checked_sub(1).map(|lba| lba * block_size)
}

/// Byte offset of the entry array a header points at, checked to lie on the device.
pub fn partition_table_offset(header: &GptHeader, device_bytes: u64) -> GptResult<u64> {
  let offset = header.partition_entry_lba.checked_mul(GPT_BLOCK_SIZE).ok_or_else(|| {
    GptError::SizeInconsistent(format!("entry lba {} overflows", header.partition_entry_lba))
  })?;

  let size = header.table_size_bytes()? as u64;
  match checked_range_end(offset, size) {
    Some(end) if end <= device_bytes => Ok(offset),
    _ => Err(GptError::SizeInconsistent(format!(
      "table at {} + {} bytes is past the device end {}",
      offset, size, device_bytes
    ))),
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
  pub type_guid: Guid,
  pub unique_guid: Guid,
  pub starting_lba: u64,
  pub ending_lba: u64,
  pub attributes: u64,
  pub name: String,
}

/// One slot of the entry array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GptSlot {
  Unused,
  Used(GptEntry),
}

impl GptEntry {
  /// Basic data partition covering `starting_lba..=ending_lba`.
  pub fn new(name: &str, starting_lba: u64, ending_lba: u64) -> Self {
    let mut unique_guid = [0u8; 16];
    unique_guid[..8].copy_from_slice(&starting_lba.to_le_bytes());
    unique_guid[8..].copy_from_slice(&ending_lba.to_le_bytes());

    Self {
      type_guid: BASIC_DATA_TYPE_GUID,
      unique_guid,
      starting_lba,
      ending_lba,
      attributes: 0,
      name: name.to_string(),
    }
  }

  pub fn parse(raw: &[u8]) -> GptResult<GptSlot> {
    let type_guid = guid(raw, 0)?;
    if type_guid == [0u8; 16] {
      return Ok(GptSlot::Unused);
    }

    let name_bytes = raw
      .get(56..56 + FW_PARTITION_NAME_LENGTH * 2)
      .ok_or_else(|| GptError::SizeInconsistent(format!("entry of {} bytes", raw.len())))?;
    let units = name_bytes
      .chunks_exact(2)
      .map(|c| u16::from_le_bytes([c[0], c[1]]))
      .take_while(|u| *u != 0);
    let name = char::decode_utf16(units)
      .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
      .collect();

    Ok(GptSlot::Used(GptEntry {
      type_guid,
      unique_guid: guid(raw, 16)?,
      starting_lba: le_u64(raw, 32)?,
      ending_lba: le_u64(raw, 40)?,
      attributes: le_u64(raw, 48)?,
      name,
    }))
  }

  /// Inclusive block count, `None` if the range is inverted.
  pub fn size_in_blocks(&self) -> Option<u64> {
    self.ending_lba.checked_sub(self.starting_lba)?.checked_add(1)
  }

  /// Encode the entry. Names longer than the entry can hold are truncated.
  pub fn to_bytes(&self) -> [u8; GPT_ENTRY_SIZE] {
    let mut buf = [0u8; GPT_ENTRY_SIZE];
    buf[0..16].copy_from_slice(&self.type_guid);
    buf[16..32].copy_from_slice(&self.unique_guid);
    buf[32..40].copy_from_slice(&self.starting_lba.to_le_bytes());
    buf[40..48].copy_from_slice(&self.ending_lba.to_le_bytes());
    buf[48..56].copy_from_slice(&self.attributes.to_le_bytes());
    for (i, unit) in self.name.encode_utf16().take(FW_PARTITION_NAME_LENGTH).enumerate() {
      buf[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    buf
  }
}

/// Parse every slot of a validated entry array.
pub fn parse_entries(header: &GptHeader, entries: &[u8]) -> GptResult<Vec<GptSlot>> {
  let size = header.size_of_partition_entry as usize;
  let table = entries.get(..header.table_size_bytes()?).ok_or_else(|| {
    GptError::SizeInconsistent(format!("entry array of {} bytes is truncated", entries.len()))
  })?;

  table.chunks_exact(size).map(GptEntry::parse).collect()
}

/// Encode `entries` into an array of `entry_count` slots, returning it with its checksum.
pub fn encode_table(entries: &[GptEntry], entry_count: u32) -> GptResult<(Vec<u8>, u32)> {
  if entries.len() > entry_count as usize {
    return Err(GptError::SizeInconsistent(format!(
      "{} entries do not fit in {} slots",
      entries.len(),
      entry_count
    )));
  }

  let mut table = vec![0u8; entry_count as usize * GPT_ENTRY_SIZE];
  for (slot, entry) in table.chunks_exact_mut(GPT_ENTRY_SIZE).zip(entries) {
    slot.copy_from_slice(&entry.to_bytes());
  }

  let crc = crc32(&table);
  Ok((table, crc))
}

/// A backup GPT (entry array followed by the header in the last block).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupGpt {
  pub header: GptHeader,
  pub table: Vec<u8>,
}

impl BackupGpt {
  /// Lay out a backup GPT for a device of `device_bytes` holding `entries`.
  pub fn build(device_bytes: u64, entries: &[GptEntry]) -> GptResult<Self> {
    let (table, table_crc) = encode_table(entries, GPT_DEFAULT_ENTRY_COUNT)?;
    let table_blocks = (table.len() as u64).div_ceil(GPT_BLOCK_SIZE);

    let last_lba = (device_bytes / GPT_BLOCK_SIZE)
      .checked_sub(1)
      .filter(|last| *last > FIRST_USABLE_LBA + table_blocks)
      .ok_or_else(|| GptError::SizeInconsistent(format!("device of {} bytes is too small", device_bytes)))?;
    let table_lba = last_lba - table_blocks;
    let last_usable_lba = table_lba - 1;

    for entry in entries {
      if entry.size_in_blocks().is_none()
        || entry.starting_lba < FIRST_USABLE_LBA
        || entry.ending_lba > last_usable_lba
      {
        return Err(GptError::SizeInconsistent(format!(
          "{} spans lba {}..={} outside {}..={}",
          entry.name, entry.starting_lba, entry.ending_lba, FIRST_USABLE_LBA, last_usable_lba
        )));
      }
    }

    let mut header = GptHeader {
      revision: GPT_REVISION,
      header_size: GPT_HEADER_SIZE as u32,
      header_crc32: 0,
      my_lba: last_lba,
      alternate_lba: 1,
      first_usable_lba: FIRST_USABLE_LBA,
      last_usable_lba,
      disk_guid: [0u8; 16],
      partition_entry_lba: table_lba,
      number_of_partition_entries: GPT_DEFAULT_ENTRY_COUNT,
      size_of_partition_entry: GPT_ENTRY_SIZE as u32,
      partition_entry_array_crc32: table_crc,
    };
    header.header_crc32 = le_u32(&header.to_bytes(), 16)?;

    Ok(Self { header, table })
  }

  pub fn header_offset(&self) -> u64 {
    self.header.my_lba * GPT_BLOCK_SIZE
  }

  pub fn table_offset(&self) -> u64 {
    self.header.partition_entry_lba * GPT_BLOCK_SIZE
  }

  /// Header block followed by the entry array, the layout accepted by the
  /// inactive-partition update pseudo-partition.
  pub fn to_update_buffer(&self) -> Vec<u8> {
    let mut buf = vec![0u8; GPT_BLOCK_SIZE as usize];
    let header = self.header.to_bytes();
    buf[..header.len()].copy_from_slice(&header);
    buf.extend_from_slice(&self.table);
    buf
  }

  pub fn write_to(&self, device: &dyn BlockDevice) -> crate::Result<()> {
    tracing::debug!(
      "writing backup GPT to {}: table={} header={}",
      device.name(),
      self.table_offset(),
      self.header_offset()
    );
    device.write(self.table_offset(), &self.table)?;

    let mut block = vec![0u8; GPT_BLOCK_SIZE as usize];
    let header = self.header.to_bytes();
    block[..header.len()].copy_from_slice(&header);
    device.write(self.header_offset(), &block)
  }
}

/// CRC-32 (IEEE 802.3) as used by GPT.
pub fn crc32(data: &[u8]) -> u32 {
  const CRC32_TABLE: [u32; 256] = generate_crc32_table();

  let mut crc = 0xffff_ffffu32;
  for &byte in data {
    let index = ((crc ^ byte as u32) & 0xff) as usize;
    crc = (crc >> 8) ^ CRC32_TABLE[index];
  }

  !crc
}

const fn generate_crc32_table() -> [u32; 256] {
  const POLYNOMIAL: u32 = 0xedb8_8320;
  let mut table = [0u32; 256];
  let mut i = 0;

  while i < 256 {
    let mut crc = i as u32;
    let mut j = 0;
    while j < 8 {
      if crc & 1 != 0 {
        crc = (crc >> 1) ^ POLYNOMIAL;
      } else {
        crc >>= 1;
      }
      j += 1;
    }
    table[i] = crc;
    i += 1;
  }

  table
}
