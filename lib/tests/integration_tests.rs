//! End-to-end tests: partitions discovered from a GPT, images written through
//! the A/B layer, and update attempts driven across simulated reboots with the
//! BCT slots acting as the boot ROM's chain selector.

use bootchain::{
  config::{BrBctConfig, FwConfig, PlatformInfo},
  device::{BlockDevice, DeviceRef, MemoryDevice},
  gpt::{BackupGpt, GptEntry},
  variables::{BootChainVariable, MemoryVariableStore, VariableStore},
  BootAction, BootChainUpdater, FwContext, PlatformControl, StatusCode,
};
use std::sync::Arc;

const DEVICE_BYTES: usize = 1024 * 1024;
const SLOT: u64 = 4096;
const BCT_LBA: u64 = 64;

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn config() -> FwConfig {
  FwConfig {
    image_names: Some(vec!["BCT".into(), "mb1".into(), "mb2".into()]),
    br_bct: Some(BrBctConfig {
      logical_slot_size: SLOT,
      verify_before_write: false,
    }),
    ..Default::default()
  }
}

fn layout() -> Vec<GptEntry> {
  vec![
    GptEntry::new("mb1", 40, 47),
    GptEntry::new("mb1_b", 48, 55),
    GptEntry::new("BCT", BCT_LBA, BCT_LBA + 4 * SLOT / 512 - 1),
    GptEntry::new("mb2", 100, 115),
    GptEntry::new("mb2_b", 116, 131),
    GptEntry::new("kernel", 200, 263),
  ]
}

/// Boot device with a backup GPT and a BCT whose A0 slot is valid.
fn boot_device() -> Arc<MemoryDevice> {
  let mem = Arc::new(MemoryDevice::new("emmc", DEVICE_BYTES, 512));
  BackupGpt::build(DEVICE_BYTES as u64, &layout())
    .unwrap()
    .write_to(mem.as_ref())
    .unwrap();

  let bct = BCT_LBA * 512;
  mem.write(bct, &vec![0xa0; SLOT as usize]).unwrap();
  mem.write(bct + SLOT, &vec![0xb0; SLOT as usize]).unwrap();
  mem.write(bct + 2 * SLOT, &vec![0xa1; SLOT as usize]).unwrap();
  mem.write(bct + 3 * SLOT, &vec![0xb1; SLOT as usize]).unwrap();
  mem
}

/// The chain the boot ROM would pick: B once A0 has been erased.
fn rom_chain(mem: &MemoryDevice) -> u32 {
  let start = (BCT_LBA * 512) as usize;
  let data = mem.snapshot().unwrap();
  if data[start..start + SLOT as usize].iter().all(|b| *b == 0xff) {
    1
  } else {
    0
  }
}

#[derive(Default)]
struct Board {
  resets: Vec<u32>,
}

impl PlatformControl for Board {
  fn boot_chain_is_failed(&self, _chain: u32) -> bool {
    false
  }

  fn validate_active_boot_chain(&mut self) -> bootchain::Result<()> {
    Ok(())
  }

  fn clear_update_br_bct_flag(&mut self) -> bootchain::Result<()> {
    Ok(())
  }

  fn reset_cold(&mut self, chain: u32) {
    self.resets.push(chain);
  }
}

fn context(mem: &Arc<MemoryDevice>, current: u32) -> FwContext {
  let info = PlatformInfo {
    active_boot_chain: current,
    br_bct_update_flag: false,
  };
  let mut ctx = FwContext::init(config(), info).unwrap();
  let dev: DeviceRef = mem.clone();
  ctx.add_device(&dev).unwrap();
  ctx
}

/// One boot on `current`: publish the chain and run the update state machine.
fn boot(mem: &Arc<MemoryDevice>, store: MemoryVariableStore, current: u32) -> (BootAction, MemoryVariableStore) {
  let ctx = context(mem, current);
  let switch = ctx.br_bct_updater(512).unwrap();
  let mut updater = BootChainUpdater::new(store, switch, Board::default(), *ctx.platform(), ctx.config());
  updater.initialize().unwrap();

  let action = updater.execute_update();
  let (mut store, _, board) = updater.into_parts();
  if let BootAction::Reset { chain, .. } = action {
    assert_eq!(board.resets, vec![chain]);
  }
  store.power_cycle();
  (action, store)
}

fn request(mem: &Arc<MemoryDevice>, store: MemoryVariableStore, current: u32, next: u32) -> MemoryVariableStore {
  let ctx = context(mem, current);
  let switch = ctx.br_bct_updater(512).unwrap();
  let mut updater = BootChainUpdater::new(store, switch, Board::default(), *ctx.platform(), ctx.config());
  updater.request_update(next).unwrap();
  updater.into_parts().0
}

mod update_tests {
  use super::*;

  #[test]
  fn switch_to_chain_b_succeeds() {
    init_tracing();
    let mem = boot_device();
    assert_eq!(rom_chain(&mem), 0);

    let store = request(&mem, MemoryVariableStore::new(), 0, 1);
    let (action, store) = boot(&mem, store, 0);
    assert_eq!(
      action,
      BootAction::Reset {
        chain: 1,
        status: StatusCode::InProgress
      }
    );
    assert_eq!(store.get(BootChainVariable::Previous).unwrap(), Some(0));
    assert_eq!(store.get(BootChainVariable::Status).unwrap(), Some(1));
    assert_eq!(store.get(BootChainVariable::ResetCount).unwrap(), Some(1));
    assert_eq!(rom_chain(&mem), 1);

    let (action, store) = boot(&mem, store, rom_chain(&mem));
    assert_eq!(
      action,
      BootAction::BootOs {
        chain: 1,
        status: Some(StatusCode::Success)
      }
    );
    assert_eq!(store.get(BootChainVariable::Status).unwrap(), Some(0));
    for variable in [
      BootChainVariable::Next,
      BootChainVariable::Previous,
      BootChainVariable::ResetCount,
    ] {
      assert!(!store.contains(variable));
    }

    let (action, _) = boot(&mem, store, 1);
    assert_eq!(action, BootAction::BootOs { chain: 1, status: None });
  }

  #[test]
  fn silent_switch_failure_boots_previous_chain() {
    init_tracing();
    let mem = boot_device();
    let store = request(&mem, MemoryVariableStore::new(), 0, 1);
    let (_, store) = boot(&mem, store, 0);

    // the boot ROM ignored the erased slot and came back up on chain 0
    let (action, store) = boot(&mem, store, 0);
    assert_eq!(
      action,
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::BootChainFailed)
      }
    );
    assert_eq!(store.get(BootChainVariable::Status).unwrap(), Some(12));
    assert!(!store.contains(BootChainVariable::Next));
    assert!(!store.contains(BootChainVariable::Previous));
    assert!(!store.contains(BootChainVariable::ResetCount));
  }

  #[test]
  fn failed_update_restores_previous_chain_once() {
    init_tracing();
    let mem = boot_device();
    let store = request(&mem, MemoryVariableStore::new(), 0, 1);
    let (_, mut store) = boot(&mem, store, 0);
    assert_eq!(rom_chain(&mem), 1);

    // the new chain came up but recorded a failure before finishing
    store.set(BootChainVariable::Status, StatusCode::BootChainFailed.value()).unwrap();
    let (action, store) = boot(&mem, store, 1);
    assert_eq!(
      action,
      BootAction::Reset {
        chain: 0,
        status: StatusCode::BootChainFailed
      }
    );
    assert_eq!(rom_chain(&mem), 0);

    let (action, _) = boot(&mem, store, 0);
    assert_eq!(action, BootAction::BootOs { chain: 0, status: None });
  }

  #[test]
  fn same_chain_request_is_a_no_op() {
    init_tracing();
    let mem = boot_device();
    let store = request(&mem, MemoryVariableStore::new(), 0, 0);
    let writes = mem.write_count().unwrap();

    let (action, store) = boot(&mem, store, 0);
    assert_eq!(
      action,
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::NoOperationRequired)
      }
    );
    assert_eq!(mem.write_count().unwrap(), writes);
    assert!(!store.contains(BootChainVariable::Previous));
    assert!(!store.contains(BootChainVariable::ResetCount));
    assert!(!store.contains(BootChainVariable::Next));
  }

  #[test]
  fn exhausted_resets_are_terminal() {
    init_tracing();
    let mem = boot_device();
    let mut store = request(&mem, MemoryVariableStore::new(), 0, 1);
    store.set(BootChainVariable::ResetCount, 3).unwrap();

    let (action, store) = boot(&mem, store, 0);
    assert_eq!(
      action,
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::MaxResetCount)
      }
    );
    assert_eq!(rom_chain(&mem), 0);
    assert!(!store.contains(BootChainVariable::ResetCount));
  }

  #[test]
  fn bad_next_chain() {
    init_tracing();
    let mem = boot_device();
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Next, 4).unwrap();

    let (action, _) = boot(&mem, store, 0);
    assert_eq!(
      action,
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::BadBootChainNext)
      }
    );
  }

  #[test]
  fn cancel_before_first_reboot() {
    init_tracing();
    let mem = boot_device();
    let store = request(&mem, MemoryVariableStore::new(), 0, 1);

    let ctx = context(&mem, 0);
    let mut updater = BootChainUpdater::new(
      store,
      ctx.br_bct_updater(512).unwrap(),
      Board::default(),
      *ctx.platform(),
      ctx.config(),
    );
    assert!(updater.check_and_cancel_update());
    assert_eq!(updater.status().unwrap(), Some(StatusCode::CanceledForConflict));

    let (action, _) = boot(&mem, updater.into_parts().0, 0);
    assert_eq!(action, BootAction::BootOs { chain: 0, status: None });
    assert_eq!(rom_chain(&mem), 0);
  }
}

mod partition_tests {
  use super::*;
  use bootchain::{Error, ImageFlags, UPDATE_INACTIVE_PARTITIONS};

  #[test]
  fn gpt_scan_registers_recognized_partitions() {
    init_tracing();
    let mem = boot_device();
    let ctx = context(&mem, 0);
    assert_eq!(ctx.registry().count(), 5);
    assert!(ctx.registry().find("kernel").is_none());
    assert!(ctx.images().is_ready("mb1"));
    assert!(ctx.images().find("BCT").is_none());
  }

  #[test]
  fn corrupted_gpt_registers_nothing() {
    init_tracing();
    let mem = boot_device();
    let gpt = BackupGpt::build(DEVICE_BYTES as u64, &layout()).unwrap();
    mem.write(gpt.table_offset() + 130, &[0x42]).unwrap();

    let mut ctx = FwContext::init(config(), PlatformInfo::default()).unwrap();
    let dev: DeviceRef = mem;
    assert!(matches!(ctx.add_device(&dev), Err(Error::Gpt(_))));
    assert!(ctx.registry().is_empty());
  }

  #[test]
  fn chain_b_active_selection() {
    init_tracing();
    let mem = boot_device();
    let mut ctx = context(&mem, 1);

    ctx.write_image("mb1", 0, b"for chain a", ImageFlags::empty()).unwrap();
    let snapshot = mem.snapshot().unwrap();
    assert_eq!(&snapshot[40 * 512..40 * 512 + 11], b"for chain a");

    let mut buf = [0u8; 11];
    ctx.read_image("mb1", 0, &mut buf, ImageFlags::empty()).unwrap();
    assert_eq!(buf, [0u8; 11]);
    ctx.read_image("mb1", 0, &mut buf, ImageFlags::READ_INACTIVE_IMAGE).unwrap();
    assert_eq!(&buf, b"for chain a");

    assert!(matches!(
      ctx.write_image("mb1", 0, b"x", ImageFlags::FORCE_PARTITION_B),
      Err(Error::WriteProtected(_))
    ));
  }

  #[test]
  fn image_bounds_hold_at_u64_max() {
    init_tracing();
    let mem = boot_device();
    let mut ctx = context(&mem, 0);
    let mut buf = [0u8; 1];

    assert!(matches!(
      ctx.read_image("mb1", u64::MAX, &mut buf, ImageFlags::empty()),
      Err(Error::InvalidParameter(_))
    ));
    assert!(matches!(
      ctx.write_image("mb1", 8 * 512, b"x", ImageFlags::empty()),
      Err(Error::InvalidParameter(_))
    ));
    ctx.write_image("mb1", 8 * 512 - 1, b"x", ImageFlags::empty()).unwrap();
  }

  #[test]
  fn inactive_layout_update_moves_writes() {
    init_tracing();
    let mem = boot_device();
    let mut ctx = context(&mem, 0);
    let dev: DeviceRef = mem.clone();
    ctx.enable_inactive_partition_updates(dev).unwrap();

    let mut entries = layout();
    entries[4] = GptEntry::new("mb2_b", 300, 331);
    let update = BackupGpt::build(DEVICE_BYTES as u64, &entries)
      .unwrap()
      .to_update_buffer();
    ctx
      .write_image(UPDATE_INACTIVE_PARTITIONS, 0, &update, ImageFlags::empty())
      .unwrap();

    let attrs = ctx.images().attributes("mb2").unwrap();
    assert_eq!(attrs.read_bytes, 16 * 512);
    assert_eq!(attrs.write_bytes, 32 * 512);

    ctx.write_image("mb2", 20 * 512, b"moved", ImageFlags::empty()).unwrap();
    let snapshot = mem.snapshot().unwrap();
    assert_eq!(&snapshot[320 * 512..320 * 512 + 5], b"moved");
  }
}
