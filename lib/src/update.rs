//! Boot-chain update orchestration: the imperative shell around [crate::state].

use crate::{
  config::{FwConfig, PlatformInfo},
  state::{finish_plan, transition, Action, BootFacts, StatusCode, UpdateState},
  variables::{BootChainVariable, VariableStore},
  Callback, Error, Event, Result,
};

/// Low-level switch of the chain the platform boots next.
pub trait ChainSwitch {
  fn update_fw_chain(&mut self, chain: u32) -> Result<()>;
}

/// Platform services the orchestrator relies on.
pub trait PlatformControl {
  /// Policy says `chain` is known bad.
  fn boot_chain_is_failed(&self, chain: u32) -> bool;

  /// Mark the running chain as good.
  fn validate_active_boot_chain(&mut self) -> Result<()>;

  /// A one-shot OS boot selection is pending.
  fn boot_next_exists(&self) -> bool {
    false
  }

  fn clear_update_br_bct_flag(&mut self) -> Result<()>;

  /// Cold reset into `chain`. Real platforms do not return.
  fn reset_cold(&mut self, chain: u32);
}

/// What the boot does after [BootChainUpdater::execute_update].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
  /// Continue booting the OS on `chain`. `status` is the update outcome, if one finished.
  BootOs { chain: u32, status: Option<StatusCode> },
  /// A cold reset into `chain` was issued.
  Reset { chain: u32, status: StatusCode },
}

pub struct BootChainUpdater<V, S, P> {
  store: V,
  switch: S,
  platform: P,
  info: PlatformInfo,
  chain_count: u32,
  max_reset_count: u32,
  callback: Option<Callback>,
}

impl<V, S, P> BootChainUpdater<V, S, P>
where
  V: VariableStore,
  S: ChainSwitch,
  P: PlatformControl,
{
  pub fn new(store: V, switch: S, platform: P, info: PlatformInfo, config: &FwConfig) -> Self {
    Self {
      store,
      switch,
      platform,
      info,
      chain_count: config.boot_chain_count,
      max_reset_count: config.max_reset_count,
      callback: None,
    }
  }

  /// Set a callback for update events
  pub fn set_callback(&mut self, callback: Callback) {
    self.callback = Some(callback);
  }

  fn emit(&self, event: Event) {
    if let Some(callback) = &self.callback {
      callback(event);
    }
  }

  pub fn active_boot_chain(&self) -> u32 {
    self.info.active_boot_chain
  }

  pub fn store(&self) -> &V {
    &self.store
  }

  pub fn store_mut(&mut self) -> &mut V {
    &mut self.store
  }

  pub fn switch(&self) -> &S {
    &self.switch
  }

  pub fn platform(&self) -> &P {
    &self.platform
  }

  pub fn into_parts(self) -> (V, S, P) {
    (self.store, self.switch, self.platform)
  }

  /// Publish the running chain. Done on every boot.
  pub fn initialize(&mut self) -> Result<()> {
    let current = self.info.active_boot_chain;
    tracing::info!("boot chain current={}", current);
    self.store.set(BootChainVariable::Current, current)
  }

  /// Last recorded update status.
  pub fn status(&self) -> Result<Option<StatusCode>> {
    Ok(self.store.get(BootChainVariable::Status)?.map(|value| {
      StatusCode::from_value(value).unwrap_or_else(|| {
        tracing::warn!("unknown status value {}", value);
        StatusCode::ReadingStatus
      })
    }))
  }

  /// Ask for an update to `next` on the following boot.
  pub fn request_update(&mut self, next: u32) -> Result<()> {
    if next >= self.chain_count {
      return Err(Error::InvalidParameter(format!("no boot chain {}", next)));
    }

    if self.store.get(BootChainVariable::Status)? == Some(StatusCode::InProgress.value()) {
      tracing::error!("cannot request chain {}: update in progress", next);
      return Err(Error::UpdateInProgress);
    }

    self.store.delete(BootChainVariable::Status)?;
    self.store.set(BootChainVariable::Next, next)?;
    tracing::info!("update to boot chain {} requested", next);
    self.emit(Event::UpdateRequested(next));
    Ok(())
  }

  /// Read the persisted variables into an [UpdateState].
  pub fn load_state(&self) -> std::result::Result<UpdateState, StatusCode> {
    let next = match self.store.get(BootChainVariable::Next) {
      Ok(Some(next)) => next,
      Ok(None) => return Ok(UpdateState::NoUpdate),
      Err(e) => {
        tracing::error!("error reading next boot chain: {}", e);
        return Err(StatusCode::ReadingNext);
      }
    };

    let status = self.store.get(BootChainVariable::Status).map_err(|e| {
      tracing::error!("error reading update status: {}", e);
      StatusCode::ReadingStatus
    })?;

    match status {
      None => {
        let reset_count = self
          .store
          .get(BootChainVariable::ResetCount)
          .map_err(|e| {
            tracing::error!("error reading reset count: {}", e);
            StatusCode::ReadingResetCount
          })?
          .unwrap_or(0);
        Ok(UpdateState::Requested { next, reset_count })
      }
      Some(value) if value == StatusCode::InProgress.value() => Ok(UpdateState::InProgress { next }),
      Some(value) => Ok(UpdateState::Finished {
        status: StatusCode::from_value(value).unwrap_or(StatusCode::ReadingStatus),
      }),
    }
  }

  fn boot_facts(&self, state: &UpdateState) -> BootFacts {
    let next_chain_failed = match state {
      UpdateState::Requested { next, .. } if *next < self.chain_count => self.platform.boot_chain_is_failed(*next),
      _ => false,
    };

    BootFacts {
      current: self.info.active_boot_chain,
      chain_count: self.chain_count,
      max_reset_count: self.max_reset_count,
      br_bct_update_flag: self.info.br_bct_update_flag,
      next_chain_failed,
      boot_next_exists: self.platform.boot_next_exists(),
    }
  }

  /// Drive the update state machine for this boot.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  pub fn execute_update(&mut self) -> BootAction {
    let state = match self.load_state() {
      Ok(state) => state,
      Err(code) => return self.set_status_and_finish(code),
    };

    let facts = self.boot_facts(&state);
    let (_, action) = transition(&state, &facts);
    tracing::debug!("update state={:?} action={:?}", state, action);

    match action {
      Action::BootOs => {
        self.sync_br_bct();
        self.boot_os(None)
      }
      Action::BeginUpdate {
        next,
        previous,
        reset_count,
      } => match self.begin_update(next, previous, reset_count) {
        Ok(()) => self.reset(next, StatusCode::InProgress),
        Err(code) => self.set_status_and_finish(code),
      },
      Action::SetStatusAndFinish(code) => self.set_status_and_finish(code),
      Action::Finish(code) => self.finish_update(code),
    }
  }

  fn begin_update(&mut self, next: u32, previous: u32, reset_count: u32) -> std::result::Result<(), StatusCode> {
    tracing::info!("updating boot chain {} -> {} attempt={}", previous, next, reset_count);

    self.store.set(BootChainVariable::Previous, previous).map_err(|e| {
      tracing::error!("error setting previous boot chain: {}", e);
      StatusCode::SettingPrevious
    })?;

    self
      .store
      .set(BootChainVariable::Status, StatusCode::InProgress.value())
      .map_err(|e| {
        tracing::error!("error setting in-progress status: {}", e);
        StatusCode::SettingInProgress
      })?;
    self.emit(Event::StatusChanged(StatusCode::InProgress));

    self.store.set(BootChainVariable::ResetCount, reset_count).map_err(|e| {
      tracing::error!("error setting reset count: {}", e);
      StatusCode::SettingResetCount
    })?;

    if let Err(e) = self.platform.validate_active_boot_chain() {
      tracing::warn!("failed to validate active boot chain: {}", e);
    }

    self.switch.update_fw_chain(next).map_err(|e| {
      tracing::error!("error updating fw chain to {}: {}", next, e);
      StatusCode::UpdatingFwChain
    })?;
    self.emit(Event::ChainSwitched(next));
    Ok(())
  }

  fn set_status_and_finish(&mut self, code: StatusCode) -> BootAction {
    tracing::info!("setting update status {}", code);
    match self.store.set(BootChainVariable::Status, code.value()) {
      Ok(()) => self.emit(Event::StatusChanged(code)),
      Err(e) => tracing::error!("error setting status {}: {}", code, e),
    }

    self.finish_update(code)
  }

  /// Clean up a finished update and restore the previous chain if it failed.
  ///
  /// `Status` is left in place for the OS to read.
  pub fn finish_update(&mut self, status: StatusCode) -> BootAction {
    let current = self.info.active_boot_chain;
    let restore = if status != StatusCode::Success {
      match self.store.get(BootChainVariable::Previous) {
        Ok(Some(previous)) => finish_plan(status, previous, current),
        Ok(None) => None,
        Err(e) => {
          tracing::error!("unable to determine original boot chain: {}", e);
          None
        }
      }
    } else {
      None
    };

    for variable in [
      BootChainVariable::Previous,
      BootChainVariable::Next,
      BootChainVariable::ResetCount,
    ] {
      if let Err(e) = self.store.delete(variable) {
        tracing::error!("error deleting {}: {}", variable, e);
      }
    }

    if let Some(chain) = restore {
      tracing::info!("update status {}, restoring boot chain {}", status, chain);
      match self.switch.update_fw_chain(chain) {
        Ok(()) => {
          self.emit(Event::ChainSwitched(chain));
          return self.reset(chain, status);
        }
        Err(e) => tracing::error!("failed to restore boot chain {}: {}", chain, e),
      }
    }

    self.boot_os(Some(status))
  }

  /// Drop a pending request that would conflict with another update path.
  ///
  /// Returns whether anything was pending.
  pub fn check_and_cancel_update(&mut self) -> bool {
    let next_present = !matches!(self.store.get(BootChainVariable::Next), Ok(None));
    let status_present = !matches!(self.store.get(BootChainVariable::Status), Ok(None));

    if next_present {
      if let Err(e) = self.store.delete(BootChainVariable::Next) {
        tracing::error!("error deleting next boot chain: {}", e);
      }
    }

    if next_present || status_present {
      tracing::info!("canceling pending boot chain update");
      let code = StatusCode::CanceledForConflict;
      match self.store.set(BootChainVariable::Status, code.value()) {
        Ok(()) => self.emit(Event::StatusChanged(code)),
        Err(e) => tracing::error!("error setting canceled status: {}", e),
      }
    }

    next_present || status_present
  }

  fn sync_br_bct(&mut self) {
    if !self.info.br_bct_update_flag {
      return;
    }

    match self.store.get(BootChainVariable::AutoUpdateBrBct) {
      Ok(Some(1)) => {}
      _ => {
        tracing::debug!("BR-BCT update flag set without auto update");
        return;
      }
    }

    let current = self.info.active_boot_chain;
    tracing::info!("syncing BR-BCT to boot chain {}", current);
    match self.switch.update_fw_chain(current) {
      Ok(()) => self.emit(Event::ChainSwitched(current)),
      Err(e) => tracing::error!("BR-BCT sync to {} failed: {}", current, e),
    }

    if let Err(e) = self.platform.clear_update_br_bct_flag() {
      tracing::error!("error clearing BR-BCT update flag: {}", e);
    }
  }

  fn reset(&mut self, chain: u32, status: StatusCode) -> BootAction {
    tracing::info!("resetting into boot chain {}", chain);
    self.emit(Event::Resetting(chain));
    self.platform.reset_cold(chain);
    BootAction::Reset { chain, status }
  }

  fn boot_os(&mut self, status: Option<StatusCode>) -> BootAction {
    let chain = self.info.active_boot_chain;
    if let Err(e) = self.platform.validate_active_boot_chain() {
      tracing::warn!("failed to validate active boot chain: {}", e);
    }

    tracing::info!("booting OS on chain {}", chain);
    self.emit(Event::BootingOs(chain));
    BootAction::BootOs { chain, status }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::variables::MemoryVariableStore;
  use std::sync::{Arc, Mutex};

  #[derive(Default)]
  struct Switch {
    calls: Vec<u32>,
    fail: bool,
  }

  impl ChainSwitch for Switch {
    fn update_fw_chain(&mut self, chain: u32) -> Result<()> {
      if self.fail {
        return Err(Error::Device("switch failed".into()));
      }
      self.calls.push(chain);
      Ok(())
    }
  }

  #[derive(Default)]
  struct Platform {
    failed_chains: Vec<u32>,
    boot_next: bool,
    validated: usize,
    flag_cleared: bool,
    resets: Vec<u32>,
  }

  impl PlatformControl for Platform {
    fn boot_chain_is_failed(&self, chain: u32) -> bool {
      self.failed_chains.contains(&chain)
    }

    fn validate_active_boot_chain(&mut self) -> Result<()> {
      self.validated += 1;
      Ok(())
    }

    fn boot_next_exists(&self) -> bool {
      self.boot_next
    }

    fn clear_update_br_bct_flag(&mut self) -> Result<()> {
      self.flag_cleared = true;
      Ok(())
    }

    fn reset_cold(&mut self, chain: u32) {
      self.resets.push(chain);
    }
  }

  fn updater(current: u32, store: MemoryVariableStore) -> BootChainUpdater<MemoryVariableStore, Switch, Platform> {
    let info = PlatformInfo {
      active_boot_chain: current,
      br_bct_update_flag: false,
    };
    BootChainUpdater::new(store, Switch::default(), Platform::default(), info, &FwConfig::default())
  }

  fn get(u: &BootChainUpdater<MemoryVariableStore, Switch, Platform>, v: BootChainVariable) -> Option<u32> {
    u.store().get(v).unwrap()
  }

  #[test]
  fn nothing_pending() {
    let mut u = updater(0, MemoryVariableStore::new());
    u.initialize().unwrap();
    assert_eq!(get(&u, BootChainVariable::Current), Some(0));
    assert_eq!(u.execute_update(), BootAction::BootOs { chain: 0, status: None });
    assert!(u.switch().calls.is_empty());
    assert_eq!(u.platform().validated, 1);
  }

  #[test]
  fn begin_update_persists_then_resets() {
    let mut u = updater(0, MemoryVariableStore::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    u.set_callback(Arc::new(move |e: Event| sink.lock().unwrap().push(e)));

    u.request_update(1).unwrap();
    assert_eq!(
      u.execute_update(),
      BootAction::Reset {
        chain: 1,
        status: StatusCode::InProgress
      }
    );
    assert_eq!(get(&u, BootChainVariable::Previous), Some(0));
    assert_eq!(get(&u, BootChainVariable::Status), Some(1));
    assert_eq!(get(&u, BootChainVariable::ResetCount), Some(1));
    assert_eq!(u.switch().calls, vec![1]);
    assert_eq!(u.platform().validated, 1);
    assert_eq!(u.platform().resets, vec![1]);
    assert_eq!(
      *events.lock().unwrap(),
      vec![
        Event::UpdateRequested(1),
        Event::StatusChanged(StatusCode::InProgress),
        Event::ChainSwitched(1),
        Event::Resetting(1),
      ]
    );
  }

  #[test]
  fn status_write_failure_stops_update() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Next, 1).unwrap();
    store.fail_set(BootChainVariable::Status, true);
    let mut u = updater(0, store);

    assert_eq!(
      u.execute_update(),
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::SettingInProgress)
      }
    );
    assert!(u.switch().calls.is_empty());
    assert_eq!(get(&u, BootChainVariable::Next), None);
    assert_eq!(get(&u, BootChainVariable::Previous), None);
  }

  #[test]
  fn previous_write_failure_stops_update() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Next, 1).unwrap();
    store.fail_set(BootChainVariable::Previous, true);
    let mut u = updater(0, store);

    assert_eq!(
      u.execute_update(),
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::SettingPrevious)
      }
    );
    assert!(u.switch().calls.is_empty());
    assert!(u.platform().resets.is_empty());
    assert_eq!(u.status().unwrap(), Some(StatusCode::SettingPrevious));
    assert_eq!(get(&u, BootChainVariable::Next), None);
  }

  #[test]
  fn reset_count_write_failure_stops_update() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Next, 1).unwrap();
    store.fail_set(BootChainVariable::ResetCount, true);
    let mut u = updater(0, store);

    assert_eq!(
      u.execute_update(),
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::SettingResetCount)
      }
    );
    assert!(u.switch().calls.is_empty());
    assert!(u.platform().resets.is_empty());
    assert_eq!(u.status().unwrap(), Some(StatusCode::SettingResetCount));
    assert_eq!(get(&u, BootChainVariable::Previous), None);
    assert_eq!(get(&u, BootChainVariable::ResetCount), None);
  }

  #[test]
  fn switch_failure_records_status() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Next, 1).unwrap();
    let mut u = updater(0, store);
    u.switch.fail = true;

    assert_eq!(
      u.execute_update(),
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::UpdatingFwChain)
      }
    );
    assert_eq!(u.status().unwrap(), Some(StatusCode::UpdatingFwChain));
    assert!(u.platform().resets.is_empty());
  }

  #[test]
  fn read_failures_map_to_status() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Next, 1).unwrap();
    store.fail_get(BootChainVariable::Status, true);
    let u = updater(0, store);
    assert_eq!(u.load_state(), Err(StatusCode::ReadingStatus));

    let mut store = MemoryVariableStore::new();
    store.fail_get(BootChainVariable::Next, true);
    let u = updater(0, store);
    assert_eq!(u.load_state(), Err(StatusCode::ReadingNext));
  }

  #[test]
  fn failed_chain_policy() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Next, 1).unwrap();
    let mut u = updater(0, store);
    u.platform.failed_chains.push(1);
    assert_eq!(
      u.execute_update(),
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::BootChainIsFailed)
      }
    );
  }

  #[test]
  fn boot_next_blocks_update() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Next, 1).unwrap();
    let mut u = updater(0, store);
    u.platform.boot_next = true;
    assert_eq!(
      u.execute_update(),
      BootAction::BootOs {
        chain: 0,
        status: Some(StatusCode::BootNextExists)
      }
    );
  }

  #[test]
  fn request_rejected_while_in_progress() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Status, StatusCode::InProgress.value()).unwrap();
    let mut u = updater(0, store);
    assert!(matches!(u.request_update(1), Err(Error::UpdateInProgress)));
    assert!(matches!(u.request_update(5), Err(Error::InvalidParameter(_))));
  }

  #[test]
  fn request_clears_stale_status() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Status, StatusCode::Success.value()).unwrap();
    let mut u = updater(0, store);
    u.request_update(1).unwrap();
    assert_eq!(u.status().unwrap(), None);
    assert_eq!(u.load_state(), Ok(UpdateState::Requested { next: 1, reset_count: 0 }));
  }

  #[test]
  fn cancel() {
    let mut u = updater(0, MemoryVariableStore::new());
    assert!(!u.check_and_cancel_update());
    assert_eq!(u.status().unwrap(), None);

    u.request_update(1).unwrap();
    assert!(u.check_and_cancel_update());
    assert_eq!(get(&u, BootChainVariable::Next), None);
    assert_eq!(u.status().unwrap(), Some(StatusCode::CanceledForConflict));
  }

  #[test]
  fn br_bct_sync_when_enabled() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::AutoUpdateBrBct, 1).unwrap();
    let info = PlatformInfo {
      active_boot_chain: 1,
      br_bct_update_flag: true,
    };
    let mut u = BootChainUpdater::new(store, Switch::default(), Platform::default(), info, &FwConfig::default());
    assert_eq!(u.execute_update(), BootAction::BootOs { chain: 1, status: None });
    assert_eq!(u.switch().calls, vec![1]);
    assert!(u.platform().flag_cleared);
  }

  #[test]
  fn br_bct_sync_needs_opt_in() {
    let info = PlatformInfo {
      active_boot_chain: 1,
      br_bct_update_flag: true,
    };
    let mut u = BootChainUpdater::new(
      MemoryVariableStore::new(),
      Switch::default(),
      Platform::default(),
      info,
      &FwConfig::default(),
    );
    u.execute_update();
    assert!(u.switch().calls.is_empty());
    assert!(!u.platform().flag_cleared);
  }
}
