//! Update decision logic, free of persistence and resets.
//!
//! An update moves through `Requested` (caller wrote `Next`), `InProgress`
//! (status persisted and the chain-switch reset issued), is verified on the
//! following boot, and ends `Finished` with a status before cleanup returns it
//! to `NoUpdate`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
  Success = 0,
  InProgress = 1,
  NoOperationRequired = 2,
  CanceledForConflict = 3,
  ReadingStatus = 4,
  MaxResetCount = 5,
  SettingResetCount = 6,
  SettingInProgress = 7,
  InProgressFailed = 8,
  BadBootChainNext = 9,
  ReadingNext = 10,
  UpdatingFwChain = 11,
  BootChainFailed = 12,
  ReadingResetCount = 13,
  BootNextExists = 14,
  ReadingPrevious = 15,
  SettingStatus = 16,
  UpdateBrBctFlagSet = 17,
  SettingPrevious = 18,
  BootChainIsFailed = 19,
}

impl StatusCode {
  const ALL: [StatusCode; 20] = [
    StatusCode::Success,
    StatusCode::InProgress,
    StatusCode::NoOperationRequired,
    StatusCode::CanceledForConflict,
    StatusCode::ReadingStatus,
    StatusCode::MaxResetCount,
    StatusCode::SettingResetCount,
    StatusCode::SettingInProgress,
    StatusCode::InProgressFailed,
    StatusCode::BadBootChainNext,
    StatusCode::ReadingNext,
    StatusCode::UpdatingFwChain,
    StatusCode::BootChainFailed,
    StatusCode::ReadingResetCount,
    StatusCode::BootNextExists,
    StatusCode::ReadingPrevious,
    StatusCode::SettingStatus,
    StatusCode::UpdateBrBctFlagSet,
    StatusCode::SettingPrevious,
    StatusCode::BootChainIsFailed,
  ];

  pub fn value(self) -> u32 {
    self as u32
  }

  pub fn from_value(value: u32) -> Option<Self> {
    Self::ALL.get(value as usize).copied()
  }

  /// Whether the status ends an update attempt unsuccessfully.
  pub fn is_failure(self) -> bool {
    !matches!(self, StatusCode::Success | StatusCode::InProgress)
  }
}

impl std::fmt::Display for StatusCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{:?}({})", self, self.value())
  }
}

/// Persisted update state as seen at the start of a boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
  NoUpdate,
  Requested { next: u32, reset_count: u32 },
  InProgress { next: u32 },
  Finished { status: StatusCode },
}

/// Platform facts the decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootFacts {
  pub current: u32,
  pub chain_count: u32,
  pub max_reset_count: u32,
  pub br_bct_update_flag: bool,
  pub next_chain_failed: bool,
  pub boot_next_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  /// Nothing pending, continue to the OS.
  BootOs,
  /// Persist the attempt, switch chains and reset.
  BeginUpdate { next: u32, previous: u32, reset_count: u32 },
  /// Record the status, then finish.
  SetStatusAndFinish(StatusCode),
  /// Status is already recorded, clean up.
  Finish(StatusCode),
}

/// Decide what this boot does with the persisted update state.
///
/// The returned state is the one left behind once the action completes.
pub fn transition(state: &UpdateState, facts: &BootFacts) -> (UpdateState, Action) {
  match *state {
    UpdateState::NoUpdate => (UpdateState::NoUpdate, Action::BootOs),
    UpdateState::Requested { next, reset_count } => {
      let rejected = if next >= facts.chain_count {
        Some(StatusCode::BadBootChainNext)
      } else if facts.boot_next_exists {
        Some(StatusCode::BootNextExists)
      } else if next == facts.current {
        Some(StatusCode::NoOperationRequired)
      } else if facts.br_bct_update_flag {
        Some(StatusCode::UpdateBrBctFlagSet)
      } else if facts.next_chain_failed {
        Some(StatusCode::BootChainIsFailed)
      } else if reset_count >= facts.max_reset_count {
        Some(StatusCode::MaxResetCount)
      } else {
        None
      };

      match rejected {
        Some(code) => (UpdateState::NoUpdate, Action::SetStatusAndFinish(code)),
        None => (
          UpdateState::InProgress { next },
          Action::BeginUpdate {
            next,
            previous: facts.current,
            reset_count: reset_count + 1,
          },
        ),
      }
    }
    UpdateState::InProgress { next } => {
      let code = if next == facts.current {
        StatusCode::Success
      } else {
        StatusCode::BootChainFailed
      };
      (UpdateState::NoUpdate, Action::SetStatusAndFinish(code))
    }
    UpdateState::Finished { status } => (UpdateState::NoUpdate, Action::Finish(status)),
  }
}

/// Chain to switch back to once an update finishes with `status`.
pub fn finish_plan(status: StatusCode, previous: u32, current: u32) -> Option<u32> {
  if status != StatusCode::Success && previous != current {
    Some(previous)
  } else {
    None
  }
}
