//! Persistent boot-chain variables and the store they live in.

use crate::{Error, Result};
use std::collections::{HashMap, HashSet};

bitflags::bitflags! {
  #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
  pub struct VariableAttributes: u32 {
    const NON_VOLATILE = 0x0000_0001;
    const BOOTSERVICE_ACCESS = 0x0000_0002;
    const RUNTIME_ACCESS = 0x0000_0004;
  }
}

/// Variables that carry update state across resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootChainVariable {
  /// Chain the platform booted on, refreshed every boot for the OS.
  Current,
  /// Chain an update was requested for.
  Next,
  /// Result of the last update attempt.
  Status,
  /// Chain that was active before the update started.
  Previous,
  /// Resets spent on the update so far.
  ResetCount,
  /// OS opt-in for boot ROM chain-select resync.
  AutoUpdateBrBct,
}

impl BootChainVariable {
  pub const ALL: [BootChainVariable; 6] = [
    BootChainVariable::Current,
    BootChainVariable::Next,
    BootChainVariable::Status,
    BootChainVariable::Previous,
    BootChainVariable::ResetCount,
    BootChainVariable::AutoUpdateBrBct,
  ];

  pub fn name(self) -> &'static str {
    match self {
      BootChainVariable::Current => "BootChainFwCurrent",
      BootChainVariable::Next => "BootChainFwNext",
      BootChainVariable::Status => "BootChainFwStatus",
      BootChainVariable::Previous => "BootChainFwPrevious",
      BootChainVariable::ResetCount => "BootChainFwResetCount",
      BootChainVariable::AutoUpdateBrBct => "AutoUpdateBrBct",
    }
  }

  pub fn attributes(self) -> VariableAttributes {
    match self {
      BootChainVariable::Current => VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS,
      BootChainVariable::Previous | BootChainVariable::ResetCount => {
        VariableAttributes::NON_VOLATILE | VariableAttributes::BOOTSERVICE_ACCESS
      }
      BootChainVariable::Next | BootChainVariable::Status | BootChainVariable::AutoUpdateBrBct => {
        VariableAttributes::NON_VOLATILE | VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS
      }
    }
  }
}

impl std::fmt::Display for BootChainVariable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.name())
  }
}

/// Key/value store for small fixed-size variables.
pub trait VariableStore {
  /// `Ok(None)` when the variable does not exist.
  fn get(&self, variable: BootChainVariable) -> Result<Option<u32>>;

  fn set(&mut self, variable: BootChainVariable, value: u32) -> Result<()>;

  /// Deleting a variable that does not exist succeeds.
  fn delete(&mut self, variable: BootChainVariable) -> Result<()>;
}

/// In-memory store that can simulate a power cycle and per-variable failures.
#[derive(Debug, Default, Clone)]
pub struct MemoryVariableStore {
  values: HashMap<BootChainVariable, (VariableAttributes, u32)>,
  fail_get: HashSet<BootChainVariable>,
  fail_set: HashSet<BootChainVariable>,
  fail_delete: HashSet<BootChainVariable>,
}

impl MemoryVariableStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Drop every variable that is not non-volatile.
  pub fn power_cycle(&mut self) {
    self
      .values
      .retain(|_, (attributes, _)| attributes.contains(VariableAttributes::NON_VOLATILE));
  }

  pub fn fail_get(&mut self, variable: BootChainVariable, fail: bool) {
    Self::toggle(&mut self.fail_get, variable, fail);
  }

  pub fn fail_set(&mut self, variable: BootChainVariable, fail: bool) {
    Self::toggle(&mut self.fail_set, variable, fail);
  }

  pub fn fail_delete(&mut self, variable: BootChainVariable, fail: bool) {
    Self::toggle(&mut self.fail_delete, variable, fail);
  }

  pub fn contains(&self, variable: BootChainVariable) -> bool {
    self.values.contains_key(&variable)
  }

  fn toggle(set: &mut HashSet<BootChainVariable>, variable: BootChainVariable, fail: bool) {
    if fail {
      set.insert(variable);
    } else {
      set.remove(&variable);
    }
  }
}

impl VariableStore for MemoryVariableStore {
  fn get(&self, variable: BootChainVariable) -> Result<Option<u32>> {
    if self.fail_get.contains(&variable) {
      return Err(Error::Variable(format!("get {} failed", variable)));
    }
    Ok(self.values.get(&variable).map(|(_, value)| *value))
  }

  fn set(&mut self, variable: BootChainVariable, value: u32) -> Result<()> {
    if self.fail_set.contains(&variable) {
      return Err(Error::Variable(format!("set {} failed", variable)));
    }
    self.values.insert(variable, (variable.attributes(), value));
    Ok(())
  }

  fn delete(&mut self, variable: BootChainVariable) -> Result<()> {
    if self.fail_delete.contains(&variable) {
      return Err(Error::Variable(format!("delete {} failed", variable)));
    }
    self.values.remove(&variable);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn set_get_delete() {
    let mut store = MemoryVariableStore::new();
    assert_eq!(store.get(BootChainVariable::Next).unwrap(), None);
    store.set(BootChainVariable::Next, 1).unwrap();
    assert_eq!(store.get(BootChainVariable::Next).unwrap(), Some(1));
    store.delete(BootChainVariable::Next).unwrap();
    store.delete(BootChainVariable::Next).unwrap();
    assert!(!store.contains(BootChainVariable::Next));
  }

  #[test]
  fn power_cycle_keeps_non_volatile() {
    let mut store = MemoryVariableStore::new();
    store.set(BootChainVariable::Current, 0).unwrap();
    store.set(BootChainVariable::Previous, 0).unwrap();
    store.power_cycle();
    assert!(!store.contains(BootChainVariable::Current));
    assert_eq!(store.get(BootChainVariable::Previous).unwrap(), Some(0));
  }

  #[test]
  fn injected_failures() {
    let mut store = MemoryVariableStore::new();
    store.fail_set(BootChainVariable::Status, true);
    assert!(matches!(store.set(BootChainVariable::Status, 1), Err(Error::Variable(_))));
    store.fail_set(BootChainVariable::Status, false);
    store.set(BootChainVariable::Status, 1).unwrap();

    store.fail_get(BootChainVariable::Status, true);
    assert!(store.get(BootChainVariable::Status).is_err());
  }

  #[test]
  fn names_are_distinct() {
    let names: HashSet<_> = BootChainVariable::ALL.iter().map(|v| v.name()).collect();
    assert_eq!(names.len(), BootChainVariable::ALL.len());
  }
}
