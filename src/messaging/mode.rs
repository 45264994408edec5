//! Publisher/consumer mode guard.
//!
//! An instance commits to one role on first use and keeps it for its lifetime.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::{MqError, Result};

/// Role requested by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Consumer,
}

/// Role an instance has committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceMode {
    /// Neither `publish` nor `listen` called yet
    #[default]
    Unset,
    Publisher,
    Consumer,
}

impl InstanceMode {
    /// Next mode when `role` is requested, or `None` on conflict.
    pub fn transition(self, role: Role) -> Option<InstanceMode> {
        match (self, role) {
            (InstanceMode::Unset, Role::Publisher) | (InstanceMode::Publisher, Role::Publisher) => {
                Some(InstanceMode::Publisher)
            }
            (InstanceMode::Unset, Role::Consumer) | (InstanceMode::Consumer, Role::Consumer) => {
                Some(InstanceMode::Consumer)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

impl fmt::Display for InstanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceMode::Unset => f.write_str("unset"),
            InstanceMode::Publisher => f.write_str("publisher"),
            InstanceMode::Consumer => f.write_str("consumer"),
        }
    }
}

/// Thread-safe holder of the instance mode.
#[derive(Debug, Default)]
pub struct ModeGuard {
    mode: Mutex<InstanceMode>,
}

impl ModeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit to `role`, or fail with [`MqError::ModeConflict`] leaving the mode unchanged.
    pub fn enter(&self, role: Role) -> Result<()> {
        let mut mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        match mode.transition(role) {
            Some(next) => {
                if *mode != next {
                    debug!(mode = %next, "Instance mode set");
                }
                *mode = next;
                Ok(())
            }
            None => Err(MqError::ModeConflict {
                current: *mode,
                requested: role,
            }),
        }
    }

    pub fn current(&self) -> InstanceMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert_eq!(InstanceMode::Unset.transition(Role::Publisher), Some(InstanceMode::Publisher));
        assert_eq!(InstanceMode::Unset.transition(Role::Consumer), Some(InstanceMode::Consumer));
        assert_eq!(InstanceMode::Publisher.transition(Role::Publisher), Some(InstanceMode::Publisher));
        assert_eq!(InstanceMode::Publisher.transition(Role::Consumer), None);
        assert_eq!(InstanceMode::Consumer.transition(Role::Publisher), None);
    }

    #[test]
    fn test_conflict_keeps_mode() {
        let guard = ModeGuard::new();
        guard.enter(Role::Consumer).unwrap();

        let err = guard.enter(Role::Publisher).unwrap_err();
        assert!(matches!(
            err,
            MqError::ModeConflict {
                current: InstanceMode::Consumer,
                requested: Role::Publisher
            }
        ));
        assert_eq!(guard.current(), InstanceMode::Consumer);
    }
}
