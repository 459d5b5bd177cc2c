// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// How broadly a computed plan may be reused.
///
/// Ordered from least to most strict.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Determinism {
    #[default]
    Deterministic = 0,
    UserDeterministic = 1,
    SessionDeterministic = 2,
    CommandDeterministic = 3,
    Nondeterministic = 4,
}

impl Determinism {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Deterministic,
            1 => Self::UserDeterministic,
            2 => Self::SessionDeterministic,
            3 => Self::CommandDeterministic,
            _ => Self::Nondeterministic,
        }
    }
}

/// Determinism level that only ever becomes stricter.
#[derive(Debug, Default)]
pub struct DeterminismTracker {
    level: AtomicU8,
}

impl DeterminismTracker {
    pub fn get(&self) -> Determinism {
        Determinism::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Raises the level to `level` if it is stricter; returns the resulting level.
    pub fn raise(&self, level: Determinism) -> Determinism {
        let previous = self.level.fetch_max(level as u8, Ordering::AcqRel);
        Determinism::from_u8(previous.max(level as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_moves_towards_stricter() {
        let tracker = DeterminismTracker::default();
        assert_eq!(tracker.raise(Determinism::SessionDeterministic), Determinism::SessionDeterministic);
        assert_eq!(tracker.raise(Determinism::UserDeterministic), Determinism::SessionDeterministic);
        assert_eq!(tracker.get(), Determinism::SessionDeterministic);
        tracker.raise(Determinism::Nondeterministic);
        assert_eq!(tracker.get(), Determinism::Nondeterministic);
    }
}
