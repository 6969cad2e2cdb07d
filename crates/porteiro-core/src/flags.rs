//! Runtime feature flags, readable and writable without a restart.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide toggles. Both default to on; turning one off is an
/// operational escape hatch, not a supported long-term mode.
pub struct FeatureFlags {
    pipeline_enabled: AtomicBool,
    delivery_enabled: AtomicBool,
}

/// Serializable view of the flags, used by the admin API and health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagsSnapshot {
    pub pipeline_enabled: bool,
    pub delivery_enabled: bool,
}

impl FeatureFlags {
    pub fn new(pipeline_enabled: bool, delivery_enabled: bool) -> Self {
        Self {
            pipeline_enabled: AtomicBool::new(pipeline_enabled),
            delivery_enabled: AtomicBool::new(delivery_enabled),
        }
    }

    pub fn pipeline_enabled(&self) -> bool {
        self.pipeline_enabled.load(Ordering::Relaxed)
    }

    pub fn delivery_enabled(&self) -> bool {
        self.delivery_enabled.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FlagsSnapshot {
        FlagsSnapshot {
            pipeline_enabled: self.pipeline_enabled(),
            delivery_enabled: self.delivery_enabled(),
        }
    }

    pub fn apply(&self, snapshot: FlagsSnapshot) {
        self.pipeline_enabled
            .store(snapshot.pipeline_enabled, Ordering::Relaxed);
        self.delivery_enabled
            .store(snapshot.delivery_enabled, Ordering::Relaxed);
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_enabled() {
        let flags = FeatureFlags::default();
        assert!(flags.pipeline_enabled());
        assert!(flags.delivery_enabled());
    }

    #[test]
    fn apply_round_trips_through_snapshot() {
        let flags = FeatureFlags::default();
        flags.apply(FlagsSnapshot {
            pipeline_enabled: false,
            delivery_enabled: true,
        });
        assert!(!flags.pipeline_enabled());
        assert!(flags.delivery_enabled());
        assert_eq!(
            flags.snapshot(),
            FlagsSnapshot {
                pipeline_enabled: false,
                delivery_enabled: true
            }
        );
    }
}
