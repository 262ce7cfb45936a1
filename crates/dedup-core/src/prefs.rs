//! Persisted tracker preferences.
//!
//! Two values survive restarts: whether the model changed since the last
//! clean scan, and when the last clean run finished (the backoff anchor).
//! The host owns the actual store; `InMemoryPrefs` stands in for tests and
//! fresh profiles, the CLI ships a file-backed implementation.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// The persisted values, serializable as one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefValues {
    pub model_changed: bool,
    pub last_clean_run_ms: Option<u64>,
}

impl Default for PrefValues {
    fn default() -> Self {
        // A profile that never ran a clean scan has work to do.
        Self {
            model_changed: true,
            last_clean_run_ms: None,
        }
    }
}

pub trait TrackerPrefs: Send + Sync {
    fn model_changed(&self) -> bool;

    fn set_model_changed(&self, changed: bool);

    /// When the last clean run finished; None when never.
    fn last_clean_run_ms(&self) -> Option<u64>;

    fn set_last_clean_run_ms(&self, at: Option<u64>);
}

impl<T: TrackerPrefs + Send + Sync> TrackerPrefs for std::sync::Arc<T> {
    fn model_changed(&self) -> bool {
        (**self).model_changed()
    }
    fn set_model_changed(&self, changed: bool) {
        (**self).set_model_changed(changed)
    }
    fn last_clean_run_ms(&self) -> Option<u64> {
        (**self).last_clean_run_ms()
    }
    fn set_last_clean_run_ms(&self, at: Option<u64>) {
        (**self).set_last_clean_run_ms(at)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPrefs {
    values: RwLock<PrefValues>,
}

impl InMemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: PrefValues) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }
}

impl TrackerPrefs for InMemoryPrefs {
    fn model_changed(&self) -> bool {
        self.values.read().unwrap().model_changed
    }

    fn set_model_changed(&self, changed: bool) {
        self.values.write().unwrap().model_changed = changed;
    }

    fn last_clean_run_ms(&self) -> Option<u64> {
        self.values.read().unwrap().last_clean_run_ms
    }

    fn set_last_clean_run_ms(&self, at: Option<u64>) {
        self.values.write().unwrap().last_clean_run_ms = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_prefs_want_a_scan() {
        let prefs = InMemoryPrefs::new();
        assert!(prefs.model_changed());
        assert_eq!(prefs.last_clean_run_ms(), None);
    }

    #[test]
    fn test_values_round_trip() {
        let prefs = InMemoryPrefs::new();
        prefs.set_model_changed(false);
        prefs.set_last_clean_run_ms(Some(4_000));
        assert!(!prefs.model_changed());
        assert_eq!(prefs.last_clean_run_ms(), Some(4_000));

        prefs.set_last_clean_run_ms(None);
        assert_eq!(prefs.last_clean_run_ms(), None);
    }

    #[test]
    fn test_seeded_values() {
        let prefs = InMemoryPrefs::with_values(PrefValues {
            model_changed: false,
            last_clean_run_ms: Some(99),
        });
        assert!(!prefs.model_changed());
        assert_eq!(prefs.last_clean_run_ms(), Some(99));
    }
}
