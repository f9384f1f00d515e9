//! Identifier types.
//!
//! Run ids follow the on-disk layout contract: `YYYYMMDD-HHMMSS-XXXXXX`, a UTC
//! timestamp followed by six lowercase hex characters. Task ids are free-form
//! strings validated against the tracker's id regex (see [`crate::types::TASK_ID_PATTERN`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier, newtype over `String` so ids from different entities can't be
/// accidentally swapped at call sites.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Wrap an existing string as an `Id` without validation.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Generate a new run id `YYYYMMDD-HHMMSS-XXXXXX` at the given instant.
    ///
    /// The six hex characters are derived from the process id, a monotonic
    /// in-process counter, and the instant's nanosecond component, hashed through
    /// SHA-256 so collisions within the same second are effectively impossible
    /// without pulling in a random-number dependency.
    pub fn new_run_id(now: DateTime<Utc>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        let seed = format!(
            "{}-{}-{}-{}",
            std::process::id(),
            now.timestamp_nanos_opt().unwrap_or_default(),
            counter,
            now.timestamp_subsec_nanos()
        );
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        let digest = hasher.finalize();
        let hex = digest.iter().take(3).map(|b| format!("{b:02x}")).collect::<String>();
        Self(format!("{}-{hex}", now.format("%Y%m%d-%H%M%S")))
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
