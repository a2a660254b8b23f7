//! Engine Configuration
//!
//! Controls how segments are rolled and when the compactor wakes up:
//!
//! - **segment_max_size**: a put that finds the active segment above this
//!   size seals it and rolls over to a fresh one (default: 10 MB, decimal)
//! - **min_compaction_segments**: the compactor only runs once the list
//!   holds at least this many segments, i.e. at least two sealed ones
//!   plus the active one (default: 3)
//! - **compaction_interval**: how often the compactor re-checks the
//!   segment count when nothing has signalled it (default: 1s)
//!
//! ## Usage
//!
//! ```ignore
//! use logkv_storage::{Database, DbConfig};
//!
//! // Production defaults
//! let db = Database::open("./out", DbConfig::default()).await?;
//!
//! // Small segments for tests
//! let config = DbConfig {
//!     segment_max_size: 200,
//!     ..Default::default()
//! };
//! let db = Database::open(dir.path(), config).await?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Size threshold in bytes above which the active segment is rolled.
    /// A segment exactly at the threshold is NOT rolled; the overrun
    /// write triggers rollover and lands in the new segment.
    #[serde(default = "default_segment_max_size")]
    pub segment_max_size: u64,

    /// Minimum number of segments before compaction kicks in.
    #[serde(default = "default_min_compaction_segments")]
    pub min_compaction_segments: usize,

    /// How often the compactor re-checks when idle.
    #[serde(default = "default_compaction_interval", with = "duration_secs")]
    pub compaction_interval: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            segment_max_size: default_segment_max_size(),
            min_compaction_segments: default_min_compaction_segments(),
            compaction_interval: default_compaction_interval(),
        }
    }
}

// 10 MB, decimal
fn default_segment_max_size() -> u64 {
    10_000_000
}

fn default_min_compaction_segments() -> usize {
    3
}

fn default_compaction_interval() -> Duration {
    Duration::from_secs(1)
}

/// Serde helpers for Duration as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
