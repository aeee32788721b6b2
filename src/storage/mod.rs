//! Durable tick storage: hourly-partitioned dual-format files, the
//! partition index, and the buffer-query engine that stitches sealed files,
//! the open current-hour file, and the live in-memory tail into one ordered
//! range result.

pub mod index;
pub mod query;
pub mod sessions;
pub mod writer;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use index::{FileState, IndexEntry, PartitionIndex, PartitionStats};
pub use query::{BufferQuery, QueryOptions, TailSource, TimeRange};
pub use sessions::MarketSession;
pub use writer::{StorageStatus, TickStore};

/// The two on-disk encodings. Both carry the identical canonical record;
/// they differ only in framing and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageFormat {
    #[serde(rename = "json-lines")]
    JsonLines,
    #[serde(rename = "length-prefixed-binary")]
    Binary,
}

impl StorageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JsonLines => "json-lines",
            Self::Binary => "length-prefixed-binary",
        }
    }

    /// Directory name under the storage root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::JsonLines => "json",
            Self::Binary => "binary",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::JsonLines => "jsonl",
            Self::Binary => "bin",
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json-lines" | "json" | "jsonl" => Ok(Self::JsonLines),
            "length-prefixed-binary" | "binary" | "bin" => Ok(Self::Binary),
            other => Err(format!("unknown storage format: {other}")),
        }
    }
}
