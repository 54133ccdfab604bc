use serde::{Deserialize, Serialize};

/// Outcome of a scan run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    /// Decode a stored status; unknown strings read back as `Failed`.
    pub fn parse(value: &str) -> Self {
        match value {
            "succeeded" => RunStatus::Succeeded,
            "canceled" => RunStatus::Canceled,
            _ => RunStatus::Failed,
        }
    }
}

/// Record describing one scan of a binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    /// Display name of the scanned binary.
    pub binary: String,
    /// SHA-256 of the program facts snapshot the run consumed.
    pub facts_hash: Option<String>,
    pub seed_count: i64,
    pub referenced_count: i64,
    pub reachable_count: i64,
    pub discovered_count: i64,
    pub status: RunStatus,
    pub started_at: String,
    pub finished_at: String,
}

/// A key proven to reach a sink, tied to the run that found it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FindingRecord {
    pub key: String,
    pub sink: String,
    /// `"<binary> <sink> <address>"`, as written to the keyword map.
    pub call_site: String,
    /// Callee of the path's unsafe digest call, if any.
    pub digest: Option<String>,
}
