//! Analysis profile: which functions are sinks, which are digests, and how their
//! arguments are judged safe.
//!
//! The built-in defaults cover the common router firmware setters (NVRAM and
//! environment) and libc copy/format primitives. Profiles can be written as
//! YAML or JSON and loaded with [`AnalysisProfile::from_path`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::facts::ARGUMENT_SLOTS;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse profile JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse profile YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("profile defines no sink functions")]
    NoSinks,
    #[error("{table} entry '{name}' uses slot {slot}; supported slots are 0..=3")]
    SlotOutOfRange { table: &'static str, name: String, slot: usize },
    #[error("heuristic {0} must be positive")]
    ZeroHeuristicParameter(&'static str),
}

/// Argument positions of a sink call (zero means the first parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkSlots {
    pub key: usize,
    /// Position of the stored value. Reported only; not used for pruning.
    pub value: usize,
}

/// How an argument of a digest call is proven safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyCheck {
    ConstantString { slot: usize },
    SafeFormat { slot: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicSettings {
    /// Minimum number of known-key hits on a (callee, slot) pair before it is trusted.
    pub threshold: usize,
    /// Argument slots inspected per call.
    pub max_slots: usize,
    /// Length of the letter/underscore run a promoted string must contain.
    pub min_identifier_run: usize,
    /// Callees whose string arguments are never promoted.
    pub ignore: BTreeSet<String>,
}

impl Default for HeuristicSettings {
    fn default() -> Self {
        Self {
            threshold: 4,
            max_slots: ARGUMENT_SLOTS,
            min_identifier_run: 4,
            ignore: names(&["strcpy", "strncpy", "strcat", "memcpy"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisProfile {
    pub sinks: BTreeMap<String, SinkSlots>,
    pub digests: BTreeSet<String>,
    /// Callee name to the slot that must hold a non-empty constant string.
    pub constant_string_checks: BTreeMap<String, usize>,
    /// Callee name to the slot holding a format string whose `%s` arguments must be constant.
    pub format_checks: BTreeMap<String, usize>,
    pub heuristic: HeuristicSettings,
}

impl Default for AnalysisProfile {
    fn default() -> Self {
        let sinks = [
            ("nvram_safe_set", 0, 1),
            ("nvram_bufset", 1, 2),
            ("setenv", 0, 1),
            ("nvram_set", 1, 2),
            ("acosNvramConfig_set", 0, 1),
            ("bcm_nvram_set", 0, 1),
            ("envram_set_value", 0, 1),
        ]
        .into_iter()
        .map(|(name, key, value)| (name.to_string(), SinkSlots { key, value }))
        .collect();

        let constant_string_checks = [
            ("system", 0),
            ("fwrite", 0),
            ("___system", 0),
            ("bstar_system", 0),
            ("popen", 0),
            ("execve", 0),
            ("twsystem", 0),
            ("strcpy", 1),
            ("strcat", 1),
            ("strncpy", 1),
            ("memcpy", 1),
        ]
        .into_iter()
        .map(|(name, slot)| (name.to_string(), slot))
        .collect();

        let format_checks = [("sprintf", 1), ("doSystemCmd", 0), ("doShell", 0)]
            .into_iter()
            .map(|(name, slot)| (name.to_string(), slot))
            .collect();

        Self {
            sinks,
            digests: names(&["strcpy", "sprintf", "memcpy", "strcat"]),
            constant_string_checks,
            format_checks,
            heuristic: HeuristicSettings::default(),
        }
    }
}

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl AnalysisProfile {
    /// Load a profile, choosing JSON for `.json` files and YAML otherwise.
    pub fn from_path(path: &Path) -> Result<Self, ProfileError> {
        let body = fs::read_to_string(path)?;
        let profile: AnalysisProfile = if path.extension().and_then(|e| e.to_str()) == Some("json")
        {
            serde_json::from_str(&body)?
        } else {
            serde_yaml::from_str(&body)?
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.sinks.is_empty() {
            return Err(ProfileError::NoSinks);
        }
        for (name, slots) in &self.sinks {
            for slot in [slots.key, slots.value] {
                check_slot("sinks", name, slot)?;
            }
        }
        for (name, slot) in &self.constant_string_checks {
            check_slot("constant_string_checks", name, *slot)?;
        }
        for (name, slot) in &self.format_checks {
            check_slot("format_checks", name, *slot)?;
        }
        if self.heuristic.threshold == 0 {
            return Err(ProfileError::ZeroHeuristicParameter("threshold"));
        }
        if self.heuristic.min_identifier_run == 0 {
            return Err(ProfileError::ZeroHeuristicParameter("min_identifier_run"));
        }
        Ok(())
    }

    pub fn is_sink(&self, name: &str) -> bool {
        self.sinks.contains_key(name)
    }

    pub fn sink_slots(&self, name: &str) -> Option<SinkSlots> {
        self.sinks.get(name).copied()
    }

    pub fn is_digest(&self, name: &str) -> bool {
        self.digests.contains(name)
    }

    /// Checks applicable to `name`, constant-string first.
    pub fn safety_checks(&self, name: &str) -> Vec<SafetyCheck> {
        let mut checks = Vec::new();
        if let Some(slot) = self.constant_string_checks.get(name) {
            checks.push(SafetyCheck::ConstantString { slot: *slot });
        }
        if let Some(slot) = self.format_checks.get(name) {
            checks.push(SafetyCheck::SafeFormat { slot: *slot });
        }
        checks
    }

    pub fn to_yaml(&self) -> Result<String, ProfileError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn check_slot(table: &'static str, name: &str, slot: usize) -> Result<(), ProfileError> {
    if slot >= ARGUMENT_SLOTS {
        return Err(ProfileError::SlotOutOfRange { table, name: name.to_string(), slot });
    }
    Ok(())
}
