use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::EngineError;
use crate::model::{format_address, SinkPath};

/// Placeholder printed when the key passed to a sink does not resolve.
pub const UNKNOWN_KEY: &str = "*unknown*";

/// Keys proven to reach each sink function, keyed by sink name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareResult {
    shares: BTreeMap<String, BTreeSet<String>>,
}

impl ShareResult {
    pub fn insert(&mut self, sink: &str, key: &str) -> bool {
        self.shares.entry(sink.to_string()).or_default().insert(key.to_string())
    }

    pub fn keys_for(&self, sink: &str) -> Option<&BTreeSet<String>> {
        self.shares.get(sink)
    }

    /// Every (sink, key) pair, sorted by sink then key.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.shares
            .iter()
            .flat_map(|(sink, keys)| keys.iter().map(move |k| (sink.as_str(), k.as_str())))
    }

    pub fn len(&self) -> usize {
        self.shares.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key to sink call sites (`"<binary> <sink> <address>"`), persisted across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeywordMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl KeywordMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a prior snapshot; a missing or blank file is an empty map.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let body = fs::read_to_string(path)?;
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let mut normalized = self.clone();
        normalized.normalize();
        let json = serde_json::to_string_pretty(&normalized)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn add_call_site(&mut self, key: &str, call_site: String) {
        let sites = self.entries.entry(key.to_string()).or_default();
        if !sites.contains(&call_site) {
            sites.push(call_site);
        }
    }

    /// Sort and de-duplicate every entry's call-site list.
    pub fn normalize(&mut self) {
        for sites in self.entries.values_mut() {
            sites.sort();
            sites.dedup();
        }
    }

    /// Apply this run's entries on top of `prior`.
    ///
    /// On a shared key this run's list replaces the prior one.
    pub fn merge_over(mut self, prior: KeywordMap) -> KeywordMap {
        let mut merged = prior;
        merged.entries.append(&mut self.entries);
        merged.normalize();
        merged
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One report line for a sink path.
///
/// Ordinary calls render as `>> <addr> -> <callee>`; the path's unsafe digest
/// call renders with `>>` in place of `->`, inserted before the step whose
/// frame made it.
pub fn render_path(path: &SinkPath) -> String {
    let mut line = format!(
        "[Param \"{}\"({}), Referenced at {} : {}]",
        path.key,
        format_address(path.occurrence),
        path.origin,
        format_address(path.reference)
    );
    let mut digest_rendered = false;
    for step in &path.steps {
        if !digest_rendered {
            if let Some(digest) = &step.digest {
                digest_rendered = true;
                if digest.address == step.address {
                    line.push_str(&format!(
                        " >> {} >> {}",
                        format_address(step.address),
                        step.callee_name
                    ));
                    continue;
                }
                line.push_str(&format!(
                    " >> {} >> {}",
                    format_address(digest.address),
                    digest.callee
                ));
            }
        }
        line.push_str(&format!(" >> {} -> {}", format_address(step.address), step.callee_name));
    }
    line.push(' ');
    line.push_str(path.extracted_key.as_deref().unwrap_or(UNKNOWN_KEY));
    line
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub seed_count: usize,
    pub referenced: usize,
    pub reachable: usize,
    pub discovered: Vec<String>,
    pub shares: ShareResult,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Time Elapsed: {:.3}", self.elapsed.as_secs_f64())?;
        writeln!(f, "{} of {} parameters are referenced", self.referenced, self.seed_count)?;
        writeln!(
            f,
            "{} of {} parameters have way to sink function",
            self.reachable, self.seed_count
        )?;
        writeln!(f, "Found {} new params heuristically:", self.discovered.len())?;
        writeln!(f, "{}", self.discovered.join(", "))?;
        writeln!(f, "Shares:")?;
        for (sink, key) in self.shares.entries() {
            writeln!(f, "{sink} {key}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DigestSite, PathStep};

    fn step(address: u64, callee: &str, digest: Option<DigestSite>) -> PathStep {
        PathStep { address, callee: address + 0x1000, callee_name: callee.into(), digest }
    }

    #[test]
    fn digest_call_is_rendered_before_the_step_that_carried_it() {
        let strcpy = DigestSite { address: 0x108, callee: "strcpy".into() };
        let path = SinkPath {
            key: "lan_ip".into(),
            occurrence: 0x5000,
            reference: 0x104,
            origin: "F".into(),
            steps: vec![
                step(0x10c, "helper", Some(strcpy.clone())),
                step(0x210, "nvram_set", Some(strcpy)),
            ],
            extracted_key: None,
        };
        assert_eq!(
            render_path(&path),
            "[Param \"lan_ip\"(0x5000), Referenced at F : 0x104] >> 0x108 >> strcpy \
             >> 0x10c -> helper >> 0x210 -> nvram_set *unknown*"
        );
    }

    #[test]
    fn summary_lists_shares_sorted() {
        let mut shares = ShareResult::default();
        shares.insert("setenv", "b");
        shares.insert("nvram_set", "z");
        shares.insert("nvram_set", "a");
        let summary = RunSummary {
            elapsed: Duration::from_millis(1500),
            seed_count: 3,
            referenced: 2,
            reachable: 1,
            discovered: vec!["x_key".into(), "y_key".into()],
            shares,
        };
        let text = summary.to_string();
        assert!(text.starts_with("Time Elapsed: 1.500\n"));
        assert!(text.contains("2 of 3 parameters are referenced\n"));
        assert!(text.contains("x_key, y_key\n"));
        assert!(text.ends_with("Shares:\nnvram_set a\nnvram_set z\nsetenv b\n"));
    }
}
