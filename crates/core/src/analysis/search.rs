use std::collections::HashSet;

use crate::analysis::{CallGraph, CancelToken, EngineError, SafetyChecker};
use crate::facts::ProgramFacts;
use crate::model::{DigestSite, PathStep, SinkPath};
use crate::profile::AnalysisProfile;

/// Functions proven to have no path to any sink.
///
/// Grows monotonically for the whole run and is consulted by every later search,
/// regardless of which function that search started from.
#[derive(Debug, Default)]
pub struct SafeSet {
    functions: HashSet<u64>,
}

impl SafeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, func: u64) -> bool {
        self.functions.insert(func)
    }

    pub fn contains(&self, func: u64) -> bool {
        self.functions.contains(&func)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Where a search starts: the key occurrence, its reference, and the referencing function.
#[derive(Debug, Clone)]
pub struct SearchOrigin {
    pub key: String,
    pub occurrence: u64,
    pub reference: u64,
    pub function: u64,
    pub function_name: String,
}

/// Depth-first search from one reference site to any sink.
///
/// Two tiers keep the search bounded on cyclic graphs: functions on the live
/// path are never re-entered, and functions in the [`SafeSet`] are never
/// explored again.
pub struct SinkSearch<'a, F: ProgramFacts + ?Sized> {
    facts: &'a F,
    profile: &'a AnalysisProfile,
    checker: &'a SafetyChecker<'a, F>,
    graph: &'a CallGraph,
    safe: &'a mut SafeSet,
    cancel: &'a CancelToken,
    origin: SearchOrigin,
    path: Vec<PathStep>,
    on_path: HashSet<u64>,
    hits: Vec<SinkPath>,
}

impl<'a, F: ProgramFacts + ?Sized> SinkSearch<'a, F> {
    pub fn new(
        facts: &'a F,
        profile: &'a AnalysisProfile,
        checker: &'a SafetyChecker<'a, F>,
        graph: &'a CallGraph,
        safe: &'a mut SafeSet,
        cancel: &'a CancelToken,
        origin: SearchOrigin,
    ) -> Self {
        Self {
            facts,
            profile,
            checker,
            graph,
            safe,
            cancel,
            origin,
            path: Vec::new(),
            on_path: HashSet::new(),
            hits: Vec::new(),
        }
    }

    /// Search from the origin function, ignoring calls before the reference site.
    ///
    /// On cancellation the in-flight frames unwind without touching the safe set.
    pub fn run(&mut self) -> Result<bool, EngineError> {
        let start = self.origin.function;
        let floor = self.origin.reference;
        self.dfs(start, Some(floor))
    }

    /// Sink paths found so far, in discovery order.
    pub fn hits(&self) -> &[SinkPath] {
        &self.hits
    }

    pub fn into_hits(self) -> Vec<SinkPath> {
        self.hits
    }

    fn dfs(&mut self, func: u64, floor: Option<u64>) -> Result<bool, EngineError> {
        self.cancel.check()?;
        let facts = self.facts;
        let graph = self.graph;

        let name = facts.function_at(func).map(|f| f.name.as_str()).unwrap_or_default();
        if !self.path.is_empty() && self.profile.is_sink(name) {
            self.record_hit(name);
            return Ok(true);
        }

        let mut digest: Option<DigestSite> = self.path.last().and_then(|s| s.digest.clone());
        let mut vulnerable = false;
        if let Some(calls) = graph.calls(func) {
            for (&address, &callee) in calls {
                if floor.is_some_and(|f| address < f) {
                    continue;
                }
                let callee_name =
                    facts.function_at(callee).map(|f| f.name.as_str()).unwrap_or_default();
                if digest.is_none() && self.checker.is_unsafe_digest(address, callee_name) {
                    digest = Some(DigestSite { address, callee: callee_name.to_string() });
                }
                if callee == self.origin.function
                    || self.on_path.contains(&callee)
                    || self.safe.contains(callee)
                {
                    continue;
                }

                self.path.push(PathStep {
                    address,
                    callee,
                    callee_name: callee_name.to_string(),
                    digest: digest.clone(),
                });
                self.on_path.insert(callee);
                let result = self.dfs(callee, None);
                self.on_path.remove(&callee);
                self.path.pop();
                vulnerable = result? || vulnerable;
            }
        }

        if !vulnerable && func != self.origin.function {
            self.safe.insert(func);
        }
        Ok(vulnerable)
    }

    fn record_hit(&mut self, sink: &str) {
        let Some(last) = self.path.last() else {
            return;
        };
        let extracted_key = self.profile.sink_slots(sink).and_then(|slots| {
            self.checker
                .reader()
                .string_argument(last.address, slots.key)
                .filter(|s| !s.is_empty())
        });
        self.hits.push(SinkPath {
            key: self.origin.key.clone(),
            occurrence: self.origin.occurrence,
            reference: self.origin.reference,
            origin: self.origin.function_name.clone(),
            steps: self.path.clone(),
            extracted_key,
        });
    }
}
