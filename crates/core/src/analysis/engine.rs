use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::analysis::{
    render_path, CallGraph, CancelToken, EngineError, KeywordMap, ParameterDiscoverer, RunSummary,
    SafeSet, SafetyChecker, SearchOrigin, ShareResult, SinkSearch,
};
use crate::facts::{CallingConvention, ProgramFacts};
use crate::model::{format_address, Reference, SinkPath};
use crate::profile::AnalysisProfile;

/// Everything a run accumulates. Constructed fresh per engine.
#[derive(Debug, Default)]
pub struct AnalyzerState {
    pub call_graph: CallGraph,
    pub safe: SafeSet,
    pub shares: ShareResult,
    pub keyword_map: KeywordMap,
    /// Functions already mined for new keys.
    pub visited_done: HashSet<u64>,
    /// Heuristically discovered keys and the functions they were found in.
    pub discovered: BTreeMap<String, BTreeSet<u64>>,
    /// Seed keys with at least one code reference.
    pub referenced: BTreeSet<String>,
    pub seeds: BTreeSet<String>,
    pub paths: Vec<SinkPath>,
}

/// Search engine over one binary's program facts.
pub struct Engine<'f, F: ProgramFacts + ?Sized> {
    facts: &'f F,
    profile: AnalysisProfile,
    binary_name: String,
    cancel: CancelToken,
    state: AnalyzerState,
}

impl<'f, F: ProgramFacts + ?Sized> Engine<'f, F> {
    /// Fails when the provider cannot resolve register values at all.
    pub fn new(
        facts: &'f F,
        profile: AnalysisProfile,
        binary_name: impl Into<String>,
    ) -> Result<Self, EngineError> {
        if !facts.supports_register_values() {
            return Err(EngineError::NoRegisterPropagation);
        }
        if facts.arch().calling_convention() == CallingConvention::Unsupported {
            warn!(
                arch = %facts.arch(),
                "no calling convention for this architecture; every argument check will fail"
            );
        }
        Ok(Self {
            facts,
            profile,
            binary_name: binary_name.into(),
            cancel: CancelToken::new(),
            state: AnalyzerState::default(),
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &AnalyzerState {
        &self.state
    }

    pub fn into_state(self) -> AnalyzerState {
        self.state
    }

    pub fn profile(&self) -> &AnalysisProfile {
        &self.profile
    }

    /// Search every seed key, then every discovered key within the function it came from.
    pub fn run<I, S>(&mut self, seeds: I) -> Result<RunSummary, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let started = Instant::now();
        self.state.seeds.extend(seeds.into_iter().map(Into::into));
        let seeds: Vec<String> = self.state.seeds.iter().cloned().collect();

        let mut reachable = 0;
        for (idx, key) in seeds.iter().enumerate() {
            self.cancel.check()?;
            info!("Searching for \"{key}\": {} of {}", idx + 1, seeds.len());
            if self.search_key(key, None)? {
                reachable += 1;
            }
        }

        // Follow-up searches may discover further keys; drain until nothing new appears.
        let mut searched: HashSet<(String, u64)> = HashSet::new();
        loop {
            let pending: Vec<(String, u64)> = self
                .state
                .discovered
                .iter()
                .flat_map(|(key, funcs)| funcs.iter().map(move |f| (key.clone(), *f)))
                .filter(|pair| !searched.contains(pair))
                .collect();
            if pending.is_empty() {
                break;
            }
            for (key, entry) in pending {
                self.cancel.check()?;
                searched.insert((key.clone(), entry));
                let Some(func) = self.facts.function_at(entry) else {
                    continue;
                };
                info!("Searching for discovered \"{key}\" within {}", func.name);
                self.search_key(&key, Some((func.entry, func.end)))?;
            }
        }

        let summary = RunSummary {
            elapsed: started.elapsed(),
            seed_count: seeds.len(),
            referenced: self.state.referenced.len(),
            reachable,
            discovered: self.state.discovered.keys().cloned().collect(),
            shares: self.state.shares.clone(),
        };
        info!(
            reachable = summary.reachable,
            discovered = summary.discovered.len(),
            paths = self.state.paths.len(),
            "run finished"
        );
        Ok(summary)
    }

    /// Search one key; `window` restricts references to `[start, end)`.
    ///
    /// Returns whether any reference of any occurrence reaches a sink.
    pub fn search_key(
        &mut self,
        key: &str,
        window: Option<(u64, u64)>,
    ) -> Result<bool, EngineError> {
        debug!("start searching \"{key}\"");
        let mut reaches_sink = false;
        let mut checked: HashSet<u64> = HashSet::new();
        for occurrence in self.occurrences(key)? {
            let (references, any_in_window) = self.resolve_references(occurrence, window);
            if any_in_window && window.is_none() {
                self.state.referenced.insert(key.to_string());
            }
            for reference in references {
                if !checked.insert(reference.from) {
                    continue;
                }
                reaches_sink = self.find_sink_paths(key, reference)? || reaches_sink;
            }
        }
        debug!("finish searching \"{key}\"");
        Ok(reaches_sink)
    }

    /// Data addresses holding `key` followed by a NUL byte.
    pub fn occurrences(&self, key: &str) -> Result<Vec<u64>, EngineError> {
        let pattern = key.as_bytes();
        let (mut cursor, end) = self.facts.address_range();
        let mut found = Vec::new();
        if pattern.is_empty() {
            return Ok(found);
        }
        while cursor < end {
            self.cancel.check()?;
            let Some(hit) = self.facts.find_bytes(cursor, end, pattern) else {
                break;
            };
            if self.facts.read_byte(hit.saturating_add(pattern.len() as u64)) == Some(0) {
                found.push(hit);
            }
            cursor = hit.saturating_add(1);
        }
        Ok(found)
    }

    /// Code references to an occurrence, following one level of data pointers.
    ///
    /// The flag reports whether any first-level reference fell inside `window`.
    pub fn resolve_references(
        &self,
        occurrence: u64,
        window: Option<(u64, u64)>,
    ) -> (Vec<Reference>, bool) {
        let mut references = Vec::new();
        let mut any_in_window = false;
        for from in self.facts.references_to(occurrence) {
            if window.is_some_and(|(start, end)| from < start || from >= end) {
                continue;
            }
            any_in_window = true;
            if let Some(caller) = self.facts.function_containing(from) {
                debug!(
                    "Reference From {} ({}) To {}",
                    format_address(from),
                    caller.name,
                    format_address(occurrence)
                );
                references.push(Reference {
                    from,
                    function: caller.entry,
                    occurrence,
                    indirect: false,
                });
                continue;
            }
            for from2 in self.facts.references_to(from) {
                let Some(caller) = self.facts.function_containing(from2) else {
                    debug!(
                        "Ignore {} at {}",
                        self.facts.symbol_at(from2).unwrap_or("?"),
                        format_address(from2)
                    );
                    continue;
                };
                debug!(
                    "Reference From {} ({}) To {} ({}) To {}",
                    format_address(from2),
                    caller.name,
                    format_address(from),
                    self.facts.symbol_at(from).unwrap_or("?"),
                    format_address(occurrence)
                );
                references.push(Reference {
                    from: from2,
                    function: caller.entry,
                    occurrence,
                    indirect: true,
                });
            }
        }
        (references, any_in_window)
    }

    /// Run the sink search for one reference and record what it finds.
    pub fn find_sink_paths(
        &mut self,
        key: &str,
        reference: Reference,
    ) -> Result<bool, EngineError> {
        let facts = self.facts;
        let Some(start) = facts.function_at(reference.function) else {
            return Ok(false);
        };
        self.state.call_graph.expand(facts, start.entry, &self.cancel)?;

        let checker = SafetyChecker::new(facts, &self.profile);
        let origin = SearchOrigin {
            key: key.to_string(),
            occurrence: reference.occurrence,
            reference: reference.from,
            function: start.entry,
            function_name: start.name.clone(),
        };
        let (vulnerable, hits) = {
            let mut search = SinkSearch::new(
                facts,
                &self.profile,
                &checker,
                &self.state.call_graph,
                &mut self.state.safe,
                &self.cancel,
                origin,
            );
            let vulnerable = search.run()?;
            (vulnerable, search.into_hits())
        };
        for hit in hits {
            self.record(hit);
        }

        if vulnerable && self.state.visited_done.insert(start.entry) {
            let discoverer = ParameterDiscoverer::new(facts, &self.profile.heuristic)?;
            for found in discoverer.discover(start, &self.state.seeds, &self.cancel)? {
                debug!("new param {found}");
                self.state.discovered.entry(found).or_default().insert(start.entry);
            }
        }
        Ok(vulnerable)
    }

    fn record(&mut self, hit: SinkPath) {
        let line = render_path(&hit);
        info!("{line}");
        if let (Some(key), Some(sink)) = (hit.extracted_key.as_deref(), hit.sink()) {
            self.state.shares.insert(&sink.callee_name, key);
            let call_site = format!(
                "{} {} {}",
                self.binary_name,
                sink.callee_name,
                format_address(sink.address)
            );
            self.state.keyword_map.add_call_site(key, call_site);
        }
        self.state.paths.push(hit);
    }

    /// Rendered report lines for every path found so far.
    pub fn report_lines(&self) -> Vec<String> {
        self.state.paths.iter().map(render_path).collect()
    }
}
