use std::collections::{BTreeSet, HashMap};

use regex::Regex;

use crate::analysis::callgraph::{resolve_callee, InstructionWalk};
use crate::analysis::{ArgumentReader, CancelToken, EngineError};
use crate::facts::ProgramFacts;
use crate::model::Function;
use crate::profile::HeuristicSettings;

/// Finds sibling configuration keys inside a function already proven vulnerable.
///
/// Call sites that repeatedly pass known keys to the same (callee, slot) pair
/// are taken as accessor calls; the strings passed to that pair at other call
/// sites become new candidate keys.
pub struct ParameterDiscoverer<'f, F: ProgramFacts + ?Sized> {
    facts: &'f F,
    reader: ArgumentReader<'f, F>,
    settings: &'f HeuristicSettings,
    identifier: Regex,
}

impl<'f, F: ProgramFacts + ?Sized> ParameterDiscoverer<'f, F> {
    pub fn new(facts: &'f F, settings: &'f HeuristicSettings) -> Result<Self, EngineError> {
        let identifier = Regex::new(&format!("[A-Za-z_]{{{}}}", settings.min_identifier_run))?;
        Ok(Self { facts, reader: ArgumentReader::new(facts), settings, identifier })
    }

    /// Strings promoted to new candidate keys, in first-seen order, excluding `known`.
    pub fn discover(
        &self,
        func: &Function,
        known: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, EngineError> {
        let counts = self.count_known_arguments(func, known, cancel)?;

        let mut promoted: Vec<String> = Vec::new();
        for insn in InstructionWalk::new(self.facts, func) {
            cancel.check()?;
            let Some(callee) = resolve_callee(self.facts, insn) else {
                continue;
            };
            if self.settings.ignore.contains(&callee.name) {
                continue;
            }
            for slot in 0..self.settings.max_slots {
                let hits = counts.get(&(callee.entry, slot)).copied().unwrap_or(0);
                if hits < self.settings.threshold {
                    continue;
                }
                let Some(value) = self.reader.string_argument(insn.address, slot) else {
                    continue;
                };
                if self.is_promotable(&value, known) && !promoted.contains(&value) {
                    promoted.push(value);
                }
            }
        }
        Ok(promoted)
    }

    /// Pass one: how often each (callee, slot) pair receives a known key.
    fn count_known_arguments(
        &self,
        func: &Function,
        known: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> Result<HashMap<(u64, usize), usize>, EngineError> {
        let mut counts = HashMap::new();
        for insn in InstructionWalk::new(self.facts, func) {
            cancel.check()?;
            let Some(callee) = resolve_callee(self.facts, insn) else {
                continue;
            };
            let slots = match callee.parameter_count {
                Some(n) if n > 0 => self.settings.max_slots.min(n as usize),
                _ => self.settings.max_slots,
            };
            for slot in 0..slots {
                let matched = self
                    .reader
                    .string_argument(insn.address, slot)
                    .is_some_and(|s| known.contains(&s));
                if matched {
                    *counts.entry((callee.entry, slot)).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }

    fn is_promotable(&self, value: &str, known: &BTreeSet<String>) -> bool {
        !value.is_empty() && self.identifier.is_match(value) && !known.contains(value)
    }
}
