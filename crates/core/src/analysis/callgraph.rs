use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::analysis::{CancelToken, EngineError};
use crate::facts::ProgramFacts;
use crate::model::{Flow, Function, Instruction};

/// Resolve the function a call instruction transfers to.
///
/// Indirect calls are resolved through the propagated value of the target
/// register; anything unresolved is a dead end rather than an error.
pub fn resolve_callee<'f, F: ProgramFacts + ?Sized>(
    facts: &'f F,
    insn: &Instruction,
) -> Option<&'f Function> {
    match &insn.flow {
        Flow::Plain => None,
        Flow::Call { target } => facts.function_at(*target),
        Flow::CallIndirect { register } => facts
            .register_value(insn.address, register)
            .and_then(|target| facts.function_at(target)),
    }
}

/// Forward walk over the instructions of one function body.
pub struct InstructionWalk<'f, F: ProgramFacts + ?Sized> {
    facts: &'f F,
    next: Option<&'f Instruction>,
    end: u64,
}

impl<'f, F: ProgramFacts + ?Sized> InstructionWalk<'f, F> {
    pub fn new(facts: &'f F, func: &Function) -> Self {
        let first =
            facts.instruction_at(func.entry).or_else(|| facts.instruction_after(func.entry));
        Self { facts, next: first, end: func.end }
    }
}

impl<'f, F: ProgramFacts + ?Sized> Iterator for InstructionWalk<'f, F> {
    type Item = &'f Instruction;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.filter(|i| i.address < self.end)?;
        self.next = self.facts.instruction_after(current.address);
        Some(current)
    }
}

/// Direct call edges (call address to callee entry) per function.
///
/// Nodes are built lazily and kept for the lifetime of the run.
#[derive(Debug, Default)]
pub struct CallGraph {
    edges: HashMap<u64, BTreeMap<u64, u64>>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build nodes for every function reachable from `root` that has none yet.
    ///
    /// Returns the number of nodes added. A node is only inserted once its body
    /// has been fully scanned, so a cancelled expansion leaves no partial entry.
    pub fn expand<F: ProgramFacts + ?Sized>(
        &mut self,
        facts: &F,
        root: u64,
        cancel: &CancelToken,
    ) -> Result<usize, EngineError> {
        let mut pending = vec![root];
        let mut added = 0;
        while let Some(entry) = pending.pop() {
            if self.edges.contains_key(&entry) {
                continue;
            }
            cancel.check()?;
            let Some(func) = facts.function_at(entry) else {
                continue;
            };
            let mut calls = BTreeMap::new();
            for insn in InstructionWalk::new(facts, func) {
                if let Some(callee) = resolve_callee(facts, insn) {
                    calls.insert(insn.address, callee.entry);
                    if !self.edges.contains_key(&callee.entry) {
                        pending.push(callee.entry);
                    }
                }
            }
            debug!(function = %func.name, calls = calls.len(), "call graph node built");
            self.edges.insert(entry, calls);
            added += 1;
        }
        Ok(added)
    }

    /// Outgoing calls of `func` in ascending call-address order.
    pub fn calls(&self, func: u64) -> Option<&BTreeMap<u64, u64>> {
        self.edges.get(&func)
    }

    pub fn contains(&self, func: u64) -> bool {
        self.edges.contains_key(&func)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
