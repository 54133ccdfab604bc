use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::facts::{Arch, FactsError, ProgramFacts};
use crate::model::{Flow, Function, Instruction};

/// On-disk shape of a program facts export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub arch: Arch,
    /// Set to false by exporters that could not run constant propagation.
    #[serde(default = "default_true")]
    pub register_propagation: bool,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub instructions: Vec<SnapshotInstruction>,
    #[serde(default)]
    pub segments: Vec<SnapshotSegment>,
    #[serde(default)]
    pub references: Vec<SnapshotReference>,
    #[serde(default)]
    pub symbols: Vec<SnapshotSymbol>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInstruction {
    pub address: u64,
    pub size: u32,
    #[serde(default)]
    pub flow: Flow,
    #[serde(default = "default_true")]
    pub has_effect: bool,
    /// Register writes performed by this instruction; `null` clobbers the register.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub writes: BTreeMap<String, Option<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSegment {
    pub start: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotReference {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSymbol {
    pub address: u64,
    pub name: String,
}

/// Known register values before each instruction of one function.
type RegisterTable = HashMap<u64, HashMap<String, u64>>;

/// Program facts loaded from an exported snapshot.
///
/// Register values are derived lazily: the first query inside a function walks
/// its instructions in address order, applying each instruction's writes and
/// the architecture's call clobbers, and caches the per-instruction state.
/// Branch merges are not modelled; exporters that need them should emit the
/// merged values as explicit writes.
pub struct ProgramSnapshot {
    arch: Arch,
    register_propagation: bool,
    functions: BTreeMap<u64, Function>,
    instructions: BTreeMap<u64, Instruction>,
    writes: HashMap<u64, Vec<(String, Option<u64>)>>,
    segments: BTreeMap<u64, Vec<u8>>,
    references: BTreeMap<u64, Vec<u64>>,
    symbols: BTreeMap<u64, String>,
    propagated: RefCell<HashMap<u64, Rc<RegisterTable>>>,
}

impl ProgramSnapshot {
    pub fn load(path: &Path) -> Result<Self, FactsError> {
        let body = fs::read_to_string(path)?;
        Self::from_json_str(&body)
    }

    pub fn from_json_str(body: &str) -> Result<Self, FactsError> {
        let file: SnapshotFile = serde_json::from_str(body)?;
        Self::from_file(file)
    }

    pub fn from_file(file: SnapshotFile) -> Result<Self, FactsError> {
        let mut functions = BTreeMap::new();
        for func in file.functions {
            if func.end <= func.entry {
                return Err(FactsError::EmptyFunction {
                    name: func.name,
                    entry: func.entry,
                    end: func.end,
                });
            }
            functions.insert(func.entry, func);
        }

        let mut instructions = BTreeMap::new();
        let mut writes = HashMap::new();
        for insn in file.instructions {
            if instructions.contains_key(&insn.address) {
                return Err(FactsError::DuplicateInstruction(insn.address));
            }
            if !insn.writes.is_empty() {
                writes.insert(insn.address, insn.writes.into_iter().collect::<Vec<_>>());
            }
            instructions.insert(
                insn.address,
                Instruction {
                    address: insn.address,
                    size: insn.size,
                    flow: insn.flow,
                    has_effect: insn.has_effect,
                },
            );
        }

        let mut segments: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        for seg in file.segments {
            segments.insert(seg.start, seg.bytes);
        }
        let mut previous_end: Option<u64> = None;
        for (start, bytes) in &segments {
            if let Some(prev) = previous_end {
                if *start < prev {
                    return Err(FactsError::OverlappingSegments {
                        start: *start,
                        previous_end: prev,
                    });
                }
            }
            previous_end = Some(start.saturating_add(bytes.len() as u64));
        }

        let mut references: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for xref in file.references {
            references.entry(xref.to).or_default().push(xref.from);
        }
        for froms in references.values_mut() {
            froms.sort_unstable();
            froms.dedup();
        }

        let symbols = file.symbols.into_iter().map(|s| (s.address, s.name)).collect();

        Ok(Self {
            arch: file.arch,
            register_propagation: file.register_propagation,
            functions,
            instructions,
            writes,
            segments,
            references,
            symbols,
            propagated: RefCell::new(HashMap::new()),
        })
    }

    fn register_table(&self, func: &Function) -> Rc<RegisterTable> {
        if let Some(table) = self.propagated.borrow().get(&func.entry) {
            return Rc::clone(table);
        }
        let table = Rc::new(self.propagate(func));
        self.propagated.borrow_mut().insert(func.entry, Rc::clone(&table));
        table
    }

    fn propagate(&self, func: &Function) -> RegisterTable {
        debug!(function = %func.name, "propagating register values");
        let clobbers = self.arch.call_clobbers();
        // MIPS arguments are read at the return address (call + 8), after the
        // delay slot ran, so the clobber lands only once that state is recorded.
        let delayed = matches!(self.arch, Arch::Mips);

        let mut table = RegisterTable::new();
        let mut state: HashMap<String, u64> = HashMap::new();
        let mut clobber_at: Option<u64> = None;
        for (addr, insn) in self.instructions.range(func.entry..func.end) {
            table.insert(*addr, state.clone());
            if clobber_at.is_some_and(|at| *addr >= at) {
                clobbers.iter().for_each(|r| {
                    state.remove(*r);
                });
                clobber_at = None;
            }
            if let Some(writes) = self.writes.get(addr) {
                for (reg, value) in writes {
                    match value {
                        Some(v) => {
                            state.insert(reg.clone(), *v);
                        }
                        None => {
                            state.remove(reg);
                        }
                    }
                }
            }
            if insn.is_call() {
                if delayed {
                    clobber_at = Some(addr.saturating_add(8));
                } else {
                    clobbers.iter().for_each(|r| {
                        state.remove(*r);
                    });
                }
            }
        }
        table
    }
}

impl ProgramFacts for ProgramSnapshot {
    fn arch(&self) -> &Arch {
        &self.arch
    }

    fn supports_register_values(&self) -> bool {
        self.register_propagation
    }

    fn address_range(&self) -> (u64, u64) {
        let seg_min = self.segments.keys().next().copied();
        let seg_max =
            self.segments.iter().next_back().map(|(s, b)| s.saturating_add(b.len() as u64));
        let insn_min = self.instructions.keys().next().copied();
        let insn_max = self.instructions.values().next_back().map(Instruction::next_address);
        let min = [seg_min, insn_min].into_iter().flatten().min().unwrap_or(0);
        let max = [seg_max, insn_max].into_iter().flatten().max().unwrap_or(0);
        (min, max)
    }

    fn functions(&self) -> Vec<&Function> {
        self.functions.values().collect()
    }

    fn function_at(&self, entry: u64) -> Option<&Function> {
        self.functions.get(&entry)
    }

    fn function_containing(&self, address: u64) -> Option<&Function> {
        self.functions
            .range(..=address)
            .next_back()
            .map(|(_, f)| f)
            .filter(|f| f.contains(address))
    }

    fn instruction_at(&self, address: u64) -> Option<&Instruction> {
        self.instructions.get(&address)
    }

    fn instruction_after(&self, address: u64) -> Option<&Instruction> {
        self.instructions.range(address.saturating_add(1)..).next().map(|(_, i)| i)
    }

    fn read_byte(&self, address: u64) -> Option<u8> {
        let (start, bytes) = self.segments.range(..=address).next_back()?;
        let offset = usize::try_from(address - start).ok()?;
        bytes.get(offset).copied()
    }

    fn find_bytes(&self, start: u64, end: u64, pattern: &[u8]) -> Option<u64> {
        if pattern.is_empty() || start >= end {
            return None;
        }
        let first_segment = self
            .segments
            .range(..=start)
            .next_back()
            .map(|(s, _)| *s)
            .unwrap_or(start);
        for (seg_start, bytes) in self.segments.range(first_segment..end) {
            let skip = usize::try_from(start.saturating_sub(*seg_start)).ok()?;
            if skip >= bytes.len() {
                continue;
            }
            let hit = bytes[skip..]
                .windows(pattern.len())
                .position(|w| w == pattern)
                .map(|pos| seg_start.saturating_add((skip + pos) as u64));
            match hit {
                Some(addr) if addr < end => return Some(addr),
                Some(_) => return None,
                None => continue,
            }
        }
        None
    }

    fn references_to(&self, address: u64) -> Vec<u64> {
        self.references.get(&address).cloned().unwrap_or_default()
    }

    fn register_value(&self, address: u64, register: &str) -> Option<u64> {
        if !self.register_propagation {
            return None;
        }
        let func = self.function_containing(address)?;
        let table = self.register_table(func);
        table.get(&address)?.get(register).copied()
    }

    fn symbol_at(&self, address: u64) -> Option<&str> {
        self.symbols
            .get(&address)
            .map(String::as_str)
            .or_else(|| self.functions.get(&address).map(|f| f.name.as_str()))
    }
}

/// Fluent construction of snapshots for tooling and tests.
pub struct SnapshotBuilder {
    file: SnapshotFile,
}

impl SnapshotBuilder {
    pub fn new(arch: Arch) -> Self {
        Self {
            file: SnapshotFile {
                arch,
                register_propagation: true,
                functions: Vec::new(),
                instructions: Vec::new(),
                segments: Vec::new(),
                references: Vec::new(),
                symbols: Vec::new(),
            },
        }
    }

    pub fn without_register_propagation(mut self) -> Self {
        self.file.register_propagation = false;
        self
    }

    pub fn function(self, name: &str, entry: u64, end: u64) -> Self {
        self.declare(Function::new(name, entry, end))
    }

    pub fn declare(mut self, function: Function) -> Self {
        self.file.functions.push(function);
        self
    }

    pub fn instruction(mut self, insn: Instruction) -> Self {
        self.file.instructions.push(SnapshotInstruction {
            address: insn.address,
            size: insn.size,
            flow: insn.flow,
            has_effect: insn.has_effect,
            writes: BTreeMap::new(),
        });
        self
    }

    /// Record that the instruction at `address` loads `value` into `register`.
    ///
    /// The instruction must already have been added.
    pub fn set(mut self, address: u64, register: &str, value: u64) -> Self {
        if let Some(insn) = self.file.instructions.iter_mut().find(|i| i.address == address) {
            insn.writes.insert(register.to_string(), Some(value));
        }
        self
    }

    pub fn clobber(mut self, address: u64, register: &str) -> Self {
        if let Some(insn) = self.file.instructions.iter_mut().find(|i| i.address == address) {
            insn.writes.insert(register.to_string(), None);
        }
        self
    }

    pub fn bytes(mut self, start: u64, bytes: Vec<u8>) -> Self {
        self.file.segments.push(SnapshotSegment { start, bytes });
        self
    }

    /// Add a NUL-terminated string segment.
    pub fn string(self, start: u64, value: &str) -> Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.bytes(start, bytes)
    }

    pub fn reference(mut self, from: u64, to: u64) -> Self {
        self.file.references.push(SnapshotReference { from, to });
        self
    }

    pub fn symbol(mut self, address: u64, name: &str) -> Self {
        self.file.symbols.push(SnapshotSymbol { address, name: name.to_string() });
        self
    }

    pub fn into_file(self) -> SnapshotFile {
        self.file
    }

    pub fn build(self) -> Result<ProgramSnapshot, FactsError> {
        ProgramSnapshot::from_file(self.file)
    }
}
