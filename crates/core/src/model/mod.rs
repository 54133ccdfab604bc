//! Core data model for program facts, references, and sink paths.
//!
//! Functions are identified by their entry address throughout the engine; the
//! provider owns the `Function` values and hands out borrows.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Render an address the way reports and persisted call sites expect it.
pub fn format_address(address: u64) -> String {
    format!("{address:#x}")
}

/// A function known to the program facts provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Entry point; doubles as the function's identity.
    pub entry: u64,
    /// End of the function body (exclusive).
    pub end: u64,
    /// Declared parameter count, when the provider knows the signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_count: Option<u32>,
}

impl Function {
    pub fn new(name: impl Into<String>, entry: u64, end: u64) -> Self {
        Self { name: name.into(), entry, end, parameter_count: None }
    }

    pub fn with_parameter_count(mut self, count: u32) -> Self {
        self.parameter_count = Some(count);
        self
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.entry && address < self.end
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Control-flow classification of an instruction, as far as the engine cares.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Flow {
    #[default]
    Plain,
    /// Direct call to a fixed target address.
    Call { target: u64 },
    /// Indirect call through a register.
    CallIndirect { register: String },
}

/// A single decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: u64,
    pub size: u32,
    #[serde(default)]
    pub flow: Flow,
    /// False for no-ops; a MIPS delay slot holding a no-op leaves argument registers untouched.
    #[serde(default = "default_has_effect")]
    pub has_effect: bool,
}

fn default_has_effect() -> bool {
    true
}

impl Instruction {
    pub fn plain(address: u64, size: u32) -> Self {
        Self { address, size, flow: Flow::Plain, has_effect: true }
    }

    pub fn call(address: u64, size: u32, target: u64) -> Self {
        Self { address, size, flow: Flow::Call { target }, has_effect: true }
    }

    pub fn call_indirect(address: u64, size: u32, register: impl Into<String>) -> Self {
        Self {
            address,
            size,
            flow: Flow::CallIndirect { register: register.into() },
            has_effect: true,
        }
    }

    pub fn nop(address: u64, size: u32) -> Self {
        Self { address, size, flow: Flow::Plain, has_effect: false }
    }

    pub fn is_call(&self) -> bool {
        !matches!(self.flow, Flow::Plain)
    }

    pub fn next_address(&self) -> u64 {
        self.address.saturating_add(u64::from(self.size.max(1)))
    }
}

/// A site in code that refers to an occurrence of a candidate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Address of the referencing instruction.
    pub from: u64,
    /// Entry of the function containing `from`.
    pub function: u64,
    /// The data address holding the key string.
    pub occurrence: u64,
    /// Set when the reference went through a pointer stored in data.
    pub indirect: bool,
}

/// The first memory-unsafe digest call detected along a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSite {
    pub address: u64,
    pub callee: String,
}

/// One call edge on the live DFS path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub address: u64,
    /// Entry of the called function.
    pub callee: u64,
    pub callee_name: String,
    /// Digest state once this call has been considered; `None` means no unsafe digest yet.
    pub digest: Option<DigestSite>,
}

impl PathStep {
    pub fn digest_seen(&self) -> bool {
        self.digest.is_some()
    }
}

/// A completed path from a reference site into a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkPath {
    pub key: String,
    pub occurrence: u64,
    pub reference: u64,
    pub origin: String,
    pub steps: Vec<PathStep>,
    /// Key string passed to the sink, when it resolved to a constant.
    pub extracted_key: Option<String>,
}

impl SinkPath {
    /// The sink step; paths are never empty.
    pub fn sink(&self) -> Option<&PathStep> {
        self.steps.last()
    }

    pub fn digest(&self) -> Option<&DigestSite> {
        self.steps.iter().find_map(|s| s.digest.as_ref())
    }
}
