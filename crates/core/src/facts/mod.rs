//! Program facts: the interface to the external disassembly/analysis engine.
//!
//! The engine never decodes machine code itself. Everything it knows about the
//! binary (functions, instructions, bytes, cross-references, propagated register
//! values) arrives through [`ProgramFacts`]. Backends:
//! - [`snapshot::ProgramSnapshot`]: facts exported by an external tool as JSON.

pub mod snapshot;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Function, Instruction};

pub use snapshot::{ProgramSnapshot, SnapshotBuilder};

/// Number of argument slots the calling conventions can resolve (`0..=3`).
pub const ARGUMENT_SLOTS: usize = 4;

#[derive(Debug, Error)]
pub enum FactsError {
    #[error("failed to read program facts: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse program facts JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate instruction at {0:#x}")]
    DuplicateInstruction(u64),
    #[error("segment at {start:#x} overlaps segment ending at {previous_end:#x}")]
    OverlappingSegments { start: u64, previous_end: u64 },
    #[error("function {name} has an empty body ({entry:#x}..{end:#x})")]
    EmptyFunction { name: String, entry: u64, end: u64 },
}

/// Instruction-set architecture of the analyzed binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Arch {
    Arm,
    Mips,
    Other(String),
}

impl From<String> for Arch {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "arm" | "armv7" | "armle" | "armbe" => Arch::Arm,
            "mips" | "mipsel" | "mipsbe" | "mips32" => Arch::Mips,
            _ => Arch::Other(value),
        }
    }
}

impl From<Arch> for String {
    fn from(value: Arch) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Arm => f.write_str("ARM"),
            Arch::Mips => f.write_str("MIPS"),
            Arch::Other(name) => f.write_str(name),
        }
    }
}

impl Arch {
    pub fn calling_convention(&self) -> CallingConvention {
        match self {
            Arch::Arm => CallingConvention::Arm,
            Arch::Mips => CallingConvention::Mips,
            Arch::Other(_) => CallingConvention::Unsupported,
        }
    }

    /// Registers a call leaves undefined in the caller.
    pub fn call_clobbers(&self) -> &'static [&'static str] {
        match self {
            Arch::Arm => &["r0", "r1", "r2", "r3"],
            Arch::Mips => &["a0", "a1", "a2", "a3", "v0", "v1"],
            Arch::Other(_) => &[],
        }
    }
}

/// Argument-slot to register mapping for a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// AAPCS: `r0..r3`, read at the call itself.
    Arm,
    /// O32: `a0..a3`; a non-empty delay slot is executed before the callee sees its arguments.
    Mips,
    Unsupported,
}

/// Where to read an argument: the register, and the instruction address before which it is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentLocation {
    pub address: u64,
    pub register: String,
}

impl CallingConvention {
    pub fn argument_location<F: ProgramFacts + ?Sized>(
        &self,
        facts: &F,
        call: u64,
        slot: usize,
    ) -> Option<ArgumentLocation> {
        if slot >= ARGUMENT_SLOTS {
            return None;
        }
        match self {
            CallingConvention::Arm => {
                Some(ArgumentLocation { address: call, register: format!("r{slot}") })
            }
            CallingConvention::Mips => {
                let delay_slot_effective =
                    facts.instruction_after(call).map(|next| next.has_effect).unwrap_or(false);
                let address = if delay_slot_effective { call.saturating_add(8) } else { call };
                Some(ArgumentLocation { address, register: format!("a{slot}") })
            }
            CallingConvention::Unsupported => None,
        }
    }
}

/// Facts the reachability engine consumes from an external analysis provider.
///
/// Register resolution may be stateful: providers are free to run a one-time
/// propagation per function on first access and cache it, hence `&self` with
/// interior mutability rather than `&mut self`.
pub trait ProgramFacts {
    fn arch(&self) -> &Arch;

    /// Whether a constant-propagation facility is available at all.
    fn supports_register_values(&self) -> bool;

    /// Lowest mapped address and the end (exclusive) of the highest one.
    fn address_range(&self) -> (u64, u64);

    fn functions(&self) -> Vec<&Function>;

    fn function_at(&self, entry: u64) -> Option<&Function>;

    fn function_containing(&self, address: u64) -> Option<&Function>;

    fn instruction_at(&self, address: u64) -> Option<&Instruction>;

    /// The instruction that follows the one at `address` in address order.
    fn instruction_after(&self, address: u64) -> Option<&Instruction>;

    /// `None` when the address is not mapped.
    fn read_byte(&self, address: u64) -> Option<u8>;

    /// First match of `pattern` starting in `[start, end)`.
    fn find_bytes(&self, start: u64, end: u64, pattern: &[u8]) -> Option<u64>;

    /// Source addresses of every cross-reference targeting `address`, ascending.
    fn references_to(&self, address: u64) -> Vec<u64>;

    /// Value held by `register` just before the instruction at `address` executes.
    fn register_value(&self, address: u64, register: &str) -> Option<u64>;

    fn symbol_at(&self, address: u64) -> Option<&str>;
}
