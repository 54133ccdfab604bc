//! keytrace-core
//!
//! Static taint-reachability analysis for firmware binaries: given candidate
//! configuration keys, find call chains from the code that references each key
//! into NVRAM/environment setters, flagging unsafe copy/format calls on the way.
//!
//! Program facts (functions, instructions, xrefs, propagated register values)
//! come from an external analysis tool through [`facts::ProgramFacts`]; all
//! substantive logic lives here so frontends stay thin.

pub mod analysis;
pub mod db;
pub mod facts;
pub mod model;
pub mod profile;

/// Returns the library version as encoded at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
