pub mod history;
pub mod profile;
pub mod scan;

pub use history::*;
pub use profile::*;
pub use scan::*;
