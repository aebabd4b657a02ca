//! Re-export of the full core simulator API.

pub use fogsim_core::*;
