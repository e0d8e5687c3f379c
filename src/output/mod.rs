//! Result artifact output
//!
//! JSON writers for burst, sweep, and stress artifacts, plus the console
//! summary printed at the end of a stress run.

pub mod json;
pub mod summary;
