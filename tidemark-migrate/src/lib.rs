//! Tidemark migration executables
//!
//! Each binary in `src/bin/` runs one [`plans`] entry through the shared
//! [`cli`] front end.

pub mod cli;
pub mod plans;
