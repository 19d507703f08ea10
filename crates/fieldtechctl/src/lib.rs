//! fieldtechctl library - exposes command implementations for tests

pub mod commands;
pub mod target;
