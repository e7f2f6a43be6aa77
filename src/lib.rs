//! ZAP: a small array language compiled to bytecode and run on a stack VM.

pub mod dsl;
pub mod error;
pub mod settings;
