//! Core abstractions for keepsake: bundle naming, run settings, and the
//! collaborator contracts (archive writing, encryption) the engine drives.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod archive;
pub mod bundle;
pub mod encryption;
pub mod settings;
