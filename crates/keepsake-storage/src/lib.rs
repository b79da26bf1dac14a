//! Filesystem-facing implementations: the tar+gzip bundle writer and the
//! retention engine that prunes old bundles from the data directory.

pub mod retention;
pub mod tar_writer;
