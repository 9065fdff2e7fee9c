//! Core shared infrastructure: configuration, errors, path utilities.

pub mod config;
pub mod errors;
pub mod paths;
