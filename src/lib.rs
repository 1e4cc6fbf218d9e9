//! quantscript: sandboxed user scripts computing one value per market-data row.
//!
//! Hexagonal architecture: the script engine and operations live in
//! [`domain`], port traits in [`ports`], concrete storage, CSV, config and
//! web implementations in [`adapters`], and the command line in [`cli`].

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod ports;
