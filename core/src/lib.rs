//! `caronte-core`: the capture-to-connection pipeline and pattern-matching engine
//! behind caronte, a network-traffic analysis service for CTF defense.
//!
//! This crate owns PCAP ingestion scheduling, TCP stream reassembly, the versioned
//! multi-pattern byte-regex engine, connection finalization, and the stream reader
//! that reconstructs a conversation from its two persisted half-streams. The HTTP/JSON
//! surface, authentication, and the document store's concrete backend live outside
//! this crate (see `caronte-server` and `store::Store`).

pub mod assembler;
pub mod config;
pub mod error;
pub mod finalizer;
pub mod model;
pub mod persister;
pub mod rescan;
pub mod reader;
pub mod rules;
pub mod scanner;
pub mod session;
pub mod store;

pub use error::{Error, Result};
