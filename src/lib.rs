//! otama is a content-based image similarity engine: given an image (or
//! a previously extracted feature), return the top-k most similar
//! images from a persistent corpus.
//!
//! This crate is the indexing and retrieval core: a polymorphic driver
//! that binds one feature family (dense bit-vector, sparse word-list,
//! dense float vector) to a storage backend (flat memory-mapped array,
//! sparse inverted index, or the master SQL relation itself), plus the
//! incremental pull protocol that keeps a node's local index coherent
//! with the master relation and the similarity-ranking algorithms used
//! at search time.
//!
//! Entry point: [`facade::Handle`], opened from a YAML configuration via
//! [`facade::Handle::open`]/[`facade::Handle::open_path`]. Everything
//! below `facade` is reachable for callers assembling a [`driver::Driver`]
//! directly (e.g. the `otama-cli` binary, or an embedding application
//! wiring in its own [`feature::RawExtractor`]).

#[macro_use]
mod error;

pub mod config;
pub mod driver;
pub mod facade;
pub mod feature;
pub mod id;
pub mod logging;
pub mod master;
pub mod pull;
pub mod search;
pub mod store;
mod varbyte;
pub mod variant;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::facade::{Handle, Query};
pub use crate::id::Id;
pub use crate::search::Hit;
