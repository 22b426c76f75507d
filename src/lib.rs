// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Core primitives for a distributed search-and-storage platform.
//!
//! ##### About
//!
//! This crate implements three independent subsystems that share binary
//! format discipline and failure handling, and communicate only through
//! narrow typed interfaces:
//!
//! * [`aggregation`] — a recursive, mergeable grouping-aggregation engine:
//!   documents classify into a multi-level tree of groups carrying
//!   accumulators (count, sum, min/max, average, standard deviation,
//!   HyperLogLog cardinality, KLL quantiles, xor, top-K hit lists). Shards
//!   aggregate independently; results merge pairwise.
//! * [`predicate`] — an in-memory boolean-constraint index using the
//!   interval algorithm: predicate trees are annotated with interval
//!   markers, stored in hybrid btree/vector posting lists, and replayed
//!   through posting-list iterators at match time.
//! * [`translog`] — a disk-backed, append-only, chunked and CRC-checked
//!   transaction log partitioned into domains, with a strictly ordered
//!   commit pipeline and a session-based replay protocol.
//!
//! The surrounding service wiring — RPC transports, configuration loaders,
//! CLI tooling — is deliberately out of scope; the seams are plain traits
//! (`Destination`, `AttributeSource`, `SummaryGenerator`).
//!
//! # Example
//!
//! ```
//! use grist::translog::{Domain, DomainConfig, Entry, Packet};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let domain = Domain::open("music", folder.path(), DomainConfig::default())?;
//!
//! let mut packet = Packet::new();
//! packet.add(&Entry::new(1, 0, b"operation".to_vec()))?;
//! domain.append(&packet, Box::new(|outcome| assert!(outcome.is_ok())))?;
//! domain.start_commit(None)?;
//! #
//! # Ok::<(), grist::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod aggregation;
mod coding;
mod error;
pub mod expression;
mod generation;
pub mod predicate;
pub mod sketch;
mod slice;
pub mod translog;

pub use coding::{Decode, DecodeError, Encode, EncodeError};
pub use error::{Error, Result};
pub use generation::{Generation, GenerationHandler};
pub use slice::Slice;
