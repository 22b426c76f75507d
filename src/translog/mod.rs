// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Disk-backed, append-only, chunked transaction log.
//!
//! Operations are batched into [`Packet`]s, framed into CRC-checked and
//! optionally compressed chunks, and appended to per-[`Domain`] part
//! files. Visitors replay serial ranges through [`Session`]s; the
//! [`TransLogServer`] fronts many domains.

mod chunk;
mod common;
mod config;
mod domain;
mod domain_part;
pub mod encoding;
mod file_header;
mod server;
mod session;

pub use chunk::{Chunk, SerializedChunk};
pub use common::{
    CommitChunk, CommitOutcome, DoneCallback, Entry, EntryType, Packet, SerialNum, SerialNumRange,
};
pub use config::DomainConfig;
pub use domain::{Domain, DomainInfo, PartInfo};
pub use domain_part::{DomainPart, PartReader};
pub use encoding::{Compression, Crc, Encoding};
pub use file_header::FileHeader;
pub use server::TransLogServer;
pub use session::{Destination, Session};
