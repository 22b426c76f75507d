// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compact probabilistic sketches used by the aggregation engine.

pub mod hyperloglog;
pub mod kll;

pub use hyperloglog::HyperLogLog;
pub use kll::KllSketch;
