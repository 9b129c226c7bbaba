// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dropwatch runtime library: a pool of polling workers that watches a
//! listing for scarce opportunities and acquires them under a global quota.
//!
//! This library crate exposes the engine for the binary and for integration
//! testing.

pub mod classifier;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod events;
pub mod ids;
pub mod maintenance;
pub mod opportunity;
pub mod pool;
pub mod recovery;
pub mod scheduler;
pub mod worker;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use pool::{PoolHandle, RunSummary, StopReason, WorkerPool};
