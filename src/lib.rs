// src/lib.rs

//! Strata: per-project, stage-aware shell environments that follow their
//! definition files while the shell runs.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
pub type CancellationToken = Arc<AtomicBool>;

pub mod cli;
pub mod constants;
pub mod core;
pub mod dev_utils;
pub mod models;
pub mod reload;
pub mod script;
pub mod system;
