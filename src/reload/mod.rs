//! # Partial Reload
//!
//! In-place patching of live script modules. A changed module is imported
//! fresh, both copies are turned into object trees (`graph`), the trees are
//! diffed into `actions`, and the actions mutate the live objects so that
//! every existing reference keeps pointing at a valid, updated object.
//!
//! `deps` records which modules import which, so that a data change in one
//! module re-runs the modules built on top of it.

use crate::script::ScriptError;
use thiserror::Error;

pub mod actions;
pub mod deps;
pub mod graph;
pub mod reloader;

pub use deps::DependencyTracker;
pub use reloader::{PartialReloader, ReloadReport};

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("Module '{0}' is not loaded.")]
    NotLoaded(String),
    #[error("Failed to re-import module '{module}': {source}")]
    Import {
        module: String,
        #[source]
        source: ScriptError,
    },
    #[error("Partial reload of '{module}' failed: {reason}")]
    Partial { module: String, reason: String },
}
