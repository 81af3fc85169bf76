//! # modelcast-core
//!
//! The JSON document and the operation language that mutates it.
//!
//! ```text
//! ┌──────────────┐  &[Operation]  ┌────────────┐  listeners  ┌──────────────┐
//! │ backend apply├───────────────▸│ LiveModel  ├────────────▸│ server pump  │
//! └──────────────┘                │ (Document) │             └──────────────┘
//!                                 └────────────┘
//! ```
//!
//! Nothing in this crate does I/O. The server and client crates share it so
//! that both sides apply the exact same operation semantics.

pub mod model;
pub mod ops;

use std::sync::{Arc, RwLock};

pub use model::{LiveModel, ModelMetrics, MutationListener};
pub use ops::{
    apply_json_operations, apply_operations, full_refresh, get_path, Document, Operation,
    OperationError,
};

/// A live model shared between tasks.
pub type SharedModel = Arc<RwLock<LiveModel>>;

/// Wrap a model for sharing.
pub fn shared(model: LiveModel) -> SharedModel {
    Arc::new(RwLock::new(model))
}
