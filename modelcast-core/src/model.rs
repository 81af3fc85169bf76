//! The live model: canonical document plus mutation listeners.

use crate::ops::{apply_operations, Document, Operation, OperationError};

/// Callback invoked after every successfully applied batch.
pub type MutationListener = Box<dyn Fn(&[Operation]) + Send + Sync>;

/// Point-in-time statistics about the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelMetrics {
    /// Length of the serialized document, in characters.
    pub serialized_size: usize,
    pub top_level_keys: usize,
    pub mutation_count: u64,
    /// Set by any mutation, cleared by [`LiveModel::take_dirty`].
    pub dirty: bool,
}

/// Owner of the canonical document.
///
/// Listeners run synchronously inside [`LiveModel::mutate`], in registration
/// order, so whoever holds the model lock also orders the notifications.
#[derive(Default)]
pub struct LiveModel {
    document: Document,
    listeners: Vec<MutationListener>,
    mutation_count: u64,
    dirty: bool,
}

impl LiveModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: Document) -> Self {
        Self {
            document,
            ..Self::default()
        }
    }

    /// Register a listener for applied batches.
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: Fn(&[Operation]) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Apply a batch and notify listeners.
    ///
    /// A failed batch leaves the document unchanged and notifies nobody.
    /// An empty batch is a no-op.
    pub fn mutate(&mut self, ops: &[Operation]) -> Result<(), OperationError> {
        if ops.is_empty() {
            return Ok(());
        }

        apply_operations(&mut self.document, ops)?;
        self.mutation_count += 1;
        self.dirty = true;

        log::trace!(
            "Applied {} operation(s), mutation #{}",
            ops.len(),
            self.mutation_count
        );

        for listener in &self.listeners {
            listener(ops);
        }
        Ok(())
    }

    /// Deep copy of the document.
    pub fn snapshot(&self) -> Document {
        self.document.clone()
    }

    /// Read-only borrow of the live document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn metrics(&self) -> ModelMetrics {
        let serialized_size = serde_json::to_string(&self.document)
            .map(|s| s.chars().count())
            .unwrap_or(0);
        ModelMetrics {
            serialized_size,
            top_level_keys: self.document.len(),
            mutation_count: self.mutation_count,
            dirty: self.dirty,
        }
    }

    /// Return the dirty flag and clear it.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl std::fmt::Debug for LiveModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveModel")
            .field("top_level_keys", &self.document.len())
            .field("listeners", &self.listeners.len())
            .field("mutation_count", &self.mutation_count)
            .field("dirty", &self.dirty)
            .finish()
    }
}
