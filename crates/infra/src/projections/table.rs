//! Instance-isolated read-model table storage.
//!
//! A projection table owns both the rows and the handler watermarks, because
//! the contract requires "apply statements" and "advance watermark" to be one
//! atomic step: a crash between the two would either drop or double-apply a
//! batch. In memory that atomicity is the single write lock; in Postgres it
//! is one transaction.

use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use keyforge_core::{InstanceId, Position};

use super::ProjectionError;
use super::statement::{RowChange, RowOp, Statement};

/// Storage abstraction for one projection's rows + watermarks.
pub trait ProjectionTable<K, V, C>: Send + Sync {
    fn get(&self, instance_id: InstanceId, key: &K) -> Option<V>;

    fn list(&self, instance_id: InstanceId) -> Vec<V>;

    /// Last processed position for a (handler, instance) pair.
    fn watermark(&self, handler: &str, instance_id: InstanceId) -> Position;

    /// Apply statements in order and advance the watermark, atomically.
    ///
    /// The watermark never moves backwards; re-applying an already-processed
    /// batch must leave the table unchanged (statements are idempotent).
    fn apply(
        &self,
        handler: &str,
        instance_id: InstanceId,
        statements: &[Statement<K, V, C>],
        watermark: Position,
    ) -> Result<(), ProjectionError>;

    /// Drop all rows and watermarks for an instance (rebuild support).
    fn clear_instance(&self, instance_id: InstanceId);
}

impl<K, V, C, T> ProjectionTable<K, V, C> for Arc<T>
where
    T: ProjectionTable<K, V, C> + ?Sized,
{
    fn get(&self, instance_id: InstanceId, key: &K) -> Option<V> {
        (**self).get(instance_id, key)
    }

    fn list(&self, instance_id: InstanceId) -> Vec<V> {
        (**self).list(instance_id)
    }

    fn watermark(&self, handler: &str, instance_id: InstanceId) -> Position {
        (**self).watermark(handler, instance_id)
    }

    fn apply(
        &self,
        handler: &str,
        instance_id: InstanceId,
        statements: &[Statement<K, V, C>],
        watermark: Position,
    ) -> Result<(), ProjectionError> {
        (**self).apply(handler, instance_id, statements, watermark)
    }

    fn clear_instance(&self, instance_id: InstanceId) {
        (**self).clear_instance(instance_id)
    }
}

#[derive(Debug)]
struct TableInner<K, V> {
    rows: HashMap<(InstanceId, K), V>,
    watermarks: HashMap<(String, InstanceId), Position>,
}

/// In-memory projection table for tests/dev.
#[derive(Debug)]
pub struct InMemoryProjectionTable<K, V, C> {
    inner: RwLock<TableInner<K, V>>,
    _change: PhantomData<fn() -> C>,
}

impl<K, V, C> InMemoryProjectionTable<K, V, C> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V, C> Default for InMemoryProjectionTable<K, V, C> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                rows: HashMap::new(),
                watermarks: HashMap::new(),
            }),
            _change: PhantomData,
        }
    }
}

impl<K, V, C> ProjectionTable<K, V, C> for InMemoryProjectionTable<K, V, C>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: RowChange<V> + 'static,
{
    fn get(&self, instance_id: InstanceId, key: &K) -> Option<V> {
        let inner = self.inner.read().ok()?;
        inner.rows.get(&(instance_id, key.clone())).cloned()
    }

    fn list(&self, instance_id: InstanceId) -> Vec<V> {
        let inner = match self.inner.read() {
            Ok(i) => i,
            Err(_) => return vec![],
        };

        inner
            .rows
            .iter()
            .filter_map(|((i, _k), v)| (*i == instance_id).then(|| v.clone()))
            .collect()
    }

    fn watermark(&self, handler: &str, instance_id: InstanceId) -> Position {
        match self.inner.read() {
            Ok(inner) => inner
                .watermarks
                .get(&(handler.to_string(), instance_id))
                .copied()
                .unwrap_or(Position::ZERO),
            Err(_) => Position::ZERO,
        }
    }

    fn apply(
        &self,
        handler: &str,
        instance_id: InstanceId,
        statements: &[Statement<K, V, C>],
        watermark: Position,
    ) -> Result<(), ProjectionError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ProjectionError::Apply("lock poisoned".to_string()))?;

        for statement in statements {
            match &statement.op {
                RowOp::Upsert { key, row } => {
                    inner.rows.insert((instance_id, key.clone()), row.clone());
                }
                RowOp::Change { key, change } => {
                    if let Some(row) = inner.rows.get_mut(&(instance_id, key.clone())) {
                        change.apply_to(row);
                    }
                }
                RowOp::Delete { key } => {
                    inner.rows.remove(&(instance_id, key.clone()));
                }
            }
        }

        let entry = inner
            .watermarks
            .entry((handler.to_string(), instance_id))
            .or_insert(Position::ZERO);
        if watermark > *entry {
            *entry = watermark;
        }

        Ok(())
    }

    fn clear_instance(&self, instance_id: InstanceId) {
        if let Ok(mut inner) = self.inner.write() {
            inner.rows.retain(|(i, _k), _v| *i != instance_id);
            inner.watermarks.retain(|(_h, i), _p| *i != instance_id);
        }
    }
}
