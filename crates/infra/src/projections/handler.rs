//! Generic projection handler: batched catch-up from the event store.
//!
//! A handler is bound to a set of aggregate types and one logical table. It
//! owns the only writer of its watermark; nothing else may advance it.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tracing::{debug, error};

use keyforge_core::InstanceId;
use keyforge_events::EventEnvelope;

use super::ProjectionError;
use super::statement::{RowOp, Statement};
use super::table::ProjectionTable;
use crate::event_store::{EventStore, SearchQuery};

/// Pure fold function from one event to zero-or-one row operation.
///
/// Registered per event type at handler construction; an event type with no
/// registered reducer is silently skipped (forward-compatible evolution).
pub type Reducer<K, V, C> =
    fn(&EventEnvelope<JsonValue>) -> Result<Option<RowOp<K, V, C>>, ProjectionError>;

/// A long-lived projection handler.
///
/// `catch_up` is the only processing entry point: it pulls ordered events
/// with `position > watermark`, folds them to statements, and applies each
/// batch atomically together with the watermark advance. Running it after a
/// crash mid-batch re-applies idempotent statements and converges.
pub struct ProjectionHandler<K, V, C, S, T> {
    name: &'static str,
    aggregate_types: Vec<&'static str>,
    reducers: HashMap<&'static str, Reducer<K, V, C>>,
    store: S,
    table: T,
    batch_size: u32,
}

/// Default catch-up batch size.
pub const DEFAULT_BATCH_SIZE: u32 = 200;

impl<K, V, C, S, T> ProjectionHandler<K, V, C, S, T>
where
    S: EventStore,
    T: ProjectionTable<K, V, C>,
{
    pub fn new(
        name: &'static str,
        aggregate_types: Vec<&'static str>,
        store: S,
        table: T,
    ) -> Self {
        Self {
            name,
            aggregate_types,
            reducers: HashMap::new(),
            store,
            table,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Register the reducer for one event type.
    pub fn on(mut self, event_type: &'static str, reducer: Reducer<K, V, C>) -> Self {
        self.reducers.insert(event_type, reducer);
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The table this handler maintains (query access for the read side).
    pub fn table(&self) -> &T {
        &self.table
    }

    /// Process everything newer than the watermark; returns the number of
    /// events consumed.
    ///
    /// A reducer failure is fatal for the handler (stop-and-alert): the batch
    /// is not applied, the watermark does not move, and the error propagates.
    pub fn catch_up(&self, instance_id: InstanceId) -> Result<u64, ProjectionError> {
        let mut processed = 0u64;

        loop {
            let watermark = self.table.watermark(self.name, instance_id);
            let latest = self.store.latest_position(instance_id)?;
            if latest <= watermark {
                break;
            }

            let page = self.store.filter(
                &SearchQuery::for_instance(instance_id)
                    .with_aggregate_types(self.aggregate_types.iter().copied())
                    .with_position_after(watermark)
                    .with_limit(self.batch_size),
            )?;

            if page.events.is_empty() {
                // Other aggregate types advanced the log; record that there
                // is nothing for us up to `latest`.
                self.table.apply(self.name, instance_id, &[], latest)?;
                break;
            }

            let mut statements = Vec::new();
            let mut batch_watermark = watermark;
            for event in &page.events {
                let envelope = event.to_envelope();
                if let Some(reducer) = self.reducers.get(envelope.event_type()) {
                    match reducer(&envelope) {
                        Ok(Some(op)) => statements.push(Statement {
                            sequence: event.sequence,
                            position: event.position,
                            op,
                        }),
                        Ok(None) => {}
                        Err(err) => {
                            error!(
                                handler = self.name,
                                event_type = envelope.event_type(),
                                position = %event.position,
                                error = %err,
                                "projection fold failed, stopping handler"
                            );
                            return Err(err);
                        }
                    }
                }
                batch_watermark = event.position;
            }

            self.table
                .apply(self.name, instance_id, &statements, batch_watermark)?;
            processed += page.events.len() as u64;

            debug!(
                handler = self.name,
                events = page.events.len(),
                watermark = %batch_watermark,
                "applied projection batch"
            );

            if page.continuation.is_none() {
                break;
            }
        }

        Ok(processed)
    }
}
