use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use keyforge_core::{AggregateId, DomainError, DomainResult, InstanceId};
use keyforge_events::{Event, EventEnvelope, WriteModel, WriteModelState};

/// Stable event type tags for the limits aggregate.
pub mod event_types {
    pub const SET: &str = "limits.set";
    pub const RESET: &str = "limits.reset";
}

/// Event: LimitsSet.
///
/// Retention travels as integer nanoseconds under `auditLogRetention`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSet {
    #[serde(
        rename = "auditLogRetention",
        with = "duration_nanos",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub audit_log_retention: Option<Duration>,
}

/// Event: LimitsReset. Clears all limits for the resource owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsReset {}

/// All events of the limits aggregate (untagged payloads).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LimitsEvent {
    Set(LimitsSet),
    Reset(LimitsReset),
}

impl Event for LimitsEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LimitsEvent::Set(_) => event_types::SET,
            LimitsEvent::Reset(_) => event_types::RESET,
        }
    }

    fn version(&self) -> u32 {
        1
    }
}

/// Write model for the limits singleton of one resource owner.
///
/// A reset returns the aggregate to its unset state: the stream lives on, but
/// the limits are gone until the next set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitsWriteModel {
    state: WriteModelState,
    set: bool,
    audit_log_retention: Option<Duration>,
}

impl LimitsWriteModel {
    pub fn new(instance_id: InstanceId, aggregate_id: AggregateId) -> Self {
        Self {
            state: WriteModelState::new(instance_id, aggregate_id),
            set: false,
            audit_log_retention: None,
        }
    }

    pub fn audit_log_retention(&self) -> Option<Duration> {
        self.audit_log_retention
    }

    /// Produce the set delta; setting the current value emits nothing.
    pub fn new_set(&self, audit_log_retention: Option<Duration>) -> DomainResult<Vec<LimitsEvent>> {
        if self.set && self.audit_log_retention == audit_log_retention {
            return Ok(vec![]);
        }
        Ok(vec![LimitsEvent::Set(LimitsSet { audit_log_retention })])
    }

    /// Produce the reset delta.
    pub fn new_reset(&self) -> DomainResult<Vec<LimitsEvent>> {
        if !self.exists() {
            return Err(DomainError::not_found());
        }
        Ok(vec![LimitsEvent::Reset(LimitsReset {})])
    }
}

impl WriteModel for LimitsWriteModel {
    fn aggregate_type(&self) -> &'static str {
        crate::AGGREGATE_TYPE
    }

    fn state(&self) -> &WriteModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WriteModelState {
        &mut self.state
    }

    fn apply(&mut self, envelope: &EventEnvelope<JsonValue>) -> DomainResult<()> {
        match envelope.event_type() {
            event_types::SET => {
                let e: LimitsSet = serde_json::from_value(envelope.payload().clone())
                    .map_err(|err| {
                        DomainError::corrupted(format!(
                            "undecodable '{}' payload at sequence {}: {err}",
                            envelope.event_type(),
                            envelope.sequence()
                        ))
                    })?;
                self.set = true;
                self.audit_log_retention = e.audit_log_retention;
            }
            event_types::RESET => {
                self.set = false;
                self.audit_log_retention = None;
            }
            // Unknown event types are ignored for forward compatibility.
            _ => {}
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.set
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_u64(d.as_nanos() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let nanos = Option::<u64>::deserialize(deserializer)?;
        Ok(nanos.map(Duration::from_nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn model() -> LimitsWriteModel {
        LimitsWriteModel::new(InstanceId::new(), AggregateId::new())
    }

    fn set_model(retention: Option<Duration>) -> LimitsWriteModel {
        let mut wm = model();
        wm.set = true;
        wm.audit_log_retention = retention;
        wm
    }

    #[test]
    fn set_payload_uses_nanosecond_wire_format() {
        let event = LimitsEvent::Set(LimitsSet {
            audit_log_retention: Some(FIVE_MINUTES),
        });
        let payload = serde_json::to_value(&event).unwrap();
        assert_eq!(payload, json!({"auditLogRetention": 300000000000u64}));

        let decoded: LimitsSet = serde_json::from_value(payload).unwrap();
        assert_eq!(decoded.audit_log_retention, Some(FIVE_MINUTES));
    }

    #[test]
    fn new_set_emits_set_event() {
        let events = model().new_set(Some(FIVE_MINUTES)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            LimitsEvent::Set(e) if e.audit_log_retention == Some(FIVE_MINUTES)
        ));
    }

    #[test]
    fn new_set_is_noop_for_the_current_value() {
        let wm = set_model(Some(FIVE_MINUTES));
        assert!(wm.new_set(Some(FIVE_MINUTES)).unwrap().is_empty());
        assert_eq!(wm.new_set(None).unwrap().len(), 1);
    }

    #[test]
    fn new_reset_requires_existing_limits() {
        assert_eq!(model().new_reset().unwrap_err(), DomainError::NotFound);
        assert_eq!(set_model(None).new_reset().unwrap().len(), 1);
    }
}
