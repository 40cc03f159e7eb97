use chrono::{DateTime, Utc};

use keyforge_core::{AggregateId, OrgId, Position};

/// Consistency token returned by every command.
///
/// Carries the aggregate's resulting `(sequence, position)` so callers can
/// demand read-your-writes from the query side: a projection serving the read
/// is caught up once its watermark reaches `position`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDetails {
    pub id: AggregateId,
    pub resource_owner: OrgId,
    pub sequence: u64,
    pub position: Position,
    pub changed_at: DateTime<Utc>,
}
