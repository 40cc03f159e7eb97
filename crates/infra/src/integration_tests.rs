//! Integration tests for the full event-sourced pipeline.
//!
//! Tests: Command → EventStore → EventBus → ProjectionHandler → Table
//!
//! Verifies:
//! - Commands produce events that update read models correctly
//! - Optimistic concurrency conflicts are detected and retried with reload
//! - No-op commands append nothing and still return a consistency token
//! - Projection catch-up is idempotent and rebuilds converge

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use keyforge_core::{AggregateId, DomainError, DomainResult, InstanceId, OrgId, Position, UserId};
use keyforge_events::{EventEnvelope, InMemoryEventBus};
use keyforge_users::{Email, EncryptedCode};

use crate::command::{
    ChangeSchemaUser, CommandContext, CommandError, Commands, CreateSchemaUser, CreateUserSchema,
    EncryptedCodeGenerator, PermissionCheck, SchemaUpdate, SetLimits, UuidGenerator,
};
use crate::event_store::{
    EventStore, EventStoreError, InMemoryEventStore, PublishingEventStore, SearchQuery,
    SequenceGuard, StoredEvent, UncommittedEvent,
};
use crate::projections::{
    InMemoryProjectionTable, LimitsRow, NoChanges, ProjectionTable, UserRow, UserRowChange,
    limits_projection, users_projection,
};
use crate::workers::ProjectionWorker;

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type TestStore = PublishingEventStore<Arc<InMemoryEventStore>, Bus>;

struct AllowAll;

impl PermissionCheck for AllowAll {
    fn check(
        &self,
        _instance_id: InstanceId,
        _resource_owner: OrgId,
        _permission: &str,
        _aggregate_id: AggregateId,
    ) -> DomainResult<()> {
        Ok(())
    }
}

struct DenyAll;

impl PermissionCheck for DenyAll {
    fn check(
        &self,
        _instance_id: InstanceId,
        _resource_owner: OrgId,
        _permission: &str,
        _aggregate_id: AggregateId,
    ) -> DomainResult<()> {
        Err(DomainError::PermissionDenied)
    }
}

struct FixedCodes;

impl EncryptedCodeGenerator for FixedCodes {
    fn generate(&self) -> DomainResult<EncryptedCode> {
        Ok(EncryptedCode {
            encrypted: "enc:code".to_string(),
            plain: "12345678".to_string(),
        })
    }
}

struct TestEnv {
    commands: Commands<TestStore>,
    store: Arc<InMemoryEventStore>,
    bus: Bus,
    ctx: CommandContext,
    resource_owner: OrgId,
}

fn setup() -> TestEnv {
    setup_with_permissions(Arc::new(AllowAll))
}

fn setup_with_permissions(permissions: Arc<dyn PermissionCheck>) -> TestEnv {
    let store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let commands = Commands::new(
        PublishingEventStore::new(store.clone(), bus.clone()),
        Arc::new(UuidGenerator),
        permissions,
        Arc::new(FixedCodes),
    );

    TestEnv {
        commands,
        store,
        bus,
        ctx: CommandContext::new(InstanceId::new(), UserId::new()),
        resource_owner: OrgId::new(),
    }
}

fn open_schema(env: &TestEnv) -> AggregateId {
    env.commands
        .create_user_schema(
            &env.ctx,
            CreateUserSchema {
                resource_owner: env.resource_owner,
                schema_id: None,
                schema_type: "employee".to_string(),
                document: json!({"type": "object"}),
            },
        )
        .unwrap()
        .id
}

fn create_user(env: &TestEnv, schema_id: AggregateId, email: Option<Email>) -> AggregateId {
    env.commands
        .create_schema_user(
            &env.ctx,
            CreateSchemaUser {
                resource_owner: env.resource_owner,
                user_id: None,
                schema_id,
                data: json!({"name": "user"}),
                email,
                phone: None,
            },
        )
        .unwrap()
        .details
        .id
}

fn all_events(env: &TestEnv) -> Vec<StoredEvent> {
    env.store
        .filter(&SearchQuery::for_instance(env.ctx.instance_id).with_limit(1000))
        .unwrap()
        .events
}

fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn create_user_flows_into_the_users_projection() {
    let env = setup();
    let schema_id = open_schema(&env);

    let result = env
        .commands
        .create_schema_user(
            &env.ctx,
            CreateSchemaUser {
                resource_owner: env.resource_owner,
                user_id: None,
                schema_id,
                data: json!({"name": "user"}),
                email: Some(Email {
                    address: "user@example.com".to_string(),
                    verified: false,
                    return_code: true,
                }),
                phone: None,
            },
        )
        .unwrap();

    // The plaintext code is surfaced to the caller only.
    assert_eq!(result.email_code.as_deref(), Some("12345678"));
    assert_eq!(result.details.sequence, 3);

    // Only the encrypted form was persisted.
    let code_event = all_events(&env)
        .into_iter()
        .find(|e| e.event_type == "user.email.code.added")
        .unwrap();
    assert_eq!(code_event.payload, json!({"code": "enc:code"}));

    let table = Arc::new(InMemoryProjectionTable::<AggregateId, UserRow, UserRowChange>::new());
    let handler = users_projection(env.store.clone(), table.clone());
    handler.catch_up(env.ctx.instance_id).unwrap();

    let row = handler
        .table()
        .get(env.ctx.instance_id, &result.details.id)
        .unwrap();
    assert_eq!(row.resource_owner, env.resource_owner);
    assert_eq!(row.schema_id, schema_id);
    assert_eq!(row.schema_revision, 1);
    assert_eq!(row.data, json!({"name": "user"}));
    assert_eq!(row.email.as_deref(), Some("user@example.com"));
    assert!(!row.email_verified);
    // The trailing code event is unmapped, so the row stops at the email
    // update's sequence.
    assert_eq!(row.sequence, 2);
}

#[test]
fn noop_change_appends_nothing_and_returns_success() {
    let env = setup();
    let schema_id = open_schema(&env);
    let user_id = create_user(&env, schema_id, None);

    let before = all_events(&env).len();

    let result = env
        .commands
        .change_schema_user(
            &env.ctx,
            ChangeSchemaUser {
                resource_owner: env.resource_owner,
                user_id,
                schema_user: Some(SchemaUpdate {
                    schema_id: None,
                    data: Some(json!({"name": "user"})),
                }),
                email: None,
                phone: None,
            },
        )
        .unwrap();

    assert_eq!(all_events(&env).len(), before);
    assert_eq!(result.details.id, user_id);
    assert_eq!(result.details.sequence, 1);
}

#[test]
fn change_after_delete_fails_not_found() {
    let env = setup();
    let schema_id = open_schema(&env);
    let user_id = create_user(&env, schema_id, None);

    env.commands
        .delete_schema_user(&env.ctx, env.resource_owner, user_id)
        .unwrap();

    let err = env
        .commands
        .change_schema_user(
            &env.ctx,
            ChangeSchemaUser {
                resource_owner: env.resource_owner,
                user_id,
                schema_user: None,
                email: Some(Email::new("new@example.com")),
                phone: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, CommandError::Domain(DomainError::NotFound)));

    let err = env
        .commands
        .delete_schema_user(&env.ctx, env.resource_owner, user_id)
        .unwrap_err();
    assert!(matches!(err, CommandError::Domain(DomainError::NotFound)));
}

#[test]
fn missing_schema_fails_not_found_before_any_append() {
    let env = setup();

    let err = env
        .commands
        .create_schema_user(
            &env.ctx,
            CreateSchemaUser {
                resource_owner: env.resource_owner,
                user_id: None,
                schema_id: AggregateId::new(),
                data: json!({"name": "user"}),
                email: None,
                phone: None,
            },
        )
        .unwrap_err();

    assert!(matches!(err, CommandError::Domain(DomainError::NotFound)));
    assert!(all_events(&env).is_empty());
}

#[test]
fn denied_permission_fails_without_touching_the_stream() {
    let env = setup_with_permissions(Arc::new(DenyAll));

    // Schema creation is denied as well, so seed the schema through a
    // permissive processor sharing the same store.
    let permissive = Commands::new(
        PublishingEventStore::new(env.store.clone(), env.bus.clone()),
        Arc::new(UuidGenerator),
        Arc::new(AllowAll),
        Arc::new(FixedCodes),
    );
    let schema_id = permissive
        .create_user_schema(
            &env.ctx,
            CreateUserSchema {
                resource_owner: env.resource_owner,
                schema_id: None,
                schema_type: "employee".to_string(),
                document: json!({"type": "object"}),
            },
        )
        .unwrap()
        .id;
    let before = all_events(&env).len();

    let err = env
        .commands
        .create_schema_user(
            &env.ctx,
            CreateSchemaUser {
                resource_owner: env.resource_owner,
                user_id: None,
                schema_id,
                data: json!({"name": "user"}),
                email: None,
                phone: None,
            },
        )
        .unwrap_err();

    assert!(matches!(
        err,
        CommandError::Domain(DomainError::PermissionDenied)
    ));
    assert_eq!(all_events(&env).len(), before);
}

#[test]
fn schema_field_permissions_are_enforced_at_the_command_boundary() {
    let env = setup();
    let schema_id = env
        .commands
        .create_user_schema(
            &env.ctx,
            CreateUserSchema {
                resource_owner: env.resource_owner,
                schema_id: None,
                schema_type: "employee".to_string(),
                document: json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "permission": {"owner": "r", "self": "rw"}}
                    }
                }),
            },
        )
        .unwrap()
        .id;

    let err = env
        .commands
        .create_schema_user(
            &env.ctx,
            CreateSchemaUser {
                resource_owner: env.resource_owner,
                user_id: None,
                schema_id,
                data: json!({"name": "user"}),
                email: None,
                phone: None,
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Domain(DomainError::PreconditionFailed(_))
    ));

    // The same write is legal when the user edits their own record.
    let user_id = AggregateId::from_uuid(*env.ctx.actor.as_uuid());
    env.commands
        .create_schema_user(
            &env.ctx,
            CreateSchemaUser {
                resource_owner: env.resource_owner,
                user_id: Some(user_id),
                schema_id,
                data: json!({"name": "user"}),
                email: None,
                phone: None,
            },
        )
        .unwrap();
}

/// Store decorator that fails the first append with a concurrency conflict.
struct ConflictOnce<S> {
    inner: S,
    armed: AtomicBool,
}

impl<S> ConflictOnce<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

impl<S: EventStore> EventStore for ConflictOnce<S> {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        guards: &[SequenceGuard],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            return Err(EventStoreError::Concurrency(
                "injected conflict".to_string(),
            ));
        }
        self.inner.append(events, guards)
    }

    fn filter(&self, query: &SearchQuery) -> Result<crate::event_store::EventPage, EventStoreError> {
        self.inner.filter(query)
    }

    fn latest_position(
        &self,
        instance_id: InstanceId,
    ) -> Result<Position, EventStoreError> {
        self.inner.latest_position(instance_id)
    }
}

#[test]
fn conflicting_append_is_retried_with_reload() {
    let store = Arc::new(ConflictOnce::new(InMemoryEventStore::new()));
    let commands = Commands::new(
        store.clone(),
        Arc::new(UuidGenerator),
        Arc::new(AllowAll),
        Arc::new(FixedCodes),
    );
    let ctx = CommandContext::new(InstanceId::new(), UserId::new());
    let resource_owner = OrgId::new();

    let schema_id = commands
        .create_user_schema(
            &ctx,
            CreateUserSchema {
                resource_owner,
                schema_id: None,
                schema_type: "employee".to_string(),
                document: json!({"type": "object"}),
            },
        )
        .unwrap()
        .id;

    store.arm();
    let result = commands
        .create_schema_user(
            &ctx,
            CreateSchemaUser {
                resource_owner,
                user_id: None,
                schema_id,
                data: json!({"name": "user"}),
                email: None,
                phone: None,
            },
        )
        .unwrap();
    assert_eq!(result.details.sequence, 1);

    // With a budget of one attempt the conflict surfaces to the caller.
    let single_shot = commands.with_max_attempts(1);
    store.arm();
    let err = single_shot
        .create_schema_user(
            &ctx,
            CreateSchemaUser {
                resource_owner,
                user_id: None,
                schema_id,
                data: json!({"name": "other"}),
                email: None,
                phone: None,
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Domain(DomainError::Conflict(_))
    ));
}

#[test]
fn limits_set_and_reset_flow_into_the_limits_projection() {
    let env = setup();

    env.commands
        .set_limits(
            &env.ctx,
            SetLimits {
                resource_owner: env.resource_owner,
                audit_log_retention: Some(Duration::from_secs(300)),
            },
        )
        .unwrap();

    let table = Arc::new(InMemoryProjectionTable::<OrgId, LimitsRow, NoChanges>::new());
    let handler = limits_projection(env.store.clone(), table.clone());
    handler.catch_up(env.ctx.instance_id).unwrap();

    let row = handler
        .table()
        .get(env.ctx.instance_id, &env.resource_owner)
        .unwrap();
    assert_eq!(row.audit_log_retention, Some(Duration::from_secs(300)));

    // Setting the same retention is a no-op.
    let before = all_events(&env).len();
    env.commands
        .set_limits(
            &env.ctx,
            SetLimits {
                resource_owner: env.resource_owner,
                audit_log_retention: Some(Duration::from_secs(300)),
            },
        )
        .unwrap();
    assert_eq!(all_events(&env).len(), before);

    // Reset deletes the row.
    env.commands
        .reset_limits(&env.ctx, env.resource_owner)
        .unwrap();
    handler.catch_up(env.ctx.instance_id).unwrap();
    assert!(
        handler
            .table()
            .get(env.ctx.instance_id, &env.resource_owner)
            .is_none()
    );

    // A second reset has nothing to clear.
    let err = env
        .commands
        .reset_limits(&env.ctx, env.resource_owner)
        .unwrap_err();
    assert!(matches!(err, CommandError::Domain(DomainError::NotFound)));
}

#[test]
fn catch_up_is_idempotent_and_rebuild_converges() {
    let env = setup();
    let schema_id = open_schema(&env);
    let user_id = create_user(&env, schema_id, Some(Email::new("user@example.com")));

    env.commands
        .change_schema_user(
            &env.ctx,
            ChangeSchemaUser {
                resource_owner: env.resource_owner,
                user_id,
                schema_user: Some(SchemaUpdate {
                    schema_id: None,
                    data: Some(json!({"name": "renamed"})),
                }),
                email: None,
                phone: None,
            },
        )
        .unwrap();

    let table = Arc::new(InMemoryProjectionTable::<AggregateId, UserRow, UserRowChange>::new());
    let handler = users_projection(env.store.clone(), table.clone());

    handler.catch_up(env.ctx.instance_id).unwrap();
    let first = handler.table().get(env.ctx.instance_id, &user_id).unwrap();

    // Nothing new: a second catch-up consumes zero events and changes nothing.
    assert_eq!(handler.catch_up(env.ctx.instance_id).unwrap(), 0);
    let second = handler.table().get(env.ctx.instance_id, &user_id).unwrap();
    assert_eq!(first, second);

    // Replay from scratch converges to the same row.
    handler.table().clear_instance(env.ctx.instance_id);
    handler.catch_up(env.ctx.instance_id).unwrap();
    let rebuilt = handler.table().get(env.ctx.instance_id, &user_id).unwrap();
    assert_eq!(first, rebuilt);
    assert_eq!(rebuilt.data, json!({"name": "renamed"}));
}

#[test]
fn small_batches_page_through_catch_up() {
    let env = setup();
    let schema_id = open_schema(&env);
    let user_id = create_user(&env, schema_id, None);

    for i in 0..5 {
        env.commands
            .change_schema_user(
                &env.ctx,
                ChangeSchemaUser {
                    resource_owner: env.resource_owner,
                    user_id,
                    schema_user: Some(SchemaUpdate {
                        schema_id: None,
                        data: Some(json!({"name": format!("rename-{i}")})),
                    }),
                    email: None,
                    phone: None,
                },
            )
            .unwrap();
    }

    let table = Arc::new(InMemoryProjectionTable::<AggregateId, UserRow, UserRowChange>::new());
    let handler = users_projection(env.store.clone(), table.clone()).with_batch_size(2);
    handler.catch_up(env.ctx.instance_id).unwrap();

    let row = handler.table().get(env.ctx.instance_id, &user_id).unwrap();
    assert_eq!(row.data, json!({"name": "rename-4"}));
    assert_eq!(row.sequence, 6);
}

#[test]
fn worker_catches_up_on_bus_wakeups() {
    let env = setup();
    let schema_id = open_schema(&env);

    let table = Arc::new(InMemoryProjectionTable::<AggregateId, UserRow, UserRowChange>::new());
    let handler = Arc::new(users_projection(env.store.clone(), table.clone()));

    let instance_id = env.ctx.instance_id;
    let worker_handler = handler.clone();
    let worker = ProjectionWorker::spawn(
        "projections.users.worker",
        env.bus.clone(),
        instance_id,
        move || worker_handler.catch_up(instance_id),
    );

    let user_id = create_user(&env, schema_id, Some(Email::new("user@example.com")));

    assert!(wait_until(|| table.get(instance_id, &user_id).is_some()));
    let row = table.get(instance_id, &user_id).unwrap();
    assert_eq!(row.email.as_deref(), Some("user@example.com"));

    worker.shutdown();
}
