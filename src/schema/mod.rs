//! # Schema Manager and Evolution Engine
//!
//! Turns catalog changes into physical DDL for one tenant and keeps the two
//! in step:
//!
//! - [`manager`]: namespace, table and column creation
//! - [`evolution`]: rename, soft/hard delete, restore and type change, with
//!   time-bounded aliases for renamed objects
//! - [`preview`]: side-effect free DDL previews for the evolution ops
//! - [`relations`]: many-to-one relation fields
//! - [`lock`]: the keyed lock that serializes structural changes
//!
//! All operations are methods on [`crate::engine::TenantScope`] and run inside
//! the caller's transaction. A failed statement leaves nothing behind once
//! the caller rolls back.

pub mod evolution;
pub mod lock;
pub mod manager;
pub mod preview;
pub mod relations;

pub use evolution::ActiveAliases;
pub use lock::{AdvisoryLock, InProcessLock, LockGuard, LockKey, NoopLock, SchemaLock};
pub use manager::{FieldSpec, USERS_COLLECTION};
pub use preview::{MigrationPreview, MigrationRequest};
pub use relations::{RelationFieldSpec, ReverseRelation};
