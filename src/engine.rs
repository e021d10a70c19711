//! Engine entry point
//!
//! [`Engine`] holds what outlives a request: configuration, the schema
//! lock and the event sink. [`TenantScope`] binds it to one project and one
//! open transaction for the duration of a call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::audit::{Actor, AuditLogSink, EventSink};
use crate::backend::Executor;
use crate::catalog::{store, Collection, Project};
use crate::config::Config;
use crate::dialect::{Dialect, TableRef};
use crate::error::EngineResult;
use crate::schema::lock::{acquire, lock_for_mode, LockGuard, LockKey, SchemaLock};

pub struct Engine {
    config: Config,
    lock: Arc<dyn SchemaLock>,
    events: Arc<dyn EventSink>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let lock = lock_for_mode(config.schema.lock, config.schema.lock_wait());
        Engine {
            config,
            lock,
            events: Arc::new(AuditLogSink),
        }
    }

    pub fn with_lock(mut self, lock: Arc<dyn SchemaLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lock(&self) -> &dyn SchemaLock {
        self.lock.as_ref()
    }

    pub fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    /// Register a tenant and provision everything it starts with: the
    /// physical namespace, the system users collection and default roles.
    pub fn create_project(
        &self,
        exec: &dyn Executor,
        name: &str,
        actor: Actor,
    ) -> EngineResult<Project> {
        let project = store::insert_project(exec, name)?;
        self.scope(exec, &project).with_actor(actor).bootstrap()?;
        info!(project = %project.id, name = %name, "project_created");
        Ok(project)
    }

    /// Re-run provisioning for an existing project; safe to repeat.
    pub fn bootstrap_project(
        &self,
        exec: &dyn Executor,
        project: &Project,
    ) -> EngineResult<Collection> {
        self.scope(exec, project).bootstrap()
    }

    pub fn scope<'a>(&'a self, exec: &'a dyn Executor, project: &'a Project) -> TenantScope<'a> {
        TenantScope {
            engine: self,
            exec,
            project,
            actor: Actor::default(),
        }
    }
}

/// One tenant, one transaction, one actor
pub struct TenantScope<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) exec: &'a dyn Executor,
    pub(crate) project: &'a Project,
    pub(crate) actor: Actor,
}

impl<'a> TenantScope<'a> {
    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn exec(&self) -> &'a dyn Executor {
        self.exec
    }

    pub fn project(&self) -> &'a Project {
        self.project
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn config(&self) -> &'a Config {
        &self.engine.config
    }

    pub fn dialect(&self) -> Dialect {
        self.exec.dialect()
    }

    pub fn table_ref(&self, collection: &Collection) -> TableRef {
        self.dialect()
            .table_ref(&self.project.id, &collection.sql_table_name)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub(crate) fn actor_user_id(&self) -> Option<&str> {
        self.actor.user_id.as_deref()
    }

    /// Take the schema lock for one collection (or pending collection name).
    pub(crate) fn lock_collection(&self, collection_key: &str) -> EngineResult<LockGuard<'a>> {
        acquire(
            self.engine.lock(),
            self.exec,
            LockKey::new(&self.project.id, collection_key),
        )
    }

    /// Idempotent tenant provisioning.
    pub fn bootstrap(&self) -> EngineResult<Collection> {
        self.ensure_tenant_namespace()?;
        let users = self.ensure_users_collection()?;
        self.initialize_default_roles()?;
        Ok(users)
    }
}
