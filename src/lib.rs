//! # tenantcore
//!
//! Dynamic schema, query and authorization engine for multi-tenant
//! backends. Tenants define collections and fields at runtime; the engine
//! turns those definitions into physical tables, evolves them safely, runs
//! filtered CRUD and saved views against them, and decides access through
//! per-collection policies.
//!
//! ## Architecture
//!
//! ```text
//! Caller (transport layer)
//!     │  principal, project, open transaction, actor
//!     ↓
//! Engine ──scope()──→ TenantScope
//!     │                   ├── schema      (DDL, evolution, aliases, previews)
//!     │                   ├── query       (filter/sort compiler, CRUD)
//!     │                   ├── views       (saved, versioned queries)
//!     │                   ├── validation  (per-field rules)
//!     │                   └── authz       (policies, conditions, roles)
//!     ↓
//! Executor (backend) ──→ SQLite today; dialect decides the table layout
//! ```
//!
//! Every call runs synchronously inside the caller's transaction. A failed
//! call leaves nothing behind once the caller rolls back.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tenantcore::{backend::sqlite, Actor, Config, Engine, FieldSpec, FieldType, ListQuery};
//!
//! let conn = sqlite::open_in_memory()?;
//! let exec = sqlite::SqliteExecutor::new(&conn);
//! let engine = Engine::new(Config::default());
//!
//! let project = engine.create_project(&exec, "shop", Actor::admin("owner"))?;
//! let scope = engine.scope(&exec, &project);
//! let products = scope.create_collection("products", None)?;
//! scope.add_field(&products, FieldSpec::new("price", FieldType::Float))?;
//!
//! let page = scope.list_records(&products, &ListQuery::default().filter("price__gte", 100))?;
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ident` | Slug validation and identifier quoting |
//! | `dialect` | Table references, physical types and DDL text per layout |
//! | `backend` | Executor trait and the SQLite implementation |
//! | `catalog` | Collections, fields, aliases and the schema op ledger |
//! | `schema` | Schema manager, evolution, previews, relations, locks |
//! | `query` | Filter/sort compiler and record CRUD |
//! | `views` | Saved views and their execution |
//! | `validation` | Per-field validation rules |
//! | `authz` | Policies, condition trees, roles |
//! | `audit` | Record change events and the audit trail |

// Foundations
pub mod config;   // Configuration system
pub mod error;    // Engine error taxonomy
pub mod ident;    // Identifier validation
pub mod dialect;  // Table Reference Resolver and DDL text

// Storage
pub mod backend;  // Executor abstraction, SQLite backend
pub mod catalog;  // Persisted logical schema

// Engine
pub mod engine;
pub mod schema;
pub mod query;
pub mod views;
pub mod validation;
pub mod authz;
pub mod audit;

pub use audit::{Actor, EventSink, RecordAction, RecordEvent};
pub use authz::{Condition, Decision, Policy, PolicyAction, PolicySpec, Principal, PrincipalKind, Role};
pub use catalog::{Collection, Field, FieldType, OnDelete, Project};
pub use config::Config;
pub use dialect::Dialect;
pub use engine::{Engine, TenantScope};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use ident::validate_slug;
pub use query::{FilterOp, ListQuery, Page};
pub use schema::{FieldSpec, MigrationPreview, MigrationRequest, RelationFieldSpec};
pub use validation::{RuleKind, ValidationRule};
pub use views::{View, ViewDefinition, ViewResult};
