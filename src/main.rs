//! # tenantcore CLI
//!
//! Administrative commands against the configured SQLite database. Every
//! command runs in one immediate transaction and prints JSON on stdout.
//!
//! ## Usage
//!
//! ```bash
//! tenantcore init
//! tenantcore config
//! tenantcore project create shop
//! tenantcore collection create <project-id> products
//! tenantcore field add <project-id> products price --type float
//! tenantcore collection rename <project-id> products items
//! tenantcore preview <project-id> items change-field-type price --new-type int
//! tenantcore ops <project-id>
//! ```
//!
//! ## Tracing
//!
//! Set `TENANTCORE_TRACE=1` to write logs to `TENANTCORE_TRACE_FILE`
//! (default `tenantcore_trace.log`). `TENANTCORE_TRACE_LEVEL` and
//! `TENANTCORE_TRACE_JSON` override the `[logging]` section of the config.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::{json, Value};

use tenantcore::backend::sqlite::{open_database, SqliteExecutor};
use tenantcore::catalog::{store, CATALOG_VERSION};
use tenantcore::config::LoggingConfig;
use tenantcore::{
    Actor, Config, Engine, EngineResult, FieldSpec, FieldType, MigrationRequest, TenantScope,
};

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Debug, Parser)]
#[command(name = "tenantcore", version, about = "Multi-tenant schema engine administration")]
struct Cli {
    /// Config file (defaults to config.toml + config.local.toml + env)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Database file, overriding the config
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Admin user id recorded as the actor of schema changes
    #[arg(long, global = true)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database and catalog tables
    Init,

    /// Print the effective configuration as TOML
    Config,

    /// Projects (tenants)
    #[command(subcommand)]
    Project(ProjectCommand),

    /// Collections of a project
    #[command(subcommand)]
    Collection(CollectionCommand),

    /// Fields of a collection
    #[command(subcommand)]
    Field(FieldCommand),

    /// Show the DDL a schema change would run, without running it
    Preview {
        project: String,
        collection: String,
        #[command(subcommand)]
        op: PreviewCommand,
    },

    /// Schema operation ledger of a project, newest first
    Ops {
        project: String,
        /// Only ops on this collection
        #[arg(long)]
        collection: Option<String>,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// Register a project and provision its namespace, users collection and roles
    Create { name: String },
    /// Re-run provisioning for an existing project
    Bootstrap { project: String },
}

#[derive(Debug, Subcommand)]
enum CollectionCommand {
    Create {
        project: String,
        name: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    List {
        project: String,
    },
    /// Rename; the old name keeps resolving for the alias grace period
    Rename {
        project: String,
        collection: String,
        new_name: String,
    },
}

#[derive(Debug, Subcommand)]
enum FieldCommand {
    Add {
        project: String,
        collection: String,
        name: String,
        #[arg(short = 't', long = "type")]
        field_type: FieldType,
        #[arg(long)]
        required: bool,
        #[arg(long)]
        unique: bool,
        #[arg(long)]
        indexed: bool,
        #[arg(long)]
        hidden: bool,
        #[arg(long = "default")]
        default_value: Option<String>,
    },
    List {
        project: String,
        collection: String,
        #[arg(long)]
        include_deleted: bool,
    },
    Rename {
        project: String,
        collection: String,
        field: String,
        new_name: String,
    },
    SoftDelete {
        project: String,
        collection: String,
        field: String,
    },
    Restore {
        project: String,
        collection: String,
        field: String,
    },
    /// Drop the column; requires a prior soft delete unless --force
    HardDelete {
        project: String,
        collection: String,
        field: String,
        #[arg(long)]
        force: bool,
    },
    ChangeType {
        project: String,
        collection: String,
        field: String,
        new_type: FieldType,
    },
}

#[derive(Debug, Subcommand)]
enum PreviewCommand {
    RenameCollection { new_name: String },
    RenameField { field: String, new_name: String },
    SoftDeleteField { field: String },
    HardDeleteField { field: String },
    ChangeFieldType {
        field: String,
        #[arg(long)]
        new_type: FieldType,
    },
}

impl PreviewCommand {
    fn into_request(self) -> MigrationRequest {
        match self {
            PreviewCommand::RenameCollection { new_name } => MigrationRequest::RenameCollection { new_name },
            PreviewCommand::RenameField { field, new_name } => MigrationRequest::RenameField { field, new_name },
            PreviewCommand::SoftDeleteField { field } => MigrationRequest::SoftDeleteField { field },
            PreviewCommand::HardDeleteField { field } => MigrationRequest::HardDeleteField { field },
            PreviewCommand::ChangeFieldType { field, new_type } => {
                MigrationRequest::ChangeFieldType { field, new_type }
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading config '{path}'"))?,
        None => Config::load().unwrap_or_default(),
    };
    if let Some(path) = &cli.database {
        config.database.path.clone_from(path);
    }
    init_tracing(&config.logging);

    if matches!(cli.command, Command::Config) {
        print!("{}", toml::to_string_pretty(&config).context("rendering config")?);
        return Ok(());
    }

    if let Some(parent) = config.database.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let mut conn = open_database(&config.database.path, config.database.busy_timeout())
        .with_context(|| format!("opening '{}'", config.database.path.display()))?;

    let actor = cli.actor.map(Actor::admin).unwrap_or_default();
    let database = config.database.path.display().to_string();
    let engine = Engine::new(config);

    let output = match cli.command {
        Command::Init => json!({ "database": database, "catalog_version": CATALOG_VERSION }),
        // Printed before the database was opened
        Command::Config => return Ok(()),
        Command::Project(cmd) => run_project(&engine, &mut conn, actor, cmd)?,
        Command::Collection(cmd) => run_collection(&engine, &mut conn, actor, cmd)?,
        Command::Field(cmd) => run_field(&engine, &mut conn, actor, cmd)?,
        Command::Preview { project, collection, op } => {
            let request = op.into_request();
            in_project(&engine, &mut conn, &project, actor, |scope| {
                let c = scope.resolve_collection(&collection)?;
                scope.preview_migration(&c, &request)
            })?
        }
        Command::Ops { project, collection, limit } => {
            in_project(&engine, &mut conn, &project, actor, |scope| {
                let cid = match &collection {
                    Some(name) => Some(scope.resolve_collection(name)?.id),
                    None => None,
                };
                store::list_schema_ops(scope.exec(), &scope.project().id, cid.as_deref(), limit)
            })?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Run `f` in an immediate transaction and commit on success.
fn in_transaction<T, F>(conn: &mut Connection, f: F) -> anyhow::Result<Value>
where
    T: Serialize,
    F: FnOnce(&SqliteExecutor<'_>) -> EngineResult<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = f(&SqliteExecutor::new(&tx))?;
    tx.commit()?;
    Ok(serde_json::to_value(out)?)
}

fn in_project<T, F>(
    engine: &Engine,
    conn: &mut Connection,
    project_id: &str,
    actor: Actor,
    f: F,
) -> anyhow::Result<Value>
where
    T: Serialize,
    F: FnOnce(&TenantScope<'_>) -> EngineResult<T>,
{
    in_transaction(conn, |exec| {
        let project = store::get_project(exec, project_id)?;
        let scope = engine.scope(exec, &project).with_actor(actor);
        f(&scope)
    })
}

fn run_project(
    engine: &Engine,
    conn: &mut Connection,
    actor: Actor,
    cmd: ProjectCommand,
) -> anyhow::Result<Value> {
    match cmd {
        ProjectCommand::Create { name } => {
            in_transaction(conn, |exec| engine.create_project(exec, &name, actor))
        }
        ProjectCommand::Bootstrap { project } => in_transaction(conn, |exec| {
            let project = store::get_project(exec, &project)?;
            engine.bootstrap_project(exec, &project)
        }),
    }
}

fn run_collection(
    engine: &Engine,
    conn: &mut Connection,
    actor: Actor,
    cmd: CollectionCommand,
) -> anyhow::Result<Value> {
    match cmd {
        CollectionCommand::Create { project, name, display_name } => {
            in_project(engine, conn, &project, actor, |scope| {
                scope.create_collection(&name, display_name.as_deref())
            })
        }
        CollectionCommand::List { project } => {
            in_project(engine, conn, &project, actor, |scope| scope.list_collections())
        }
        CollectionCommand::Rename { project, collection, new_name } => {
            in_project(engine, conn, &project, actor, |scope| {
                let c = scope.resolve_collection(&collection)?;
                scope.rename_collection(&c, &new_name)
            })
        }
    }
}

fn run_field(
    engine: &Engine,
    conn: &mut Connection,
    actor: Actor,
    cmd: FieldCommand,
) -> anyhow::Result<Value> {
    match cmd {
        FieldCommand::Add {
            project,
            collection,
            name,
            field_type,
            required,
            unique,
            indexed,
            hidden,
            default_value,
        } => in_project(engine, conn, &project, actor, |scope| {
            let c = scope.resolve_collection(&collection)?;
            let mut spec = FieldSpec::new(name, field_type);
            spec.is_required = required;
            spec.is_unique = unique;
            spec.is_indexed = indexed;
            spec.is_hidden = hidden;
            spec.default_value = default_value;
            scope.add_field(&c, spec)
        }),
        FieldCommand::List { project, collection, include_deleted } => {
            in_project(engine, conn, &project, actor, |scope| {
                let c = scope.resolve_collection(&collection)?;
                scope.list_fields(&c, include_deleted)
            })
        }
        FieldCommand::Rename { project, collection, field, new_name } => {
            in_project(engine, conn, &project, actor, |scope| {
                let c = scope.resolve_collection(&collection)?;
                let f = scope.resolve_field(&c, &field)?;
                scope.rename_field(&c, &f, &new_name)
            })
        }
        FieldCommand::SoftDelete { project, collection, field } => {
            in_project(engine, conn, &project, actor, |scope| {
                let c = scope.resolve_collection(&collection)?;
                let f = scope.resolve_field(&c, &field)?;
                scope.soft_delete_field(&c, &f)
            })
        }
        FieldCommand::Restore { project, collection, field } => {
            in_project(engine, conn, &project, actor, |scope| {
                let c = scope.resolve_collection(&collection)?;
                let f = scope.resolve_field(&c, &field)?;
                scope.restore_field(&c, &f)
            })
        }
        FieldCommand::HardDelete { project, collection, field, force } => {
            in_project(engine, conn, &project, actor, |scope| {
                let c = scope.resolve_collection(&collection)?;
                let f = scope.resolve_field(&c, &field)?;
                scope.hard_delete_field(&c, &f, force)?;
                Ok(json!({ "deleted": f.name }))
            })
        }
        FieldCommand::ChangeType { project, collection, field, new_type } => {
            in_project(engine, conn, &project, actor, |scope| {
                let c = scope.resolve_collection(&collection)?;
                let f = scope.resolve_field(&c, &field)?;
                scope.change_field_type(&c, &f, new_type)
            })
        }
    }
}

fn init_tracing(logging_config: &LoggingConfig) {
    // Environment variables take precedence over config file values
    let enabled = env::var("TENANTCORE_TRACE").ok().is_some_and(|v| v != "0");
    if !enabled {
        return;
    }

    let log_path =
        env::var("TENANTCORE_TRACE_FILE").unwrap_or_else(|_| "tenantcore_trace.log".to_string());

    let json = env::var("TENANTCORE_TRACE_JSON")
        .ok()
        .map_or_else(|| logging_config.format == "json", |v| v != "0");

    let level = env::var("TENANTCORE_TRACE_LEVEL")
        .ok()
        .unwrap_or_else(|| logging_config.level.clone());

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("ERROR: Unable to open TENANTCORE_TRACE_FILE '{log_path}': {e}");
            return;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let _ = TRACE_GUARD.set(guard);

    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let base = || {
        tracing_subscriber::fmt()
            .with_env_filter(filter.clone())
            .with_ansi(false)
            .with_writer(non_blocking.clone())
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if json {
        Box::new(base().json().finish())
    } else {
        Box::new(base().compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
