use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use identity_kernel_api::IdentityApi;
use identity_kernel_core::ContactId;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ik")]
#[command(about = "Identity Kernel CLI")]
struct Cli {
    #[arg(long, env = "IDENTITY_DB", default_value = "./identity_kernel.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "IDENTITY_MAX_ATTEMPTS", default_value_t = identity_kernel_api::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    #[arg(long, env = "IDENTITY_BUSY_TIMEOUT_MS", default_value_t = identity_kernel_api::DEFAULT_BUSY_TIMEOUT_MS)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve an email and/or phone number to its identity cluster.
    Identify(IdentifyArgs),
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    /// Every stored contact, deleted ones included.
    List,
    /// Consolidated view of the cluster containing a contact.
    Show { id: i64 },
    /// Soft-delete a contact.
    Delete { id: i64 },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let api = IdentityApi::new(cli.db)
        .with_max_attempts(cli.max_attempts)
        .with_busy_timeout(Duration::from_millis(cli.busy_timeout_ms));
    match cli.command {
        Command::Identify(args) => run_identify(&args, &api),
        Command::Contact { command } => run_contact(command, &api),
        Command::Db { command } => run_db(command, &api),
    }
}

fn run_identify(args: &IdentifyArgs, api: &IdentityApi) -> Result<()> {
    let body = serde_json::json!({ "email": args.email, "phoneNumber": args.phone });
    let resolution = api.identify_json(&body)?;
    emit_json(serde_json::json!({
        "contact": resolution.view(),
        "outcome": resolution.outcome,
    }))
}

fn run_contact(command: ContactCommand, api: &IdentityApi) -> Result<()> {
    match command {
        ContactCommand::List => {
            let records = api.contact_list()?;
            emit_json(serde_json::json!({ "contacts": records }))
        }
        ContactCommand::Show { id } => {
            let view = api
                .contact_show(ContactId(id))?
                .ok_or_else(|| anyhow!("contact {id} not found or deleted"))?;
            emit_json(serde_json::json!({ "contact": view }))
        }
        ContactCommand::Delete { id } => {
            let record = api.contact_delete(ContactId(id))?;
            emit_json(serde_json::json!({ "deleted": record }))
        }
    }
}

fn run_db(command: DbCommand, api: &IdentityApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            let up_to_date = status.pending_versions.is_empty();
            emit_json(with_flag(serde_json::to_value(&status)?, "up_to_date", up_to_date))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let clean = report.is_clean();
            let value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            emit_json(with_flag(value, "clean", clean))
        }
    }
}

fn with_flag(mut value: Value, key: &str, flag: bool) -> Value {
    if let Value::Object(object) = &mut value {
        object.insert(key.to_string(), Value::Bool(flag));
    }
    value
}
