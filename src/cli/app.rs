use super::workspace::Workspace;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use live_migrate::{ConsistencyCheck, MigrationPlan, MigrationRequest, RowPredicate};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "live-migrate")]
#[command(about = "Online table migration across two replicated sites")]
struct Cli {
    /// Directory holding the local storage snapshot and orchestrator state.
    #[arg(long, default_value = ".live-migrate")]
    state_dir: PathBuf,
    /// Site configuration (JSON). Defaults to `<state-dir>/config.json`.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pre-flight checks for a plan; nothing is changed.
    Validate {
        #[arg(long)]
        plan: PathBuf,
    },
    Status {
        #[arg(long)]
        operation_id: Uuid,
    },
    PartnerScript {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        operation_id: Option<Uuid>,
    },
    Migrate {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        operation_id: Option<Uuid>,
        /// Join an operation started elsewhere instead of coordinating it.
        #[arg(long)]
        partner: bool,
        #[arg(long)]
        wait_for_partner: bool,
    },
    Rollback {
        #[arg(long)]
        current: String,
        #[arg(long)]
        backup: String,
    },
    Cleanup {
        /// LIKE pattern, e.g. `orders_backup_%`.
        #[arg(long)]
        pattern: String,
        #[arg(long, default_value_t = 168)]
        older_than_hours: i64,
        #[arg(long)]
        dry_run: bool,
    },
    Verify {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
        /// `source_col[:target_col]`, repeatable.
        #[arg(long = "column", required = true)]
        columns: Vec<String>,
    },
    Purge {
        #[arg(long, default_value_t = 720)]
        older_than_hours: i64,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let workspace = Workspace::open(&cli.state_dir, cli.config.as_deref()).await?;
    let migrator = &workspace.migrator;

    match cli.command {
        Command::Validate { plan } => {
            let plan = load_plan(&plan)?;
            let report = migrator.validate_readiness(&plan).await?;
            print_json(&report)?;
            if !report.ready {
                workspace.save().await?;
                bail!("{} readiness check(s) failed", report.failures().count());
            }
        }
        Command::Status { operation_id } => {
            print_json(&migrator.check_status(operation_id).await?)?;
        }
        Command::PartnerScript { plan, operation_id } => {
            let plan = load_plan(&plan)?;
            let script = migrator
                .generate_partner_script(&plan, operation_id.unwrap_or_else(Uuid::new_v4))
                .await?;
            println!("{}", script.to_json()?);
        }
        Command::Migrate {
            plan,
            operation_id,
            partner,
            wait_for_partner,
        } => {
            let plan = load_plan(&plan)?;
            let request = if partner {
                let Some(id) = operation_id else {
                    bail!("--partner needs the coordinator's --operation-id");
                };
                MigrationRequest::partner(plan, id)
            } else {
                let mut request =
                    MigrationRequest::coordinator(plan).wait_for_partner(wait_for_partner);
                if let Some(id) = operation_id {
                    request = request.with_operation_id(id);
                }
                request
            };
            let report = migrator.start_coordinated_migration(request).await?;
            print_json(&report)?;
        }
        Command::Rollback { current, backup } => {
            print_json(&migrator.rollback(&current, &backup).await?)?;
        }
        Command::Cleanup {
            pattern,
            older_than_hours,
            dry_run,
        } => {
            let report = migrator
                .cleanup_old_backups(&pattern, chrono::Duration::hours(older_than_hours), dry_run)
                .await?;
            print_json(&report)?;
        }
        Command::Verify {
            source,
            target,
            columns,
        } => {
            let check = ConsistencyCheck {
                source_table: source,
                target_table: target,
                column_pairs: columns.iter().map(|c| parse_column_pair(c)).collect(),
                source_predicate: RowPredicate::All,
                target_predicate: RowPredicate::All,
            };
            print_json(&migrator.verify_consistency(&check).await?)?;
        }
        Command::Purge { older_than_hours } => {
            let report = migrator
                .purge_operations(chrono::Duration::hours(older_than_hours))
                .await?;
            print_json(&report)?;
        }
    }

    workspace.save().await
}

fn load_plan(path: &Path) -> Result<MigrationPlan> {
    MigrationPlan::from_json_file(path)
        .with_context(|| format!("Failed to load plan '{}'", path.display()))
}

fn parse_column_pair(pair: &str) -> (String, String) {
    match pair.split_once(':') {
        Some((source, target)) => (source.to_string(), target.to_string()),
        None => (pair.to_string(), pair.to_string()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to render report")?
    );
    Ok(())
}
