#![allow(missing_docs)]

//! Kiso: a per-session agent orchestration server (§1).
//!
//! Two subcommands: `migrate` applies the store schema and seeds default
//! role prompt templates, then exits; `serve` wires up the full runtime
//! (store, LLM gateway, skills, scheduler) and blocks until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use kiso::config::KisoConfig;
use kiso::kernel::audit::AuditLog;
use kiso::kernel::scheduler::{Scheduler, SchedulerState};
use kiso::kernel::template::TemplateRegistry;
use kiso::llm::LlmGateway;
use kiso::sanitizer::{Fencer, Sanitizer};
use kiso::secrets::DeploySecrets;
use kiso::skills::SkillRegistry;
use kiso::store::Store;

/// Default OS user non-admin `exec` tasks run as when no override is set.
const DEFAULT_RESTRICTED_OS_USER: &str = "kiso-restricted";

/// Default directory deploy secrets are read from.
const DEFAULT_SECRETS_DIR: &str = "secrets";

/// Default directory rotating log files are written to.
const DEFAULT_LOGS_DIR: &str = "logs";

#[derive(Parser)]
#[command(name = "kiso", about = "Per-session agent orchestration server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the store schema and seed default role prompt templates.
    Migrate,
    /// Run the scheduler, recovering any crash-interrupted work first.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = KisoConfig::load().context("failed to load configuration")?;

    match cli.command {
        Command::Migrate => run_migrate(&config).await,
        Command::Serve => run_serve(&config).await,
    }
}

async fn run_migrate(config: &KisoConfig) -> Result<()> {
    kiso::logging::init_cli();
    info!("applying store schema");
    let _store = Store::open(&PathBuf::from(&config.paths.store_db))
        .await
        .context("failed to open and migrate store")?;

    let templates = TemplateRegistry::new(&config.paths.roles_dir);
    templates.seed_defaults().context("failed to seed default role prompt templates")?;

    info!("migration complete");
    Ok(())
}

async fn run_serve(config: &KisoConfig) -> Result<()> {
    let _guard = kiso::logging::init_production(&PathBuf::from(DEFAULT_LOGS_DIR))
        .context("failed to initialize logging")?;
    info!("kiso starting");

    let store = Store::open(&PathBuf::from(&config.paths.store_db))
        .await
        .context("failed to open store")?;

    let deploy_secrets = DeploySecrets::load(DEFAULT_SECRETS_DIR)
        .await
        .context("failed to load deploy secrets")?;
    for key in deploy_secrets.keys().await {
        store
            .record_deploy_secret_loaded(&key)
            .await
            .context("failed to record loaded deploy secret")?;
    }

    let gateway = LlmGateway::from_config(&config.llm);
    gateway
        .probe_structured_output(&config.llm)
        .await
        .context("structured-output capability probe failed")?;
    let registry = SkillRegistry::new(&config.paths.skills_dir);
    let templates = TemplateRegistry::new(&config.paths.roles_dir);
    templates.seed_defaults().context("failed to seed default role prompt templates")?;
    let audit = AuditLog::new(&config.paths.audit_log);

    let restricted_os_user =
        std::env::var("KISO_RESTRICTED_OS_USER").unwrap_or_else(|_| DEFAULT_RESTRICTED_OS_USER.to_string());

    let state = SchedulerState {
        store,
        gateway,
        llm_config: config.llm.clone(),
        runtime: config.runtime.clone(),
        budget_config: config.budget.clone(),
        knowledge: config.knowledge.clone(),
        access: config.access.clone(),
        registry,
        templates,
        fencer: Fencer::new(),
        sanitizer: Sanitizer::new(),
        audit,
        deploy_secrets,
        http_client: reqwest::Client::new(),
        sessions_root: PathBuf::from(&config.paths.sessions_dir),
        restricted_os_user,
    };

    let scheduler = Scheduler::new(state);

    let report = scheduler.recover().await.context("startup recovery failed")?;
    if !report.is_clean() {
        info!(
            tasks_failed = report.tasks_failed,
            plans_failed = report.plans_failed,
            messages_requeued = report.messages_to_enqueue.len(),
            "recovered from an unclean shutdown"
        );
    }

    info!("kiso ready");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("kiso shutting down");
    Ok(())
}
