use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shelfsync_lib::host::{HostBindings, HostFixture, MemoryHost};
use shelfsync_lib::logging::init_tracing;
use shelfsync_lib::orchestrator::{RunOutcome, SyncOrchestrator, Trigger};
use shelfsync_lib::store::{JsonFileStore, KeyValueStore, MemoryStore};
use shelfsync_lib::sync_engine::types::{CollectionAction, StepResult};
use shelfsync_lib::{ProfileNameService, SyncConfig};

#[derive(Parser)]
#[command(name = "shelfsync-cli")]
#[command(about = "Reconcile per-owner shared collections against a host fixture", long_about = None)]
struct Cli {
    /// Host state as JSON; rewritten after a real run
    #[arg(short, long)]
    fixture: PathBuf,

    /// Persisted state file (defaults to in-memory)
    #[arg(short, long)]
    state: Option<PathBuf>,

    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Resolve owner names from public profiles instead of the fixture
    #[arg(long)]
    online_names: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(if cli.verbose { "shelfsync_lib=debug" } else { "warn" });

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path).with_context(|| format!("Failed to load config {path:?}"))?,
        None => SyncConfig::default(),
    };

    if !cli.fixture.exists() {
        anyhow::bail!("Fixture file does not exist: {:?}", cli.fixture);
    }
    let raw = std::fs::read_to_string(&cli.fixture)
        .with_context(|| format!("Failed to read fixture {:?}", cli.fixture))?;
    let fixture: HostFixture = serde_json::from_str(&raw).context("Fixture is not valid host JSON")?;
    let host = MemoryHost::from_fixture(fixture);

    let storage: Arc<dyn KeyValueStore> = match &cli.state {
        Some(path) => Arc::new(JsonFileStore::new(path.clone())),
        None => Arc::new(MemoryStore::new()),
    };

    let mut bindings = HostBindings::from_memory(&host);
    if cli.online_names {
        let names = ProfileNameService::new(storage.clone(), config.storage_keys.owner_names.clone())?;
        bindings = bindings.with_owner_names(Arc::new(names));
    }
    let orchestrator = SyncOrchestrator::new(config, bindings, storage);

    if cli.dry_run {
        println!("🔍 Dry-run mode - planning owner collections...");
        println!("   Fixture: {:?}", cli.fixture);
        println!();

        let plans = orchestrator.dry_run().await?;
        if plans.is_empty() {
            println!("✅ No shared owners found!");
            return Ok(());
        }

        println!("📝 Planned changes:");
        for plan in &plans {
            let (icon, action) = match &plan.action {
                CollectionAction::Create => ("➕", "CREATE".to_string()),
                CollectionAction::Rename { from, .. } => ("🔄", format!("RENAME from \"{from}\"")),
                CollectionAction::Keep { .. } => ("✅", "KEEP".to_string()),
            };
            println!(
                "   {} {} \"{}\" - {} (+{} / -{})",
                icon,
                plan.owner_id,
                plan.desired_name,
                action,
                plan.diff.to_add.len(),
                plan.diff.to_remove.len()
            );
        }
        return Ok(());
    }

    println!("🚀 Starting reconciliation...");
    println!("   Fixture: {:?}", cli.fixture);
    if let Some(state) = &cli.state {
        println!("   State: {state:?}");
    }
    println!();

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Reconciling...");

    let report = match orchestrator.trigger(Trigger::Manual).await {
        RunOutcome::Completed(report) => {
            pb.finish_with_message("✅ Reconciliation complete!");
            report
        }
        RunOutcome::Skipped(reason) => {
            pb.abandon_with_message("⏭️  Reconciliation skipped");
            anyhow::bail!("Run skipped: {reason:?}");
        }
        RunOutcome::Failed(e) => {
            pb.abandon_with_message("❌ Reconciliation failed!");
            eprintln!("❌ Error: {e}");
            std::process::exit(1);
        }
    };

    println!();
    println!("📊 Results:");
    let mut failures = 0;
    for (owner_id, step) in &report.owners {
        match step {
            StepResult::Done(outcome) => {
                let renamed = outcome
                    .renamed
                    .as_ref()
                    .map(|m| format!(", renamed ({m:?})"))
                    .unwrap_or_default();
                println!(
                    "   {} \"{}\"{}{} (+{} / -{})",
                    owner_id,
                    outcome.collection_name,
                    if outcome.created { ", created" } else { "" },
                    renamed,
                    outcome.added,
                    outcome.removed
                );
            }
            StepResult::Skipped(reason) => println!("   {owner_id} skipped: {reason}"),
            StepResult::Failed(message) => {
                failures += 1;
                eprintln!("   ⚠️  {owner_id}: {message}");
            }
        }
    }
    if let Some(StepResult::Failed(message)) = &report.remote_names {
        eprintln!("   ⚠️  Owner names unavailable: {message}");
    }

    let updated = serde_json::to_string_pretty(&host.to_fixture())?;
    std::fs::write(&cli.fixture, updated).with_context(|| format!("Failed to write fixture {:?}", cli.fixture))?;
    println!("💾 Host state written to {:?}", cli.fixture);

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
