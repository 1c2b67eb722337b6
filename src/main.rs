//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the `converge` command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use convergence::cli::{Cli, Commands, LogFormat, OutputFormat, OutputFormatter, StateCommands};
use convergence::config::{
    ConfigParser, ConfigValidator, StackConfig, StateBackend, find_config_file,
};
use convergence::error::{ConvergeError, ReconcileError, Result};
use convergence::planner::{CancellationToken, ExecutorOptions, NodeStatus, ProgressEvent};
use convergence::provider::{ProviderContext, ProviderRegistry};
use convergence::reconciler::{ReconciliationResult, Reconciler};
use convergence::state::{LocalStateStore, MemoryStateStore, STATE_DIR, StateStore};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", formatter.error(&e.to_string()));
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// Logs go to stderr so JSON output on stdout stays machine-readable.
fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph => cmd_graph(config, &formatter),
        Commands::Plan { refresh } => cmd_plan(config, refresh, &formatter).await,
        Commands::Apply {
            yes,
            refresh,
            concurrency,
        } => cmd_apply(config, yes, refresh, concurrency, cli.output).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, cli.output).await,
        Commands::Refresh => cmd_refresh(config, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("converge.stack.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let template = include_str!("../templates/converge.stack.yaml");
    std::fs::write(&config_path, template)?;
    eprintln!("Created: {}", config_path.display());

    let ignore_line = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(&ignore_line) {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# converge state\n{ignore_line}")?;
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!("{ignore_line}\n.env\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit converge.stack.yaml with your resources");
    eprintln!("  2. Run 'converge validate' to check the stack");
    eprintln!("  3. Run 'converge plan' to see what will change");
    eprintln!("  4. Run 'converge apply' to converge");

    Ok(())
}

/// Validate the stack file.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, base) = load_config(config_path)?;
    let registry = build_registry(&config, &base)?;

    let result = ConfigValidator::new()
        .with_registry(&registry)
        .check(&config);
    println!("{}", formatter.format_validation(&result, show_warnings));

    match result.errors.first() {
        Some(e) => Err(ConvergeError::Validation(e.clone())),
        None => Ok(()),
    }
}

/// Show resources in dependency order.
fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let graph = ws.reconciler().build_graph()?;
    println!("{}", formatter.format_graph(&graph));
    Ok(())
}

/// Show the plan.
async fn cmd_plan(config_path: Option<&Path>, refresh: bool, formatter: &OutputFormatter) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let plan = ws.reconciler().plan(refresh).await?;
    println!("{}", formatter.format_plan(&plan));
    Ok(())
}

/// Converge recorded state towards the stack file.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    refresh: bool,
    concurrency: Option<usize>,
    output: OutputFormat,
) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let formatter = OutputFormatter::new(output);

    let plan = ws.reconciler().plan(refresh).await?;
    if plan.is_empty() {
        println!("{}", formatter.success("No changes to apply."));
        return Ok(());
    }

    if !formatter.is_json() {
        println!("{}", formatter.format_plan(&plan));
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let mut options = ExecutorOptions::from_engine(&ws.config.engine);
    if let Some(concurrency) = concurrency {
        options.concurrency = concurrency.max(1);
    }

    let result = ws
        .run_with_progress(output, |reconciler| async move {
            reconciler.with_options(options).apply(refresh).await
        })
        .await?;

    println!("{}", formatter.format_reconciliation(&result));
    run_outcome(&result, ws.config.engine.run_timeout_secs)
}

/// Delete every recorded resource.
async fn cmd_destroy(config_path: Option<&Path>, auto_approve: bool, output: OutputFormat) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let formatter = OutputFormatter::new(output);

    let snapshot = ws
        .store
        .load_or_default(&ws.config.stack.name, &ws.config.stack.environment)
        .await?;
    if snapshot.is_empty() {
        println!("{}", formatter.success("Nothing to destroy."));
        return Ok(());
    }

    eprintln!("The following resources will be destroyed:");
    for resource in snapshot.resources.values() {
        eprintln!("  - {} ({})", resource.id, resource.provider_id);
    }
    for resource in &snapshot.pending_deletes {
        eprintln!("  - {} ({}, replaced instance)", resource.id, resource.provider_id);
    }

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destroy cancelled.");
        return Ok(());
    }

    let result = ws
        .run_with_progress(output, |reconciler| async move { reconciler.destroy().await })
        .await?;

    println!("{}", formatter.format_reconciliation(&result));
    run_outcome(&result, ws.config.engine.run_timeout_secs)
}

/// Replace recorded outputs with live ones.
async fn cmd_refresh(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let report = ws.reconciler().refresh().await?;
    println!("{}", formatter.format_refresh(&report));
    Ok(())
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let report = ws.reconciler().check_drift().await?;
    println!("{}", formatter.format_drift(&report));
    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let store = &ws.store;

    match command {
        StateCommands::Show => {
            if let Some(snapshot) = store.load().await? {
                let lock = store.get_lock_info().await?;
                println!("{}", formatter.format_state(&snapshot, lock.as_ref()));
            } else {
                println!("{}", formatter.warning("No state found."));
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            println!("{}", formatter.success(&format!("State locked: {}", lock.lock_id)));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                println!("{}", formatter.success("State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                println!("{}", formatter.success("State unlocked."));
            } else {
                println!("{}", formatter.warning("Please provide --lock-id or use --force"));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a command needs to talk to a stack.
struct Workspace {
    config: StackConfig,
    store: Box<dyn StateStore>,
    registry: ProviderRegistry,
}

impl Workspace {
    /// Loads the stack file and opens its state store and providers.
    fn open(config_path: Option<&Path>) -> Result<Self> {
        let (config, base) = load_config(config_path)?;
        let registry = build_registry(&config, &base)?;

        let store: Box<dyn StateStore> = match config.state.backend {
            StateBackend::Local => {
                let dir = config
                    .state
                    .path
                    .as_ref()
                    .map_or_else(|| base.join(STATE_DIR), |p| base.join(p));
                Box::new(LocalStateStore::with_base_dir(dir))
            }
            StateBackend::Memory => {
                warn!("Using in-memory state; nothing will be persisted");
                Box::new(MemoryStateStore::new())
            }
        };
        debug!("State backend: {}", store.backend_type());

        Ok(Self {
            config,
            store,
            registry,
        })
    }

    fn reconciler(&self) -> Reconciler<'_, Box<dyn StateStore>> {
        Reconciler::new(&self.config, &self.store, &self.registry)
    }

    /// Runs a mutating command with Ctrl-C cancellation and live progress.
    async fn run_with_progress<'w, F, Fut>(
        &'w self,
        output: OutputFormat,
        run: F,
    ) -> Result<ReconciliationResult>
    where
        F: FnOnce(Reconciler<'w, Box<dyn StateStore>>) -> Fut,
        Fut: Future<Output = Result<ReconciliationResult>>,
    {
        let token = CancellationToken::new();
        let signal_token = token.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; finishing in-flight operations");
                signal_token.cancel();
            }
        });

        let (events, receiver) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_events(receiver, output));

        let reconciler = self
            .reconciler()
            .with_cancellation(token)
            .with_events(events);
        let result = run(reconciler).await;

        interrupt.abort();
        if let Err(e) = printer.await {
            debug!("Progress printer stopped: {e}");
        }
        result
    }
}

/// Prints progress events as they arrive.
async fn print_events(mut receiver: mpsc::UnboundedReceiver<ProgressEvent>, output: OutputFormat) {
    let formatter = OutputFormatter::new(output);
    while let Some(event) = receiver.recv().await {
        if !formatter.is_json() {
            eprintln!("{}", formatter.format_event(&event));
        }
    }
}

/// Maps an incomplete run to an error so the process exits non-zero.
fn run_outcome(result: &ReconciliationResult, run_timeout_secs: Option<u64>) -> Result<()> {
    if result.cancelled {
        let completed = result
            .results
            .iter()
            .filter(|r| matches!(r.status, NodeStatus::Done | NodeStatus::Failed))
            .count();
        return Err(ReconcileError::Cancelled { completed }.into());
    }
    if result.timed_out {
        return Err(ReconcileError::RunTimedOut {
            timeout_secs: run_timeout_secs.unwrap_or_default(),
        }
        .into());
    }
    if !result.success {
        return Err(ReconcileError::PartialFailure {
            failed: result.counts.failed,
            skipped: result.counts.skipped,
        }
        .into());
    }
    Ok(())
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Resolves the stack file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads the stack file and returns it with its directory.
fn load_config(config_path: Option<&Path>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading stack from: {}", config_file.display());

    let base = config_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = ConfigParser::new().with_base_path(&base);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, base))
}

/// Builds the provider registry, resolving the local provider's root
/// relative to the stack file.
fn build_registry(config: &StackConfig, base: &Path) -> Result<ProviderRegistry> {
    let mut contexts = config.provider_contexts();
    if !contexts.iter().any(|c| c.name == "local") {
        contexts.push(ProviderContext::new("local"));
    }

    for context in &mut contexts {
        if context.name == "local" {
            let root = context
                .setting_str("root")
                .map_or_else(|| base.join(STATE_DIR).join("local"), |r| base.join(r));
            context.settings.insert(
                String::from("root"),
                serde_json::Value::String(root.display().to_string()),
            );
        }
    }

    ProviderRegistry::from_contexts(contexts)
}
