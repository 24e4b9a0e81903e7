//! Terrace CLI entrypoint.
//!
//! This is the main entrypoint for the terrace command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use terrace::cancel::CancelToken;
use terrace::cli::{Cli, Commands, MessageLevel, OutputFormatter, StateCommands};
use terrace::config::{
    ConfigParser, ConfigValidator, EngineConfig, ProviderKind, StateBackend, find_config_file,
};
use terrace::drift::DriftDetector;
use terrace::error::{ConfigError, Result};
use terrace::graph::ResourceGraph;
use terrace::pipeline::{
    DriftSchedule, FileGraphLoader, FileWatcher, JsonLinesSink, PipelineMachine, ReportSink,
    RunReport, TracingSink,
};
use terrace::planner::{PlanExecutor, RunContext};
use terrace::provider::{HttpProvider, InMemoryProvider, Provider, StateObserver};
use terrace::reconciler::Converger;
use terrace::state::{
    LocalStateStore, LockHeartbeat, LockManager, S3StateStore, StateStore, generate_holder_id,
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);

    match &cli.command {
        Commands::Validate { warnings } => cmd_validate(&cli, *warnings, formatter),
        Commands::Plan { refresh, detailed } => cmd_plan(&cli, *refresh, *detailed, formatter).await,
        Commands::Apply { yes, refresh } => cmd_apply(&cli, *yes, *refresh, formatter).await,
        Commands::Drift { detailed_exitcode } => {
            cmd_drift(&cli, *detailed_exitcode, formatter).await
        }
        Commands::Watch { no_drift } => cmd_watch(&cli, *no_drift, formatter).await,
        Commands::State { command } => cmd_state(&cli, command, formatter).await,
    }
}

/// Validate configuration and the desired graph.
fn cmd_validate(cli: &Cli, show_warnings: bool, formatter: OutputFormatter) -> Result<ExitCode> {
    let (config, parser, config_file) = load_config(cli)?;
    info!("Validating configuration: {}", config_file.display());

    let result = ConfigValidator::new().check(&config);

    let mut resources = 0;
    if result.is_valid() {
        let graph = parser.load_graph(graph_path(cli, &config, &parser))?;
        config.schema.registry().validate_graph(&graph)?;
        resources = graph.len();
    }

    println!("{}", formatter.format_validation(&result, resources, show_warnings));

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the convergence plan.
async fn cmd_plan(
    cli: &Cli,
    refresh: bool,
    detailed: bool,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::load(cli).await?;
    let converger = workspace.converger()?;
    let graph = workspace.parser.load_graph(&workspace.graph_path)?;

    let refresh = refresh || workspace.config.pipeline.refresh;
    let plan = converger.plan(&graph, refresh, &CancelToken::new()).await?;

    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(ExitCode::SUCCESS)
}

/// Apply the convergence plan under the state lock.
async fn cmd_apply(
    cli: &Cli,
    auto_approve: bool,
    refresh: bool,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::load(cli).await?;
    let converger = workspace.converger()?;
    let locks = workspace.lock_manager();
    let graph = workspace.parser.load_graph(&workspace.graph_path)?;
    let refresh = refresh || workspace.config.pipeline.refresh;

    let cancel = CancelToken::new();
    cancel_on_interrupt(cancel.clone());

    let holder = generate_holder_id();
    let lock = locks
        .acquire(&holder, workspace.config.lock.wait_timeout(), &cancel)
        .await?;
    let heartbeat = locks.start_heartbeat(lock);

    let outcome = apply_locked(
        &converger,
        &graph,
        refresh,
        auto_approve,
        &heartbeat,
        &cancel,
        formatter,
    )
    .await;

    let lost = heartbeat.is_lost();
    let lock = heartbeat.stop().await;
    if lost {
        warn!("State lock {} was lost during the apply", lock.lock_id);
    } else if let Err(e) = locks.release(&lock).await {
        warn!("Failed to release state lock {}: {}", lock.lock_id, e);
    }

    outcome
}

/// Plans and applies while the state lock is held.
async fn apply_locked(
    converger: &Converger,
    graph: &ResourceGraph,
    refresh: bool,
    auto_approve: bool,
    heartbeat: &LockHeartbeat,
    cancel: &CancelToken,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let plan = converger.plan(graph, refresh, cancel).await?;
    println!("{}", formatter.format_plan(&plan, false));

    if !plan.has_changes() {
        return Ok(ExitCode::SUCCESS);
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let ctx = RunContext::new(run_id(), cancel.clone()).with_lock(heartbeat.current());
    let report = converger.apply(plan, &ctx).await;
    println!("{}", formatter.format_execution(&report));

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Check for drift.
async fn cmd_drift(
    cli: &Cli,
    detailed_exitcode: bool,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::load(cli).await?;
    let detector = DriftDetector::new(workspace.converger()?);
    let graph = workspace.parser.load_graph(&workspace.graph_path)?;

    let cancel = CancelToken::new();
    cancel_on_interrupt(cancel.clone());
    let report = detector.detect(&graph, &cancel).await?;

    println!("{}", formatter.format_drift(&report));

    Ok(if detailed_exitcode && report.has_drift {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

/// Run the pipeline until interrupted.
async fn cmd_watch(cli: &Cli, no_drift: bool, formatter: OutputFormatter) -> Result<ExitCode> {
    let workspace = Workspace::load(cli).await?;
    let config = &workspace.config;

    let mut settings = config.pipeline_settings(generate_holder_id());
    settings.desired_graph_ref = workspace.graph_path.display().to_string();

    let report_path = config.pipeline.report_path.as_ref().map_or_else(
        JsonLinesSink::default_path,
        |path| Some(workspace.parser.resolve(path)),
    );

    let mut machine = PipelineMachine::new(
        workspace.converger()?,
        workspace.lock_manager(),
        Arc::new(FileGraphLoader::new()),
        settings,
    )
    .with_sink(Arc::new(TracingSink))
    .with_sink(Arc::new(ConsoleSink { formatter }));
    if let Some(path) = report_path {
        info!("Writing run reports to {}", path.display());
        machine = machine.with_sink(Arc::new(JsonLinesSink::new(path)));
    }

    let shutdown = CancelToken::new();
    let (sender, receiver) = mpsc::channel(16);

    let mut tasks = vec![
        FileWatcher::new(&workspace.graph_path, config.pipeline.watch_interval())
            .spawn(sender.clone(), shutdown.clone()),
    ];
    match config.pipeline.drift_interval() {
        Some(interval) if !no_drift => {
            info!("Checking drift every {interval:?} ({})", config.pipeline.drift_policy);
            tasks.push(DriftSchedule::new(interval).spawn(sender.clone(), shutdown.clone()));
        }
        _ => debug!("Scheduled drift checks disabled"),
    }
    drop(sender);

    let canceller = machine.canceller();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling the current run and shutting down");
            canceller.cancel_current();
            stop.cancel();
        }
    });

    info!("Pipeline started for {}", config.qualified_name());
    machine.run(receiver, shutdown.clone()).await;
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Trigger task ended abnormally: {e}");
        }
    }

    info!("Pipeline stopped after {} runs", machine.history().count());
    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    cli: &Cli,
    command: &StateCommands,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::load(cli).await?;
    let store = &workspace.store;

    match command {
        StateCommands::Show => {
            let lock = store.get_lock_info().await?;
            if let Some(snapshot) = store.load().await? {
                println!("{}", formatter.format_state(&snapshot, lock.as_ref()));
            } else {
                println!("{}", formatter.message(MessageLevel::Warning, "No state found."));
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.clone().unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, workspace.config.lock.ttl()).await?;
            let message = format!("State locked: {} (expires {})", lock.lock_id, lock.expires_at);
            println!("{}", formatter.message(MessageLevel::Success, &message));
        }
        StateCommands::Unlock { lock_id, force } => {
            if *force {
                let message = match store.force_unlock().await? {
                    Some(lock) => format!("State forcefully unlocked (was held by {}).", lock.holder),
                    None => String::from("State was not locked."),
                };
                println!("{}", formatter.message(MessageLevel::Success, &message));
            } else if let Some(id) = lock_id {
                store.release_lock(id).await?;
                println!("{}", formatter.message(MessageLevel::Success, "State unlocked."));
            } else {
                let message = "Please provide --lock-id or use --force";
                println!("{}", formatter.message(MessageLevel::Error, message));
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Prints run reports as the pipeline finishes them.
struct ConsoleSink {
    formatter: OutputFormatter,
}

#[async_trait]
impl ReportSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn emit(&self, report: &RunReport) -> Result<()> {
        println!("{}", self.formatter.format_run(report));
        Ok(())
    }
}

/// Everything a command needs: validated configuration and its state store.
struct Workspace {
    config: EngineConfig,
    parser: ConfigParser,
    graph_path: PathBuf,
    store: Arc<dyn StateStore>,
}

impl Workspace {
    /// Loads and validates the configuration, then opens the state store.
    async fn load(cli: &Cli) -> Result<Self> {
        let (config, parser, config_file) = load_config(cli)?;

        let result = ConfigValidator::new().validate(&config)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }

        let store: Arc<dyn StateStore> = match config.state.backend {
            StateBackend::Local => {
                let path = config.state.path.as_ref().map_or_else(
                    || config_dir(&config_file).join(terrace::state::STATE_DIR),
                    |path| parser.resolve(path),
                );
                Arc::new(LocalStateStore::with_base_dir(path))
            }
            StateBackend::S3 => {
                let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                    ConfigError::validation("S3 bucket not configured", "state.bucket")
                })?;
                let prefix = config.state.prefix.as_deref();
                let region = config.state.region.as_deref();
                Arc::new(S3StateStore::new(bucket, prefix, region).await?)
            }
        };
        debug!("Using {} state backend", store.backend_type());

        let graph_path = graph_path(cli, &config, &parser);
        Ok(Self {
            config,
            parser,
            graph_path,
            store,
        })
    }

    /// Creates the configured provider.
    fn provider(&self) -> Result<Arc<dyn Provider>> {
        let provider = &self.config.provider;
        match provider.kind {
            ProviderKind::Memory => {
                warn!("Using the in-memory provider; resources live only as long as this process");
                Ok(Arc::new(InMemoryProvider::new()))
            }
            ProviderKind::Http => {
                self.parser.validate_required_env(&self.config)?;
                let endpoint = provider.endpoint.as_deref().ok_or_else(|| {
                    ConfigError::validation("Provider endpoint not configured", "provider.endpoint")
                })?;
                Ok(Arc::new(HttpProvider::new(
                    endpoint,
                    provider.token(),
                    provider.timeout(),
                )?))
            }
        }
    }

    /// Wires the provider, executor and observer into a converger.
    fn converger(&self) -> Result<Converger> {
        let provider = self.provider()?;
        let executor_config = &self.config.executor;
        let retry = executor_config.retry.policy();

        let executor = PlanExecutor::new(Arc::clone(&provider), Arc::clone(&self.store))
            .with_retry(retry)
            .with_poll(executor_config.poll.policy())
            .with_max_concurrency(executor_config.max_concurrency)
            .with_checkpoint_each_batch(executor_config.checkpoint_each_batch);

        Ok(Converger::new(
            Arc::clone(&self.store),
            StateObserver::new(provider, retry),
            executor,
            self.config.schema.registry(),
        )
        .with_expected_lineage(self.config.state.expected_lineage.clone()))
    }

    fn lock_manager(&self) -> LockManager {
        LockManager::new(Arc::clone(&self.store))
            .with_ttl(self.config.lock.ttl())
            .with_poll_interval(self.config.lock.poll_interval())
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads `.env` and the configuration file with environment overrides.
fn load_config(cli: &Cli) -> Result<(EngineConfig, ConfigParser, PathBuf)> {
    let config_file = resolve_config_path(cli.config.as_ref())?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, parser, config_file))
}

/// The `--graph` argument, or `pipeline.desired_graph` relative to the config.
fn graph_path(cli: &Cli, config: &EngineConfig, parser: &ConfigParser) -> PathBuf {
    cli.graph
        .clone()
        .unwrap_or_else(|| parser.resolve(&config.pipeline.desired_graph))
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn cancel_on_interrupt(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight operations");
            cancel.cancel();
        }
    });
}

fn run_id() -> String {
    format!("cli-{}", &Uuid::new_v4().simple().to_string()[..8])
}
