use clap::Parser;
use core_supervisor::capabilities::{CapabilityCheck, GetcapCheck, NoCapabilityCheck};
use core_supervisor::config::SupervisorConfig;
use core_supervisor::data_dir::DataDir;
use core_supervisor::inspect::{ConfigInspector, TunInspector};
use core_supervisor::launcher;
use core_supervisor::signals::SignalHandler;
use core_supervisor::status::StatusFile;
use core_supervisor::{StartOutcome, Supervisor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Runs a proxy core (sing-box) under supervision: refuses to start a second
/// copy, restarts it after crashes, and stops it cleanly on Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "core-supervisor", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "supervisor.toml")]
    config: PathBuf,

    /// Core executable (overrides config)
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Core config file passed to the core (overrides config)
    #[arg(long)]
    core_config: Option<PathBuf>,

    /// Data directory for logs, status and pid files (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the last written status and exit
    #[arg(long)]
    status: bool,

    /// Report whether a core is already running and exit
    #[arg(long)]
    check: bool,

    /// Kill a core that is already running instead of refusing to start
    #[arg(long)]
    kill_existing: bool,

    /// Debug logging (discovery, timers, restart decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_env_filter(filter)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match SupervisorConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    apply_overrides(&mut config, &cli);

    if cli.status {
        return print_status(&config);
    }

    if cli.dry_run {
        print_plan(&config);
        return ExitCode::SUCCESS;
    }

    let grace = config.shutdown.graceful_timeout();
    let supervisor = Supervisor::new(config);

    if cli.check {
        match supervisor.check_running_at_startup().await {
            Some(found) => println!("core running (pid {})", found.pid),
            None => println!("core not running"),
        }
        return ExitCode::SUCCESS;
    }

    run(supervisor, grace, cli.kill_existing).await
}

fn apply_overrides(config: &mut SupervisorConfig, cli: &Cli) {
    if let Some(executable) = &cli.executable {
        config.core.executable = executable.clone();
    }
    if let Some(core_config) = &cli.core_config {
        config.core.config_file = core_config.clone();
    }
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
}

async fn run(supervisor: Supervisor, grace: Duration, kill_existing: bool) -> ExitCode {
    let mut signals = match SignalHandler::install() {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let mut attempts = 0;
    loop {
        match supervisor.start().await {
            StartOutcome::Started { pid } => {
                tracing::info!(pid, "core running, waiting for a shutdown signal");
                break;
            }
            StartOutcome::AlreadyRunning => break,
            StartOutcome::ForeignInstance { pid } if kill_existing && attempts < 5 => {
                attempts += 1;
                if let Err(e) = supervisor.kill_foreign(pid).await {
                    tracing::error!(pid, error = %e, "failed to kill the running core");
                    return ExitCode::FAILURE;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            StartOutcome::ForeignInstance { pid } => {
                tracing::error!(
                    pid,
                    "another core is already running; stop it or pass --kill-existing"
                );
                return ExitCode::FAILURE;
            }
            StartOutcome::Failed(_) => return ExitCode::FAILURE,
        }
    }

    let signal = signals.recv().await;
    tracing::info!(%signal, "shutdown requested");
    let outcome = supervisor.shutdown().await;
    tracing::debug!(?outcome, "stop issued");

    let running = supervisor.running_state();
    let stopped = tokio::time::timeout(grace + Duration::from_secs(1), async {
        while running.get() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });
    tokio::select! {
        result = stopped => match result {
            Ok(()) => tracing::info!("core stopped"),
            Err(_) => tracing::warn!("core still running at exit"),
        },
        second = signals.recv() => {
            tracing::warn!(signal = %second, "second signal, exiting without waiting for the core");
        }
    }
    ExitCode::SUCCESS
}

fn print_status(config: &SupervisorConfig) -> ExitCode {
    let status_file = StatusFile::new(DataDir::new(&config.storage.data_dir).status());
    match status_file.read() {
        Ok(Some(status)) => {
            println!("phase:       {}", status.phase);
            match status.core_pid {
                Some(pid) => println!("core pid:    {pid}"),
                None => println!("core pid:    -"),
            }
            println!("privileged:  {}", status.privileged);
            println!("restarts:    {}/{}", status.crash_count, status.max_attempts);
            if let (Some(started), Some(uptime)) = (status.started_at, status.uptime_secs()) {
                println!("started:     {} (up {uptime}s)", started.to_rfc3339());
            }
            println!("updated:     {}", status.last_update.to_rfc3339());
            println!("supervisor:  pid {}", status.supervisor_pid);
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("no status file at {}", status_file.path().display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to read status");
            ExitCode::FAILURE
        }
    }
}

fn print_plan(config: &SupervisorConfig) {
    let core = match std::env::current_dir() {
        Ok(cwd) => config.core.anchored(&cwd),
        Err(_) => config.core.clone(),
    };
    let core = &core;
    println!("core-supervisor v{}", env!("CARGO_PKG_VERSION"));
    println!("executable:   {}", core.executable.display());
    println!("image name:   {}", core.image_name());
    println!("core config:  {}", core.config_file.display());
    println!("working dir:  {}", core.resolved_working_dir().display());
    println!("arguments:    {}", core.build_args().join(" "));
    println!("data dir:     {}", config.storage.data_dir.display());
    println!(
        "restarts:     {} (backoff {}s, stable after {}s)",
        config.restart.max_attempts, config.restart.backoff_secs, config.restart.stability_secs
    );
    println!(
        "grace period: {}s",
        config.shutdown.graceful_timeout_secs
    );

    let needs_tun = TunInspector.requires_elevation(&core.config_file);
    let capabilities: Box<dyn CapabilityCheck> = if cfg!(target_os = "linux") {
        Box::new(GetcapCheck)
    } else {
        Box::new(NoCapabilityCheck)
    };
    match launcher::plan_launch(
        config.privileged.mode,
        needs_tun,
        &core.executable,
        capabilities.as_ref(),
    ) {
        Ok(kind) => println!("launch:       {kind:?} (tun: {needs_tun})"),
        Err(e) => println!("launch:       blocked: {e}"),
    }
    println!("Dry run mode, config validated, not running.");
}
