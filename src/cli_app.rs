//! Top-level CLI definition and dispatch.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use ransom_sentinel::core::config::Config;
use ransom_sentinel::core::errors::Result;
use ransom_sentinel::daemon::loop_main::SentinelDaemon;
use ransom_sentinel::daemon::orchestrator::DefenseOrchestrator;
use ransom_sentinel::daemon::scorer::HeuristicScorer;

/// Ransom Sentinel — preemptive ransomware defense engine.
#[derive(Debug, Parser)]
#[command(
    name = "rsn",
    author,
    version,
    about = "Ransom Sentinel - Preemptive Ransomware Defense",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the monitoring service.
    Run(RunArgs),
    /// Validate configuration and print the effective values.
    CheckConfig,
    /// Run one manual backup pass and print the result.
    Backup,
    /// Reconcile a pending write journal back into the protected store.
    Reconcile,
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Stay in the foreground (the default; service managers handle
    /// backgrounding).
    #[arg(long, default_value_t = true)]
    foreground: bool,
}

/// Dispatch the parsed CLI.
pub fn run(cli: &Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Command::Run(args) => {
            if !args.foreground {
                eprintln!("rsn: backgrounding is left to the service manager; running in foreground");
            }
            let mut daemon = SentinelDaemon::init(config, Box::new(HeuristicScorer))?;
            daemon.run()
        }
        Command::CheckConfig => {
            let rendered = toml::to_string_pretty(&config).map_err(|e| {
                ransom_sentinel::core::errors::DefenseError::Serialization {
                    context: "toml",
                    details: e.to_string(),
                }
            })?;
            println!("# effective configuration ({})", config.paths.config_file.display());
            println!("{rendered}");
            Ok(())
        }
        Command::Backup => {
            let mut orchestrator = DefenseOrchestrator::new(&config)?;
            let totals = orchestrator.force_backup()?;
            println!(
                "backup pass complete: {} files, {} bytes ({} skipped)",
                totals.files_copied, totals.bytes_copied, totals.files_skipped
            );
            Ok(())
        }
        Command::Reconcile => {
            let mut orchestrator = DefenseOrchestrator::new(&config)?;
            let pending = orchestrator.write_manager().pending_count();
            match orchestrator.reconcile() {
                Some(report) => {
                    println!(
                        "reconciled {pending} pending writes: {} applied, {} rejected, {} skipped",
                        report.applied, report.rejected, report.skipped
                    );
                    Ok(())
                }
                None => Err(ransom_sentinel::core::errors::DefenseError::Runtime {
                    details: "reconciliation failed; journal retained for retry".to_string(),
                }),
            }
        }
    }
}
