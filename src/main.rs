use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use pinroll::config::{expand_tilde, Config};
use pinroll::integration::HttpArchiveSource;
use pinroll::logging::init_logging;
use pinroll::orchestrator::{UpdateError, UpdateOptions, UpdateOutcome, Updater, DEFAULT_CLONE_DEPTH};
use pinroll::process::SystemRunner;
use pinroll::steps::{AgentFailurePolicy, RecoveryConfig, DEFAULT_MAX_AGENT_ATTEMPTS};

#[derive(Parser)]
#[command(name = "pinroll")]
#[command(about = "Roll a vendored upstream dependency pin forward", long_about = None)]
#[command(version)]
struct Cli {
    /// Project checkout whose pin is updated
    #[arg(long, default_value = "~/github/nighthawk")]
    project_dir: PathBuf,

    /// Layout config (default: <project-dir>/.pinroll.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// History depth of the upstream clone
    #[arg(long, default_value_t = DEFAULT_CLONE_DEPTH)]
    clone_depth: u32,

    /// Update branch name (default: update-<upstream>-YYYYMMDD)
    #[arg(long)]
    branch_name: Option<String>,

    /// Don't sync the default branch with upstream first
    #[arg(long)]
    no_sync: bool,

    /// Only try the newest upstream commit
    #[arg(long)]
    skip_bisection: bool,

    /// Shell command of a recovery agent; receives the problem on stdin
    #[arg(long)]
    agent_command: Option<String>,

    /// Agent invocations allowed per integration attempt
    #[arg(long, default_value_t = DEFAULT_MAX_AGENT_ATTEMPTS)]
    max_agent_attempts: u32,

    /// What a failing agent invocation means
    #[arg(long, value_enum, default_value_t = AgentFailurePolicy::CountAttempt)]
    agent_failure: AgentFailurePolicy,

    /// Run commands that may prompt for credentials without waiting for Enter
    #[arg(short, long)]
    yes: bool,

    /// Write a JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn load_config(cli: &Cli, project_dir: &std::path::Path) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load(&expand_tilde(path))?,
        None => Config::load_for_project(project_dir)?,
    };
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<UpdateError>() {
                Some(UpdateError::Remediation(report)) => {
                    eprintln!("{} Manual integration required\n", "✗".yellow().bold());
                    eprintln!("{report}");
                }
                _ => eprintln!("{} {e:#}", "✗".red().bold()),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    which::which("git").context("git was not found on PATH")?;

    let project_dir = std::path::absolute(expand_tilde(&cli.project_dir))
        .with_context(|| format!("resolving {}", cli.project_dir.display()))?;
    let config = load_config(cli, &project_dir)?;

    let mut options = UpdateOptions::new(&project_dir, &config.upstream);
    if let Some(branch) = &cli.branch_name {
        options.branch_name = branch.clone();
    }
    options.clone_depth = cli.clone_depth;
    options.sync_default_branch = !cli.no_sync;
    options.skip_bisection = cli.skip_bisection;
    options.recovery = cli.agent_command.as_ref().map(|command| {
        RecoveryConfig::new(command.as_str())
            .with_max_attempts(cli.max_agent_attempts)
            .with_failure_policy(cli.agent_failure)
    });

    let runner = SystemRunner::new(!cli.yes);
    let archives = HttpArchiveSource::new()?;
    let mut updater = Updater::new(&options, &config, &runner, &archives);
    let result = updater.run();

    if let Some(path) = &cli.report {
        let json = serde_json::to_string_pretty(&updater.report())
            .context("Failed to serialize run report")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write run report to {}", path.display()))?;
    }

    match result? {
        UpdateOutcome::UpToDate { pin } => {
            println!(
                "{} {} is up to date at {}",
                "✓".green().bold(),
                config.upstream.name,
                pin
            );
        }
        UpdateOutcome::Pushed { branch, commit } => {
            println!(
                "{} Pushed {} to {}; open a pull request for review",
                "✓".green().bold(),
                branch.bold(),
                config.remotes.push
            );
            println!("  {}", config.upstream.commit_url_for(&commit).dimmed());
        }
    }
    Ok(())
}
