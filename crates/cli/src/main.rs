//! svnmerge command-line tool.
//!
//! One-shot operations against the svnmerge database and repositories:
//! project and branch management, rebase / integrate, build records,
//! integration status, change-log annotation, task logs, fingerprint
//! pruning and the audit log.

mod project;
mod reconcile;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use svnmerge_core::config::AppConfig;
use svnmerge_core::db::Database;
use svnmerge_core::models::AuditEntry;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// svnmerge command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "svnmerge",
    version,
    about = "Rebase and integrate Subversion feature branches"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "/etc/svnmerge/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./svnmerge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Manage the project registry.
    Project {
        #[command(subcommand)]
        action: project::ProjectAction,
    },

    /// Create, attach and inspect feature branches.
    Branch {
        #[command(subcommand)]
        action: project::BranchAction,
    },

    /// Record builds by hand.
    Build {
        #[command(subcommand)]
        action: reconcile::BuildAction,
    },

    /// Merge upstream changes into a feature branch.
    Rebase {
        /// Branch project name.
        project: String,

        /// Upstream revision to rebase to (HEAD by default).
        #[arg(long, conflicts_with = "permalink")]
        revision: Option<i64>,

        /// Upstream permalink to rebase to: lastBuild, lastSuccessfulBuild,
        /// lastIntegratedBuild.
        #[arg(long)]
        permalink: Option<String>,
    },

    /// Integrate a feature branch build into its upstream.
    Integrate {
        /// Branch project name.
        project: String,

        /// Build number (last successful build by default).
        #[arg(long)]
        build: Option<i64>,
    },

    /// Integration status of one branch, or of every branch.
    Status {
        project: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Change log of a project with integration commits traced to the
    /// branch builds that produced them.
    Changelog {
        project: String,

        #[arg(long, default_value = "1")]
        from: i64,

        #[arg(long)]
        to: Option<i64>,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// First upstream build containing a branch build's integration.
    Provenance {
        /// Branch project name.
        project: String,

        /// Branch build number.
        build: i64,
    },

    /// Print the task log of a branch.
    Log {
        project: String,

        /// rebase or integrate.
        #[arg(default_value = "integrate")]
        kind: String,
    },

    /// Drop provenance fingerprints older than a cut-off.
    Prune {
        /// Keep fingerprints created within this many days.
        #[arg(long, default_value = "365")]
        days: i64,
    },

    /// Show recent audit log entries.
    Audit {
        /// Restrict to one project.
        #[arg(long)]
        project: Option<String>,

        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Init { output } => return cmd_init(output),
        Commands::Validate => return cmd_validate(&cli.config).await,
        _ => {}
    }

    let config = load_config(&cli.config)?;
    let db = open_database(&config)?;

    match cli.command {
        Commands::Project { action } => project::run_project(&db, action),
        Commands::Branch { action } => project::run_branch(&config, db, action).await,
        Commands::Build { action } => reconcile::run_build(&config, db, action).await,
        Commands::Rebase {
            project,
            revision,
            permalink,
        } => reconcile::cmd_rebase(&config, db, &project, revision, permalink.as_deref()).await,
        Commands::Integrate { project, build } => {
            reconcile::cmd_integrate(&config, db, &project, build).await
        }
        Commands::Status { project, json } => {
            reconcile::cmd_status(&config, db, project.as_deref(), json)
        }
        Commands::Changelog {
            project,
            from,
            to,
            json,
        } => reconcile::cmd_changelog(&config, db, &project, from, to, json).await,
        Commands::Provenance { project, build } => {
            reconcile::cmd_provenance(&config, db, &project, build)
        }
        Commands::Log { project, kind } => reconcile::cmd_log(&config, &db, &project, &kind),
        Commands::Prune { days } => cmd_prune(&db, days),
        Commands::Audit { project, limit } => cmd_audit(&db, project.as_deref(), limit),
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path).context("failed to load configuration file")
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let db_path = config.daemon.database_path();
    Database::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"# svnmerge configuration
# Projects and branches are managed with `svnmerge project` / `svnmerge branch`.

[daemon]
poll_interval_secs = 60
log_level = "info"
data_dir = "/var/lib/svnmerge"
# log_dir = "/var/log/svnmerge"

[svn]
binary = "svn"
# username = "svnmerge"
# password_env = "SVNMERGE_SVN_PASSWORD"

[scheduler]
max_concurrent_tasks = 2

[merge]
new_branch_message = "Created a feature branch from svnmerge"
auto_integrate = false

[environment]
# REPO = "https://svn.example.com/repos/product"
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!("{}", style::success(&format!("Default configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Edit the data directory and svn credentials");
    println!("  2. Validate with: svnmerge validate --config {}", output.display());
    println!(
        "  3. Register the mainline: svnmerge project add trunk <url> --integratable --config {}",
        output.display()
    );
    println!("  4. Start the daemon: svnmerge-daemon --config {}", output.display());

    Ok(())
}

async fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    if let Err(e) = config.resolve_env_vars() {
        println!("  [FAIL] {}", e);
        anyhow::bail!("configuration validation failed");
    }
    println!("  [OK] Environment variable references resolved");

    if let Err(e) = config.validate() {
        println!("  [FAIL] Validation error: {}", e);
        anyhow::bail!("configuration validation failed");
    }
    println!("  [OK] All fields are valid");

    let svn = svnmerge_core::svn::SvnClient::from_config(&config.svn);
    match svn.version().await {
        Ok(version) => println!("  [OK] svn {} found", version),
        Err(e) => println!("  [WARN] {}", e),
    }

    println!();
    println!("Configuration summary:");
    println!("  svn binary    : {}", config.svn.binary);
    println!(
        "  svn user      : {}",
        config.svn.username.as_deref().unwrap_or("(anonymous)")
    );
    println!(
        "  svn password  : {}",
        if config.svn.password.is_some() { "set" } else { "not set" }
    );
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Task slots    : {}", config.scheduler.max_concurrent_tasks);
    println!("  Data directory: {}", config.daemon.data_dir.display());
    println!("  Variables     : {}", config.environment.len());
    println!();
    println!("{}", style::success("Configuration is valid."));

    Ok(())
}

fn cmd_prune(db: &Database, days: i64) -> Result<()> {
    if days < 0 {
        anyhow::bail!("--days must not be negative");
    }
    let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
    let removed = db
        .prune_fingerprints(cutoff)
        .context("failed to prune fingerprints")?;
    db.insert_audit_entry(&AuditEntry::success(
        "fingerprints_pruned",
        &format!("{} older than {} days", removed, days),
    ))?;
    println!(
        "{}",
        style::success(&format!("Removed {} fingerprint(s) older than {} days", removed, days))
    );
    Ok(())
}

fn cmd_audit(db: &Database, project: Option<&str>, limit: u32) -> Result<()> {
    let project_id = match project {
        Some(name) => Some(
            db.get_project_by_name(name)
                .context("database error")?
                .ok_or_else(|| anyhow::anyhow!("project '{}' not found", name))?
                .id,
        ),
        None => None,
    };
    let entries = db
        .list_audit_log(project_id.as_deref(), limit)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    println!("{:<26} {:<16} {:<4} DETAILS", "TIMESTAMP", "ACTION", "OK");
    println!("{}", "-".repeat(90));

    for entry in &entries {
        println!(
            "{:<26} {:<16} {:<4} {}",
            truncate(&entry.created_at, 25),
            entry.action,
            if entry.success { "yes" } else { "no" },
            truncate(entry.details.as_deref().unwrap_or(""), 60),
        );
    }

    println!();
    println!("{}", style::dim(&format!("{} entries shown", entries.len())));

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
