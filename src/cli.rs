use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shared application context for global flags
#[derive(Clone, Debug)]
pub struct AppContext {
    pub quiet: bool,    // global --quiet
    pub no_color: bool, // global --no-color
    pub dry_run: bool,  // global --dry-run
}

#[derive(Parser)]
#[command(name = "vhp")]
#[command(
    about = "Idempotent structural patcher for nginx vhost files: inserts, clones and augments location blocks without disturbing hand-written config"
)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Show what would be done without writing any file
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Patch vhost files for one or more domains
    Patch(PatchArgs),

    /// Print the block outline of a config file
    Scan(ScanArgs),

    /// List recorded pre-write backups
    Backups(BackupsArgs),

    /// Initialize a vhostpatch.toml config file
    Init(InitArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Parser)]
pub struct PatchArgs {
    /// Production domain to patch (www.<domain> is covered automatically)
    #[arg(long)]
    pub domain: String,

    /// Backend port the production vhost proxies to
    #[arg(long, default_value = "3001")]
    pub backend_port: u16,

    /// Uploads directory to serve with long-lived cache headers
    #[arg(long)]
    pub uploads_dir: Option<String>,

    /// Beta/staging domain patched alongside the production one
    #[arg(long)]
    pub beta_domain: Option<String>,

    /// Backend port for the beta vhost
    #[arg(long, default_value = "3002")]
    pub beta_backend_port: u16,

    /// Uploads directory for the beta vhost
    #[arg(long)]
    pub beta_uploads_dir: Option<String>,

    /// Patch only these files instead of scanning the configured
    /// site directories
    #[arg(long = "file")]
    pub files: Vec<PathBuf>,

    /// Skip writing the shared rate-limit zones snippet
    #[arg(long)]
    pub skip_zones: bool,

    /// Skip writing the gzip compression snippet
    #[arg(long)]
    pub skip_gzip: bool,

    /// Also install the fail2ban jail banning repeated limit_req offenders
    #[arg(long)]
    pub with_fail2ban: bool,

    /// Print a unified diff per changed file
    #[arg(long)]
    pub show_diff: bool,

    /// Emit a JSON result instead of human text
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct ScanArgs {
    /// Config file to scan
    pub file: PathBuf,

    /// Emit the outline as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct BackupsArgs {
    /// Backup directory (defaults to the configured one)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Emit JSON instead of human text
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct InitArgs {
    /// Directory to initialize config in
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Parser)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,

    /// Output directory; if omitted and --stdout not set, prints error
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Print completion script to stdout instead of a file
    #[arg(long)]
    pub stdout: bool,
}
