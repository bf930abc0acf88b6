use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vhostpatch::cli::{AppContext, Cli, Commands};
use vhostpatch::core::session::{PatchError, exit_code_for};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Build a context once, pass everywhere
    let ctx = AppContext {
        quiet: cli.quiet,
        no_color: cli.no_color,
        dry_run: cli.dry_run,
    };

    let result = match cli.command {
        Commands::Patch(args) => vhostpatch::core::patch_run(args, &ctx),
        Commands::Scan(args) => vhostpatch::core::scan_run(args, &ctx),
        Commands::Backups(args) => vhostpatch::core::backups_run(args, &ctx),
        Commands::Init(args) => vhostpatch::infra::config::init(args, &ctx),
        Commands::Completions(args) => vhostpatch::completion::run(args, &ctx),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = match e.downcast_ref::<PatchError>() {
                Some(pe) => exit_code_for(pe),
                None => 1,
            };
            ExitCode::from(code as u8)
        }
    }
}
