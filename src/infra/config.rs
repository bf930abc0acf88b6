use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::{AppContext, InitArgs};

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Ordered candidate directories holding vhost files. Directories that
    /// do not exist are skipped; files found in more than one are patched
    /// once (deduplicated by real path).
    pub site_dirs: Vec<PathBuf>,

    /// Directory for generated snippet files (rate-limit zones, gzip).
    pub conf_dir: PathBuf,

    /// Main server config, consulted before writing the gzip snippet so a
    /// distro-enabled `gzip on;` is never duplicated.
    pub nginx_conf: PathBuf,

    /// fail2ban drop-in directories for the request-limit jail.
    pub fail2ban_filter_dir: PathBuf,
    pub fail2ban_jail_dir: PathBuf,

    /// Where pre-write backups land. Never a directory the server itself
    /// includes, or backups would be loaded as vhosts.
    pub backup_dir: PathBuf,

    /// Rate-limit zone settings
    pub zones: ZonesConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ZonesConfig {
    pub api_zone: String,
    pub auth_zone: String,
    pub conn_zone: String,
    pub api_rate: String,
    pub auth_rate: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_dirs: vec![
                PathBuf::from("/etc/nginx/sites-available"),
                PathBuf::from("/etc/nginx/sites-enabled"),
            ],
            conf_dir: PathBuf::from("/etc/nginx/conf.d"),
            nginx_conf: PathBuf::from("/etc/nginx/nginx.conf"),
            fail2ban_filter_dir: PathBuf::from("/etc/fail2ban/filter.d"),
            fail2ban_jail_dir: PathBuf::from("/etc/fail2ban/jail.d"),
            backup_dir: PathBuf::from("/etc/nginx/backup"),
            zones: ZonesConfig {
                api_zone: "vhp_api_per_ip".to_string(),
                auth_zone: "vhp_auth_per_ip".to_string(),
                conn_zone: "vhp_conn_per_ip".to_string(),
                api_rate: "10r/s".to_string(),
                auth_rate: "2r/s".to_string(),
            },
        }
    }
}

pub fn load_config() -> Result<Config> {
    // Defaults first, so files and env only need to override what differs.
    let defaults = toml::to_string(&Config::default()).context("serialize default config")?;
    let mut builder = config::Config::builder()
        .add_source(config::File::from_str(&defaults, config::FileFormat::Toml));

    // Load from config files in priority order
    let config_paths = ["vhostpatch.toml", ".vhostpatch.toml"];

    for path in &config_paths {
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
            break;
        }
    }

    // Add environment variables with VHOSTPATCH_ prefix
    builder = builder.add_source(config::Environment::with_prefix("VHOSTPATCH").separator("__"));

    let cfg = builder.build().context("Failed to load configuration")?;
    cfg.try_deserialize().context("Failed to parse configuration")
}

pub fn init(args: InitArgs, ctx: &AppContext) -> Result<()> {
    let config_path = args.path.join("vhostpatch.toml");

    if config_path.exists() && !args.force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;

    if !ctx.quiet {
        println!("Created config file at {}", config_path.display());
    }
    Ok(())
}
