//! The `patch` command: resolve targets, collect vhost files, run one
//! patch session per file, and persist the results behind a backup.
//!
//! Failure isolation is per file: a structural error in one vhost never
//! blocks the others. The first error is still reported (and drives the
//! exit code) after every file has been attempted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use indexmap::IndexSet;
use itertools::Itertools;
use owo_colors::OwoColorize;
use regex::Regex;
use serde::Serialize;
use similar::TextDiff;
use tracing::{debug, info, warn};

use crate::cli::{AppContext, PatchArgs};
use crate::core::backup::{FsStorage, Storage};
use crate::core::rules::{self, TargetParams};
use crate::core::session::{BlockIdentity, PatchError, PatchSession};
use crate::infra::config::{self, Config, ZonesConfig};
use crate::infra::io;

/// Throwaway names from copy-pasted tutorial config. Patching a vhost
/// that still carries one of these is never what the operator meant.
const PLACEHOLDER_DOMAINS: &[&str] = &["site.ru", "example.com", "domain.com"];

/// One domain's worth of patching: the names that select its server
/// blocks plus the structural parameters fed to the rule catalog.
#[derive(Debug, Clone)]
struct Target {
    names: Vec<String>,
    params: TargetParams,
}

impl Target {
    fn matches(&self, identity: &BlockIdentity) -> bool {
        identity.names.iter().any(|n| self.names.contains(n))
    }
}

#[derive(Debug, Serialize)]
struct FileOutcome {
    path: PathBuf,
    changed: bool,
    matched: usize,
    actions: Vec<String>,
    backup: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    dry_run: bool,
    zones_written: bool,
    gzip_written: bool,
    fail2ban_written: bool,
    files: Vec<FileOutcome>,
}

pub fn run(args: PatchArgs, ctx: &AppContext) -> Result<()> {
    let cfg = config::load_config()?;
    let targets = build_targets(&args, &cfg)?;

    let mut summary = RunSummary {
        dry_run: ctx.dry_run,
        zones_written: false,
        gzip_written: false,
        fail2ban_written: false,
        files: Vec::new(),
    };

    if !args.skip_zones && !ctx.dry_run {
        let path = cfg.conf_dir.join("vhostpatch-rate-limit.conf");
        summary.zones_written = io::create_if_missing(&path, &zones_snippet(&cfg.zones))
            .with_context(|| format!("write zones snippet: {}", path.display()))?;
        if summary.zones_written {
            info!(path = %path.display(), "wrote rate-limit zones snippet");
        }
    }

    if !args.skip_gzip && !ctx.dry_run {
        // A second `gzip on;` makes the server refuse its whole config, so
        // a distro-enabled one means no snippet at all.
        if gzip_already_enabled(&cfg.nginx_conf) {
            debug!(conf = %cfg.nginx_conf.display(), "gzip already enabled; skipping snippet");
        } else {
            let path = cfg.conf_dir.join("vhostpatch-compress.conf");
            summary.gzip_written = io::create_if_missing(&path, &gzip_snippet())
                .with_context(|| format!("write gzip snippet: {}", path.display()))?;
            if summary.gzip_written {
                info!(path = %path.display(), "wrote gzip snippet");
            }
        }
    }

    if args.with_fail2ban && !ctx.dry_run {
        summary.fail2ban_written = write_fail2ban_snippets(&cfg)?;
    }

    let files = if args.files.is_empty() {
        collect_vhost_files(&cfg.site_dirs)?
    } else {
        dedupe_files(args.files.iter().map(|p| expand_path(p)).collect())
    };
    if files.is_empty() {
        bail!("no vhost files found in the configured site directories");
    }

    let storage = FsStorage::new(&cfg.backup_dir);
    let mut first_error: Option<anyhow::Error> = None;

    for path in &files {
        match patch_one_file(path, &targets, &storage, &args, ctx) {
            Ok(o) => summary.files.push(o),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file failed");
                summary.files.push(FileOutcome {
                    path: path.clone(),
                    changed: false,
                    matched: 0,
                    actions: Vec::new(),
                    backup: None,
                    error: Some(e.to_string()),
                });
                first_error.get_or_insert(e);
            }
        }
    }

    let total_matched: usize = summary.files.iter().map(|f| f.matched).sum();

    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        print_summary(&summary, ctx);
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if total_matched == 0 {
        return Err(anyhow::Error::new(PatchError::AnchorNotFound(format!(
            "no server block matched {}",
            targets.iter().flat_map(|t| t.names.iter()).join(", ")
        ))));
    }
    Ok(())
}

/// Resolve CLI arguments into the patch targets, refusing placeholder
/// domains outright. `www.<domain>` is always covered alongside the bare
/// name.
fn build_targets(args: &PatchArgs, cfg: &Config) -> Result<Vec<Target>> {
    for domain in [Some(&args.domain), args.beta_domain.as_ref()]
        .into_iter()
        .flatten()
    {
        if PLACEHOLDER_DOMAINS.contains(&domain.as_str()) {
            bail!("`{domain}` looks like a placeholder domain; pass the real one");
        }
        if domain.trim().is_empty() {
            bail!("empty domain");
        }
    }

    let mut targets = vec![Target {
        names: with_www(&args.domain),
        params: TargetParams {
            upstream: format!("http://127.0.0.1:{}", args.backend_port),
            uploads_alias: args.uploads_dir.as_deref().map(expand_str),
            api_zone: cfg.zones.api_zone.clone(),
            auth_zone: cfg.zones.auth_zone.clone(),
        },
    }];

    if let Some(beta) = &args.beta_domain {
        targets.push(Target {
            names: with_www(beta),
            params: TargetParams {
                upstream: format!("http://127.0.0.1:{}", args.beta_backend_port),
                uploads_alias: args.beta_uploads_dir.as_deref().map(expand_str),
                api_zone: cfg.zones.api_zone.clone(),
                auth_zone: cfg.zones.auth_zone.clone(),
            },
        });
    }
    Ok(targets)
}

/// `~` and `$VAR` expansion for user-supplied paths.
fn expand_str(s: &str) -> String {
    shellexpand::full(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string())
}

fn expand_path(p: &Path) -> PathBuf {
    PathBuf::from(expand_str(&p.to_string_lossy()))
}

fn with_www(domain: &str) -> Vec<String> {
    let domain = domain.trim();
    if let Some(bare) = domain.strip_prefix("www.") {
        vec![bare.to_string(), domain.to_string()]
    } else {
        vec![domain.to_string(), format!("www.{domain}")]
    }
}

/// The shared `limit_req_zone` declarations, written once to conf.d so
/// every patched vhost can reference them.
fn zones_snippet(zones: &ZonesConfig) -> String {
    format!(
        "{marker}: shared rate-limit zones\n\
         limit_req_zone $binary_remote_addr zone={api}:10m rate={api_rate};\n\
         limit_req_zone $binary_remote_addr zone={auth}:10m rate={auth_rate};\n\
         limit_conn_zone $binary_remote_addr zone={conn}:10m;\n",
        marker = rules::MARKER,
        api = zones.api_zone,
        api_rate = zones.api_rate,
        auth = zones.auth_zone,
        auth_rate = zones.auth_rate,
        conn = zones.conn_zone,
    )
}

static GZIP_ON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*gzip\s+on\s*;").unwrap());

/// True when the main server config already switches gzip on. Unreadable
/// or absent config reads as "not enabled".
fn gzip_already_enabled(nginx_conf: &Path) -> bool {
    fs::read_to_string(nginx_conf)
        .map(|raw| GZIP_ON_RE.is_match(&raw))
        .unwrap_or(false)
}

fn gzip_snippet() -> String {
    let mut s = format!("{}: gzip\n", rules::MARKER);
    s.push_str(concat!(
        "gzip on;\n",
        "gzip_vary on;\n",
        "gzip_proxied any;\n",
        "gzip_comp_level 6;\n",
        "gzip_min_length 1024;\n",
        "gzip_types\n",
        "  text/plain\n",
        "  text/css\n",
        "  text/xml\n",
        "  application/json\n",
        "  application/javascript\n",
        "  application/xml\n",
        "  application/xml+rss\n",
        "  image/svg+xml;\n",
    ));
    s
}

/// fail2ban filter + jail banning IPs that keep tripping `limit_req`.
/// Existing files are never overwritten.
fn write_fail2ban_snippets(cfg: &Config) -> Result<bool> {
    let filter_path = cfg.fail2ban_filter_dir.join("nginx-req-limit.conf");
    let filter_content = format!(
        "{marker}: fail2ban filter\n\
         [Definition]\n\
         failregex = ^\\s*\\d{{4}}/\\d{{2}}/\\d{{2}} \\d{{2}}:\\d{{2}}:\\d{{2}} \\[error\\] .* limiting requests, excess:.* by zone \".*\", client: <HOST>, server: .*\n\
         ignoreregex =\n",
        marker = rules::MARKER,
    );

    let jail_path = cfg.fail2ban_jail_dir.join("nginx-req-limit.local");
    let jail_content = format!(
        "{marker}: fail2ban jail\n\
         [nginx-req-limit]\n\
         enabled = true\n\
         filter = nginx-req-limit\n\
         logpath = /var/log/nginx/error.log\n\
         findtime = 10m\n\
         maxretry = 30\n\
         bantime = 1h\n",
        marker = rules::MARKER,
    );

    let created_filter = io::create_if_missing(&filter_path, &filter_content)
        .with_context(|| format!("write fail2ban filter: {}", filter_path.display()))?;
    let created_jail = io::create_if_missing(&jail_path, &jail_content)
        .with_context(|| format!("write fail2ban jail: {}", jail_path.display()))?;
    if created_filter || created_jail {
        info!(filter = %filter_path.display(), jail = %jail_path.display(), "wrote fail2ban snippets");
    }
    Ok(created_filter || created_jail)
}

/// Regular files from the candidate directories, in directory order,
/// deduplicated by resolved path so sites-available/sites-enabled
/// symlink pairs are patched once.
fn collect_vhost_files(site_dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for dir in site_dirs {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => continue, // absent candidate dirs are fine
        };
        let mut batch: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read dir {}", dir.display()))?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.ends_with(".bak") {
                continue;
            }
            if path.is_file() {
                batch.push(path);
            }
        }
        batch.sort();
        out.extend(batch);
    }
    Ok(dedupe_files(out))
}

fn dedupe_files(files: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen: IndexSet<PathBuf> = IndexSet::new();
    files
        .into_iter()
        .filter(|p| {
            let key = fs::canonicalize(p).unwrap_or_else(|_| p.clone());
            seen.insert(key)
        })
        .collect()
}

fn patch_one_file(
    path: &Path,
    targets: &[Target],
    storage: &dyn Storage,
    args: &PatchArgs,
    ctx: &AppContext,
) -> Result<FileOutcome> {
    let original = io::read_text(path)?;

    let mut session = PatchSession::new(original.clone());
    session
        .run(
            &|identity| targets.iter().any(|t| t.matches(identity)),
            &|identity| {
                let matched: Vec<&Target> =
                    targets.iter().filter(|t| t.matches(identity)).collect();
                match matched.as_slice() {
                    [one] => Some(rules::vhost_rules(&one.params)),
                    [] => None,
                    _ => {
                        warn!(
                            names = %identity.names.join(" "),
                            "server block matches more than one target; skipping it"
                        );
                        None
                    }
                }
            },
        )
        .map_err(anyhow::Error::new)?;

    let (patched, report) = session.into_parts();
    let mut outcome = FileOutcome {
        path: path.to_path_buf(),
        changed: report.changed,
        matched: report.matched,
        actions: report.actions,
        backup: None,
        error: None,
    };

    if !report.changed {
        return Ok(outcome);
    }

    if args.show_diff || ctx.dry_run {
        print_diff(path, &original, &patched, ctx);
    }
    if ctx.dry_run {
        return Ok(outcome);
    }

    // No backup, no write.
    outcome.backup = storage
        .backup(path)
        .with_context(|| format!("backup failed for {}", path.display()))?;
    storage
        .write(path, &patched)
        .with_context(|| format!("write failed for {}", path.display()))?;
    info!(path = %path.display(), "patched");
    Ok(outcome)
}

fn print_diff(path: &Path, before: &str, after: &str, ctx: &AppContext) {
    if ctx.quiet {
        return;
    }
    let diff = TextDiff::from_lines(before, after);
    let name = path.display().to_string();
    print!(
        "{}",
        diff.unified_diff()
            .context_radius(3)
            .header(&name, &format!("{name} (patched)"))
    );
}

fn print_summary(summary: &RunSummary, ctx: &AppContext) {
    if ctx.quiet {
        return;
    }
    for file in &summary.files {
        let path = file.path.display();
        if let Some(err) = &file.error {
            if ctx.no_color {
                println!("FAIL {path}: {err}");
            } else {
                println!("{} {path}: {err}", "FAIL".red().bold());
            }
        } else if file.changed {
            let verb = if summary.dry_run { "would patch" } else { "patched" };
            if ctx.no_color {
                println!("{verb} {path} ({} actions)", file.actions.len());
            } else {
                println!(
                    "{} {path} ({} actions)",
                    verb.green().bold(),
                    file.actions.len()
                );
            }
            for action in &file.actions {
                println!("    {action}");
            }
        } else if file.matched > 0 {
            println!("NOOP {path}: already patched, nothing to do");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn www_is_added_and_never_doubled() {
        assert_eq!(with_www("memtest.dev"), vec!["memtest.dev", "www.memtest.dev"]);
        assert_eq!(with_www("www.memtest.dev"), vec!["memtest.dev", "www.memtest.dev"]);
    }

    #[test]
    fn placeholder_domains_are_refused() {
        let args = PatchArgs {
            domain: "example.com".to_string(),
            backend_port: 3001,
            uploads_dir: None,
            beta_domain: None,
            beta_backend_port: 3002,
            beta_uploads_dir: None,
            files: Vec::new(),
            skip_zones: true,
            skip_gzip: true,
            with_fail2ban: false,
            show_diff: false,
            json: false,
        };
        let err = build_targets(&args, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn gzip_check_matches_distro_enabled_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let conf = tmp.path().join("nginx.conf");

        assert!(!gzip_already_enabled(&conf)); // absent

        fs::write(&conf, "http {\n    # gzip on;\n    gzip_static on;\n}\n").unwrap();
        assert!(!gzip_already_enabled(&conf));

        fs::write(&conf, "http {\n    gzip  on ;\n}\n").unwrap();
        assert!(gzip_already_enabled(&conf));
    }

    #[test]
    fn gzip_snippet_enables_compression_for_text_types() {
        let snippet = gzip_snippet();
        assert!(snippet.starts_with(rules::MARKER));
        assert!(snippet.contains("gzip on;\n"));
        assert!(snippet.contains("application/json"));
        assert!(snippet.ends_with("image/svg+xml;\n"));
    }

    #[test]
    fn fail2ban_snippets_are_created_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config {
            fail2ban_filter_dir: tmp.path().join("filter.d"),
            fail2ban_jail_dir: tmp.path().join("jail.d"),
            ..Config::default()
        };

        assert!(write_fail2ban_snippets(&cfg).unwrap());
        let jail = fs::read_to_string(cfg.fail2ban_jail_dir.join("nginx-req-limit.local")).unwrap();
        assert!(jail.contains("filter = nginx-req-limit"));

        // Existing files are kept, not rewritten.
        assert!(!write_fail2ban_snippets(&cfg).unwrap());
    }

    #[test]
    fn zones_snippet_names_all_three_zones() {
        let snippet = zones_snippet(&Config::default().zones);
        assert!(snippet.contains("zone=vhp_api_per_ip:10m rate=10r/s;"));
        assert!(snippet.contains("zone=vhp_auth_per_ip:10m rate=2r/s;"));
        assert!(snippet.contains("limit_conn_zone $binary_remote_addr zone=vhp_conn_per_ip:10m;"));
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("site");
        fs::write(&a, "x").unwrap();

        let files = dedupe_files(vec![a.clone(), a.clone(), tmp.path().join("other")]);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], a);
    }
}
