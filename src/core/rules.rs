//! The vhost rule catalog.
//!
//! Data-driven rules over the core engine, reproducing the managed nginx
//! surface: blocked internal routes, backend proxy locations, the `/me`
//! prefix clone, socket.io upgrades, uploads caching, and per-location
//! rate limits. Every rule is idempotent; the catalog can be applied to
//! the same block any number of times.

use crate::core::augment::{self, Directive};
use crate::core::clone::{self, DirectiveRewrite};
use crate::core::insert;
use crate::core::locate::{self, LocationSelector};
use crate::core::scan::BlockTree;
use crate::core::session::{BlockRule, PatchError, RuleEffect};

/// Marker prefixed to every managed line so operators can tell inserted
/// content from hand-written config.
pub const MARKER: &str = "# vhostpatch-managed";

/// Backend namespaces proxied under their own prefix.
const API_PREFIXES: &[&str] = &[
    "auth",
    "webhooks",
    "public",
    "submissions",
    "channels",
    "wallet",
    "memes",
    "streamer",
    "owner",
    "moderation",
];

/// Namespaces some clients hit without a trailing slash; these get an
/// exact-match location in addition to the prefix one.
const EXACT_ALSO: &[&str] = &["wallet", "memes"];

/// Structural parameters for one target vhost, supplied by the caller as
/// data. The engine knows nothing about what the upstream serves.
#[derive(Debug, Clone)]
pub struct TargetParams {
    /// Proxy target, e.g. `http://127.0.0.1:3001`.
    pub upstream: String,
    /// Uploads directory to alias, when configured for this target.
    pub uploads_alias: Option<String>,
    /// Rate-limit zone for general API traffic.
    pub api_zone: String,
    /// Rate-limit zone for auth endpoints.
    pub auth_zone: String,
}

fn parse_root(block: &str) -> Option<(BlockTree, usize)> {
    let tree = BlockTree::parse(block);
    if !tree.is_balanced() {
        return None;
    }
    let root = *tree.roots().first()?;
    Some((tree, root))
}

/// Indentation for new children of `root`: matches the first existing
/// child, else four spaces.
fn child_indent(block: &str, tree: &BlockTree, root: usize) -> String {
    tree.children(root)
        .first()
        .map(|&c| insert::line_indent(block, tree.node(c).span.start).to_string())
        .unwrap_or_else(|| "    ".to_string())
}

/// Compose and splice a new location block at the planned insertion point.
/// Returns `None` when the parent offers no insertion point (skip).
fn insert_location(
    block: &str,
    tree: &BlockTree,
    root: usize,
    selector: &LocationSelector,
    label: &str,
    body: &[String],
) -> Option<String> {
    let at = insert::insertion_point(block, tree, root)?;
    let indent = child_indent(block, tree, root);

    let mut piece = String::new();
    piece.push('\n');
    piece.push_str(&format!("{indent}{MARKER}: {label}\n"));
    piece.push_str(&format!("{indent}{} {{\n", selector.header()));
    for line in body {
        piece.push_str(&format!("{indent}    {line}\n"));
    }
    piece.push_str(&format!("{indent}}}\n"));

    let mut out = String::with_capacity(block.len() + piece.len());
    out.push_str(&block[..at]);
    out.push_str(&piece);
    out.push_str(&block[at..]);
    Some(out)
}

/// The shared proxy header lines every inserted proxy location carries.
/// Kept minimal so unrelated vhost config is never overridden.
fn proxy_headers() -> Vec<String> {
    vec![
        "proxy_set_header Host $host;".to_string(),
        "proxy_set_header X-Real-IP $remote_addr;".to_string(),
        "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;".to_string(),
        "proxy_set_header X-Forwarded-Proto $scheme;".to_string(),
    ]
}

fn proxy_body(upstream: &str) -> Vec<String> {
    let mut body = vec![format!("proxy_pass {upstream};")];
    body.extend(proxy_headers());
    body
}

/// Insert a location block when no matching header exists.
pub struct EnsureLocation {
    selector: LocationSelector,
    label: String,
    body: Vec<String>,
}

impl EnsureLocation {
    pub fn new(selector: LocationSelector, label: impl Into<String>, body: Vec<String>) -> Self {
        Self {
            selector,
            label: label.into(),
            body,
        }
    }
}

impl BlockRule for EnsureLocation {
    fn name(&self) -> &str {
        "ensure-location"
    }

    fn apply(&self, block: &str) -> Result<RuleEffect, PatchError> {
        let Some((tree, root)) = parse_root(block) else {
            return Ok(RuleEffect::unchanged());
        };
        if !locate::find_children(block, &tree, root, &self.selector).is_empty() {
            return Ok(RuleEffect::unchanged());
        }
        match insert_location(block, &tree, root, &self.selector, &self.label, &self.body) {
            Some(out) => Ok(RuleEffect::changed(
                out,
                format!("insert {}", self.selector.header()),
            )),
            None => Ok(RuleEffect::unchanged()),
        }
    }
}

/// Clone an existing exact-match location into its prefix variant,
/// rewriting only the header and any targeted directives. The clone lands
/// immediately after its source so related blocks stay adjacent.
pub struct ClonePrefixVariant {
    source: LocationSelector,
    target: LocationSelector,
    rewrites: Vec<DirectiveRewrite>,
    /// When set, a missing source is an anchor failure rather than a skip.
    required: bool,
}

impl ClonePrefixVariant {
    pub fn new(
        source: LocationSelector,
        target: LocationSelector,
        rewrites: Vec<DirectiveRewrite>,
    ) -> Self {
        Self {
            source,
            target,
            rewrites,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

impl BlockRule for ClonePrefixVariant {
    fn name(&self) -> &str {
        "clone-prefix-variant"
    }

    fn apply(&self, block: &str) -> Result<RuleEffect, PatchError> {
        let Some((tree, root)) = parse_root(block) else {
            return Ok(RuleEffect::unchanged());
        };
        if !locate::find_children(block, &tree, root, &self.target).is_empty() {
            return Ok(RuleEffect::unchanged());
        }
        let Some(source) = locate::find_unique(block, &tree, root, &self.source)? else {
            if self.required {
                return Err(PatchError::AnchorNotFound(self.source.header()));
            }
            return Ok(RuleEffect::unchanged());
        };

        let cloned = clone::clone_block(block, &tree, source, &self.target.header(), &self.rewrites);
        let end = tree.node(source).span.end;
        let indent = insert::line_indent(block, tree.node(source).span.start);

        let mut out = String::with_capacity(block.len() + cloned.len());
        out.push_str(&block[..end]);
        out.push_str(&format!(
            "\n\n{indent}{MARKER}: clone of {}\n{indent}{cloned}",
            self.source.header()
        ));
        out.push_str(&block[end..]);

        Ok(RuleEffect::changed(
            out,
            format!(
                "clone {} -> {}",
                self.source.header(),
                self.target.header()
            ),
        ))
    }
}

/// Add a `limit_req` directive to every matching location that lacks one.
pub struct EnsureRateLimit {
    selector: LocationSelector,
    zone: String,
    burst: u32,
}

impl EnsureRateLimit {
    pub fn new(selector: LocationSelector, zone: impl Into<String>, burst: u32) -> Self {
        Self {
            selector,
            zone: zone.into(),
            burst,
        }
    }
}

impl BlockRule for EnsureRateLimit {
    fn name(&self) -> &str {
        "ensure-rate-limit"
    }

    fn apply(&self, block: &str) -> Result<RuleEffect, PatchError> {
        let Some((tree, root)) = parse_root(block) else {
            return Ok(RuleEffect::unchanged());
        };
        // Only augment existing locations; inserting them is another
        // rule's job.
        let spans: Vec<_> = locate::find_children(block, &tree, root, &self.selector)
            .into_iter()
            .map(|id| tree.node(id).span)
            .collect();
        if spans.is_empty() {
            return Ok(RuleEffect::unchanged());
        }

        let wanted = [Directive::new(
            "limit_req",
            format!(
                "{MARKER}: rate-limit\nlimit_req zone={} burst={} nodelay;",
                self.zone, self.burst
            ),
        )];

        let mut out = block.to_string();
        let mut effect = RuleEffect::unchanged();
        for span in spans.iter().rev() {
            let (patched, changed) = augment::ensure_directives(span.slice(&out), &wanted);
            if changed {
                out.replace_range(span.start..span.end, &patched);
                effect.actions.push(format!(
                    "rate-limit {} zone={} burst={}",
                    self.selector.header(),
                    self.zone,
                    self.burst
                ));
            }
        }
        if !effect.actions.is_empty() {
            effect.text = Some(out);
        }
        Ok(effect)
    }
}

/// Guarantee an uploads location with caching headers: insert the whole
/// block when missing, or add only the missing cache directives to an
/// existing one.
pub struct EnsureUploadsCache {
    /// Alias directory, normalized to a trailing slash.
    alias_dir: String,
}

impl EnsureUploadsCache {
    pub fn new(alias_dir: impl Into<String>) -> Self {
        let mut alias_dir = alias_dir.into();
        if !alias_dir.ends_with('/') {
            alias_dir.push('/');
        }
        Self { alias_dir }
    }

    fn cache_directives(&self) -> Vec<Directive> {
        vec![
            Directive::new("expires", "expires 30d;"),
            Directive::new(
                "add_header Cache-Control",
                "add_header Cache-Control \"public, max-age=2592000, immutable\" always;",
            ),
            Directive::new(
                "add_header Accept-Ranges",
                "add_header Accept-Ranges \"bytes\" always;",
            ),
            Directive::new("try_files", "try_files $uri =404;"),
        ]
    }
}

impl BlockRule for EnsureUploadsCache {
    fn name(&self) -> &str {
        "ensure-uploads-cache"
    }

    fn apply(&self, block: &str) -> Result<RuleEffect, PatchError> {
        let Some((tree, root)) = parse_root(block) else {
            return Ok(RuleEffect::unchanged());
        };
        let selector = LocationSelector::plain("/uploads/");

        match locate::find_unique(block, &tree, root, &selector)? {
            None => {
                let mut body = vec![format!("alias {};", self.alias_dir)];
                body.extend(
                    self.cache_directives()
                        .into_iter()
                        .map(|d| d.text),
                );
                match insert_location(block, &tree, root, &selector, "uploads cache", &body) {
                    Some(out) => Ok(RuleEffect::changed(out, "insert location /uploads/")),
                    None => Ok(RuleEffect::unchanged()),
                }
            }
            Some(id) => {
                let span = tree.node(id).span;
                let (patched, changed) =
                    augment::ensure_directives(span.slice(block), &self.cache_directives());
                if !changed {
                    return Ok(RuleEffect::unchanged());
                }
                let mut out = block.to_string();
                out.replace_range(span.start..span.end, &patched);
                Ok(RuleEffect::changed(out, "augment location /uploads/ cache"))
            }
        }
    }
}

/// The full managed-surface catalog for one vhost target, in application
/// order. First-match-wins placement is handled by the insertion planner;
/// the order here only controls which anchors later rules can rely on.
pub fn vhost_rules(params: &TargetParams) -> Vec<Box<dyn BlockRule>> {
    let up = &params.upstream;
    let mut rules: Vec<Box<dyn BlockRule>> = Vec::new();

    if let Some(alias) = &params.uploads_alias {
        rules.push(Box::new(EnsureUploadsCache::new(alias.clone())));
    }

    // /internal/* must never be exposed publicly.
    rules.push(Box::new(EnsureLocation::new(
        LocationSelector::prefix("/internal/"),
        "block internal relay",
        vec!["return 404;".to_string()],
    )));

    // Ops checks must reach the backend, not the SPA fallback.
    rules.push(Box::new(EnsureLocation::new(
        LocationSelector::exact("/health"),
        "api proxy",
        proxy_body(up),
    )));

    // `location ^~ /me` would also match `/memes`; the safe shape is the
    // exact block plus a cloned `/me/` prefix block.
    rules.push(Box::new(ClonePrefixVariant::new(
        LocationSelector::exact("/me"),
        LocationSelector::prefix("/me/"),
        Vec::new(),
    )));
    rules.push(Box::new(EnsureLocation::new(
        LocationSelector::exact("/me"),
        "api proxy",
        proxy_body(up),
    )));
    rules.push(Box::new(EnsureLocation::new(
        LocationSelector::prefix("/me/"),
        "api proxy",
        proxy_body(up),
    )));

    for prefix in API_PREFIXES {
        if EXACT_ALSO.contains(prefix) {
            rules.push(Box::new(EnsureLocation::new(
                LocationSelector::exact(&format!("/{prefix}")),
                "api proxy",
                proxy_body(up),
            )));
        }
        rules.push(Box::new(EnsureLocation::new(
            LocationSelector::prefix(&format!("/{prefix}/")),
            "api proxy",
            proxy_body(up),
        )));
    }

    // Overlay credits live on the backend; only that subpath is proxied so
    // the static /overlay/ frontend keeps working.
    rules.push(Box::new(EnsureLocation::new(
        LocationSelector::prefix("/overlay/credits/"),
        "api proxy",
        proxy_body(up),
    )));

    // Socket.IO needs the websocket upgrade headers and long timeouts.
    let mut socket_body = proxy_body(up);
    socket_body.extend([
        "proxy_http_version 1.1;".to_string(),
        "proxy_set_header Upgrade $http_upgrade;".to_string(),
        "proxy_set_header Connection \"upgrade\";".to_string(),
        "proxy_read_timeout 3600s;".to_string(),
        "proxy_send_timeout 3600s;".to_string(),
    ]);
    rules.push(Box::new(EnsureLocation::new(
        LocationSelector::plain("/socket.io/"),
        "socket.io proxy",
        socket_body,
    )));

    // /api/* compatibility: the trailing slash strips the prefix upstream.
    let mut api_body = vec![format!("proxy_pass {up}/;")];
    api_body.extend(proxy_headers());
    rules.push(Box::new(EnsureLocation::new(
        LocationSelector::prefix("/api/"),
        "api compat (/api/* -> /*)",
        api_body,
    )));

    rules.push(Box::new(EnsureRateLimit::new(
        LocationSelector::exact("/me"),
        params.api_zone.clone(),
        30,
    )));
    rules.push(Box::new(EnsureRateLimit::new(
        LocationSelector::prefix("/auth/"),
        params.auth_zone.clone(),
        10,
    )));
    rules.push(Box::new(EnsureRateLimit::new(
        LocationSelector::plain("/socket.io/"),
        params.api_zone.clone(),
        60,
    )));
    rules.push(Box::new(EnsureRateLimit::new(
        LocationSelector::plain("/"),
        params.api_zone.clone(),
        80,
    )));

    rules
}
