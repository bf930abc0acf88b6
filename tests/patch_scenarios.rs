//! End-to-end engine scenarios over realistic vhost documents.

use vhostpatch::core::session::{BlockIdentity, PatchError, PatchSession};
use vhostpatch::core::rules::{TargetParams, vhost_rules};

fn params(port: u16, uploads: Option<&str>) -> TargetParams {
    TargetParams {
        upstream: format!("http://127.0.0.1:{port}"),
        uploads_alias: uploads.map(str::to_string),
        api_zone: "vhp_api_per_ip".to_string(),
        auth_zone: "vhp_auth_per_ip".to_string(),
    }
}

fn patch(doc: &str, domain: &str, params: &TargetParams) -> Result<(String, bool), PatchError> {
    let mut session = PatchSession::new(doc);
    let domain = domain.to_string();
    let params = params.clone();
    session.run(
        &move |id: &BlockIdentity| id.names.iter().any(|n| *n == domain),
        &move |_| Some(vhost_rules(&params)),
    )?;
    let changed = session.report().changed;
    let (text, _) = session.into_parts();
    Ok((text, changed))
}

const FRESH_SPA: &str = "\
server {
    listen 443 ssl http2;
    server_name app.memtest.dev www.app.memtest.dev;

    root /var/www/app/dist;
    index index.html;

    location /socket.io/ {
        proxy_pass http://127.0.0.1:3001;
    }

    location / {
        try_files $uri $uri/ /index.html;
    }
}
";

#[test]
fn fresh_vhost_gets_the_full_managed_surface() {
    let p = params(3001, Some("/opt/app/uploads"));
    let (out, changed) = patch(FRESH_SPA, "app.memtest.dev", &p).unwrap();
    assert!(changed);

    for needle in [
        "location ^~ /internal/",
        "location = /health",
        "location = /me",
        "location ^~ /me/",
        "location ^~ /auth/",
        "location ^~ /wallet/",
        "location = /wallet",
        "location ^~ /overlay/credits/",
        "location ^~ /api/",
        "location /uploads/",
        "limit_req zone=vhp_api_per_ip burst=80 nodelay;",
    ] {
        assert!(out.contains(needle), "missing {needle}\n{out}");
    }

    // Everything managed lands before the catch-all.
    let catch_all = out.find("location / {").unwrap();
    assert!(out.find("location ^~ /internal/").unwrap() < catch_all);
    assert!(out.find("location ^~ /api/").unwrap() < catch_all);

    // Hand-written config survives untouched.
    assert!(out.contains("root /var/www/app/dist;"));
    assert!(out.contains("try_files $uri $uri/ /index.html;"));
    assert_eq!(out.matches("location /socket.io/").count(), 1);
}

#[test]
fn second_run_changes_nothing() {
    let p = params(3001, Some("/opt/app/uploads"));
    let (once, changed) = patch(FRESH_SPA, "app.memtest.dev", &p).unwrap();
    assert!(changed);

    let (twice, changed_again) = patch(&once, "app.memtest.dev", &p).unwrap();
    assert!(!changed_again);
    assert_eq!(once, twice);
}

#[test]
fn partially_patched_vhost_only_gains_missing_pieces() {
    let doc = "\
server {
    server_name app.memtest.dev;

    location ^~ /internal/ {
        return 404;
    }

    location = /me {
        proxy_pass http://127.0.0.1:3001;
        limit_req zone=custom burst=5;
    }

    location / {
        try_files $uri /index.html;
    }
}
";
    let p = params(3001, None);
    let (out, changed) = patch(doc, "app.memtest.dev", &p).unwrap();
    assert!(changed);

    // Existing blocks are not duplicated or rewritten.
    assert_eq!(out.matches("location ^~ /internal/").count(), 1);
    assert_eq!(out.matches("location = /me {").count(), 1);
    assert!(out.contains("limit_req zone=custom burst=5;"));
    assert!(!out.contains("limit_req zone=vhp_api_per_ip burst=30"));

    // Missing pieces appear, including the /me/ clone of the exact block.
    assert!(out.contains("location ^~ /me/"));
    assert!(out.contains("location = /health"));
}

#[test]
fn unbalanced_vhost_is_rejected_untouched() {
    let doc = "server {\n    server_name app.memtest.dev;\n    location / {\n";
    let p = params(3001, None);
    let err = patch(doc, "app.memtest.dev", &p).unwrap_err();
    assert!(matches!(err, PatchError::StructuralParse));
}

#[test]
fn unrelated_server_blocks_are_left_alone() {
    let doc = format!("{FRESH_SPA}\nserver {{\n    server_name other.example.net;\n    location / {{\n        try_files $uri /index.html;\n    }}\n}}\n");
    let p = params(3001, None);
    let (out, changed) = patch(&doc, "app.memtest.dev", &p).unwrap();
    assert!(changed);

    let other = out.find("other.example.net").unwrap();
    // Nothing managed was inserted after the unrelated block's server_name.
    assert!(!out[other..].contains("location ^~ /internal/"));
}

#[test]
fn prod_and_beta_blocks_get_their_own_upstreams() {
    let doc = "\
server {
    server_name app.memtest.dev;
    location / {
        try_files $uri /index.html;
    }
}
server {
    server_name beta.memtest.dev;
    location / {
        try_files $uri /index.html;
    }
}
";
    let prod = params(3001, None);
    let beta = params(3002, None);

    let mut session = PatchSession::new(doc);
    session
        .run(&|_| true, &|id: &BlockIdentity| {
            if id.names.iter().any(|n| n == "app.memtest.dev") {
                Some(vhost_rules(&prod))
            } else if id.names.iter().any(|n| n == "beta.memtest.dev") {
                Some(vhost_rules(&beta))
            } else {
                None
            }
        })
        .unwrap();

    let out = session.text();
    let beta_at = out.find("beta.memtest.dev").unwrap();
    let (prod_half, beta_half) = out.split_at(beta_at);
    assert!(prod_half.contains("proxy_pass http://127.0.0.1:3001;"));
    assert!(!prod_half.contains("proxy_pass http://127.0.0.1:3002;"));
    assert!(beta_half.contains("proxy_pass http://127.0.0.1:3002;"));
    assert!(!beta_half.contains("proxy_pass http://127.0.0.1:3001;"));
}

#[test]
fn single_line_server_block_is_left_intact() {
    let doc = "server { server_name app.memtest.dev; listen 80; }\n";
    let p = params(3001, Some("/opt/app/uploads"));

    let (once, changed) = patch(doc, "app.memtest.dev", &p).unwrap();
    // A one-liner offers no insertion point; skipping beats splicing into
    // the middle of its only line.
    assert!(!changed);
    assert_eq!(once, doc);
    assert!(once.starts_with("server {"), "nothing may precede the header");

    let (twice, changed_again) = patch(&once, "app.memtest.dev", &p).unwrap();
    assert!(!changed_again);
    assert_eq!(once, twice);
}

#[test]
fn comments_and_strings_never_fool_the_scanner() {
    let doc = "\
server {
    server_name app.memtest.dev;
    # a stray { brace in a comment }
    add_header X-Note \"braces { in } strings\";
    location / {
        try_files $uri /index.html; # trailing }
    }
}
";
    let p = params(3001, None);
    let (out, changed) = patch(doc, "app.memtest.dev", &p).unwrap();
    assert!(changed);
    assert!(out.contains("# a stray { brace in a comment }"));
    assert!(out.contains("add_header X-Note \"braces { in } strings\";"));
}
