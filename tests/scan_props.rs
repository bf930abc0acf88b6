//! Property tests for the scanner and the patch pipeline.

use proptest::prelude::*;

use vhostpatch::core::rules::{TargetParams, vhost_rules};
use vhostpatch::core::scan::BlockTree;
use vhostpatch::core::session::{BlockIdentity, PatchSession};

/// Directive-ish lines that may legally appear inside a server block.
fn directive() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("    listen 80;".to_string()),
        Just("    index index.html;".to_string()),
        Just("    # comment with { braces }".to_string()),
        Just("    add_header X-T \"{v}\";".to_string()),
        Just("    gzip on;".to_string()),
    ]
}

fn server_block() -> impl Strategy<Value = String> {
    (
        "[a-z]{1,8}\\.memtest\\.dev",
        prop::collection::vec(directive(), 0..5),
    )
        .prop_map(|(name, lines)| {
            let mut s = format!("server {{\n    server_name {name};\n");
            for line in &lines {
                s.push_str(line);
                s.push('\n');
            }
            s.push_str("    location / {\n        try_files $uri /index.html;\n    }\n}\n");
            s
        })
}

fn document() -> impl Strategy<Value = String> {
    prop::collection::vec(server_block(), 1..4).prop_map(|blocks| blocks.join("\n"))
}

proptest! {
    /// The scanner never panics and every span stays within the buffer,
    /// balanced input or not.
    #[test]
    fn scanner_spans_are_in_bounds(text in "[ -~\n]{0,200}") {
        let tree = BlockTree::parse(&text);
        for &root in tree.roots() {
            let node = tree.node(root);
            prop_assert!(node.span.end <= text.len());
            prop_assert!(node.header.start <= node.header.end);
            prop_assert!(node.body.start <= node.body.end);
        }
    }

    /// Generated documents parse balanced with one root per block.
    #[test]
    fn generated_documents_are_balanced(doc in document()) {
        let tree = BlockTree::parse(&doc);
        prop_assert!(tree.is_balanced());
        prop_assert!(!tree.roots().is_empty());
    }

    /// Patching is idempotent and keeps every original directive line.
    #[test]
    fn patching_is_idempotent_and_non_destructive(doc in document()) {
        let params = TargetParams {
            upstream: "http://127.0.0.1:3001".to_string(),
            uploads_alias: None,
            api_zone: "vhp_api_per_ip".to_string(),
            auth_zone: "vhp_auth_per_ip".to_string(),
        };
        let run = |text: &str| {
            let mut session = PatchSession::new(text);
            session
                .run(
                    &|id: &BlockIdentity| !id.names.is_empty(),
                    &|_| Some(vhost_rules(&params)),
                )
                .unwrap();
            session.into_parts().0
        };

        let once = run(&doc);
        for line in doc.lines().filter(|l| !l.trim().is_empty()) {
            prop_assert!(once.contains(line), "lost line: {line}");
        }

        let twice = run(&once);
        prop_assert_eq!(once, twice);
    }
}
