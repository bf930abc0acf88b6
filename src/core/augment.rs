//! Directive augmentation.
//!
//! Adds directives to a block's body only when no directive with the same
//! key is already present. Multiple augmentations run in one pass over the
//! current text, re-parsing between insertions so offsets are never stale.

use crate::core::locate;
use crate::core::scan::BlockTree;

/// One directive to guarantee inside a block. `text` may span several
/// lines (e.g. a marker comment above the directive proper); every line is
/// indented to the block's body depth on insertion.
#[derive(Debug, Clone)]
pub struct Directive {
    pub key: String,
    pub text: String,
}

impl Directive {
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
        }
    }
}

/// Ensure every directive in `wanted` exists in the block's own body.
/// Missing ones are inserted immediately after the opening brace line.
/// Returns the (possibly rewritten) block text and whether it changed.
pub fn ensure_directives(block: &str, wanted: &[Directive]) -> (String, bool) {
    let mut current = block.to_string();
    let mut changed = false;

    for directive in wanted {
        let tree = BlockTree::parse(&current);
        let Some(&root) = tree.roots().first() else {
            // Not a parseable block; leave it alone.
            return (current, changed);
        };
        if locate::has_directive(&current, &tree, root, &directive.key) {
            continue;
        }

        let open = tree.node(root).body.start;
        let Some(line_end) = current[open..].find('\n').map(|off| open + off + 1) else {
            // Single-line block body; append before the closing brace
            // would mangle it, so skip rather than guess.
            continue;
        };

        let indent = body_indent(&current, &tree, root);
        let mut insertion = String::new();
        for line in directive.text.lines() {
            insertion.push_str(&indent);
            insertion.push_str(line);
            insertion.push('\n');
        }

        current.insert_str(line_end, &insertion);
        changed = true;
    }

    (current, changed)
}

/// Indentation used by the block's body: taken from its first non-empty
/// own-body line, else header indentation plus four spaces.
fn body_indent(text: &str, tree: &BlockTree, id: usize) -> String {
    for range in tree.own_body_ranges(id) {
        for line in range.slice(text).lines() {
            if !line.trim().is_empty() {
                let len = line.len() - line.trim_start().len();
                return line[..len].to_string();
            }
        }
    }
    let header_start = tree.node(id).header.start;
    let line_start = crate::core::insert::line_start(text, header_start);
    format!("{}    ", &text[line_start..header_start])
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: &str = "\
location = /me {
    proxy_pass http://127.0.0.1:3001;
    proxy_set_header Host $host;
}
";

    #[test]
    fn inserts_missing_directive_after_opening_brace() {
        let wanted = [Directive::new(
            "limit_req",
            "limit_req zone=api_per_ip burst=30 nodelay;",
        )];
        let (out, changed) = ensure_directives(BLOCK, &wanted);
        assert!(changed);
        let first_body_line = out.lines().nth(1).unwrap();
        assert_eq!(
            first_body_line,
            "    limit_req zone=api_per_ip burst=30 nodelay;"
        );
        // Existing directives untouched.
        assert!(out.contains("    proxy_pass http://127.0.0.1:3001;\n"));
    }

    #[test]
    fn present_directive_reports_no_change() {
        let block = "\
location = /me {
    limit_req zone=api_per_ip burst=30 nodelay;
    proxy_pass http://127.0.0.1:3001;
}
";
        let wanted = [Directive::new("limit_req", "limit_req zone=other;")];
        let (out, changed) = ensure_directives(block, &wanted);
        assert!(!changed);
        assert_eq!(out, block);
    }

    #[test]
    fn several_directives_apply_in_one_pass() {
        let wanted = [
            Directive::new("expires", "expires 30d;"),
            Directive::new(
                "add_header Cache-Control",
                "add_header Cache-Control \"public, max-age=2592000, immutable\" always;",
            ),
            Directive::new("proxy_pass", "proxy_pass http://ignored;"),
        ];
        let (out, changed) = ensure_directives(BLOCK, &wanted);
        assert!(changed);
        assert!(out.contains("expires 30d;"));
        assert!(out.contains("add_header Cache-Control"));
        // proxy_pass already present: not duplicated.
        assert_eq!(out.matches("proxy_pass").count(), 1);
    }

    #[test]
    fn multi_line_directive_text_is_indented_per_line() {
        let wanted = [Directive::new(
            "limit_req",
            "# rate-limit\nlimit_req zone=z burst=10 nodelay;",
        )];
        let (out, _) = ensure_directives(BLOCK, &wanted);
        assert!(out.contains("\n    # rate-limit\n    limit_req zone=z burst=10 nodelay;\n"));
    }

    #[test]
    fn idempotent_on_reapplication() {
        let wanted = [Directive::new("expires", "expires 30d;")];
        let (once, changed_once) = ensure_directives(BLOCK, &wanted);
        let (twice, changed_twice) = ensure_directives(&once, &wanted);
        assert!(changed_once);
        assert!(!changed_twice);
        assert_eq!(once, twice);
    }
}
