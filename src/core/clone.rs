//! Block cloning.
//!
//! An existing, human-authored block usually carries operationally
//! important directives (headers, timeouts, cache policy) that a
//! synthesized minimal block would omit. Cloning copies the source block
//! byte-for-byte and rewrites only its header and an explicit, bounded set
//! of directives; everything else, comments and ordering included, is
//! preserved exactly.

use crate::core::scan::BlockTree;

/// Rewrite of a single directive inside a clone: every line whose leading
/// token matches `key` is replaced by `line` (original indentation kept).
#[derive(Debug, Clone)]
pub struct DirectiveRewrite {
    pub key: String,
    pub line: String,
}

impl DirectiveRewrite {
    pub fn new(key: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            line: line.into(),
        }
    }
}

/// Copy the block at `source`, replacing its header with `new_header` and
/// applying `rewrites`. The returned text starts at the header token; the
/// caller supplies leading indentation when splicing the clone in.
pub fn clone_block(
    text: &str,
    tree: &BlockTree,
    source: usize,
    new_header: &str,
    rewrites: &[DirectiveRewrite],
) -> String {
    let node = tree.node(source);
    let src = node.span.slice(text);
    let header_len = node.header.len();

    let mut out = String::with_capacity(src.len() + new_header.len());
    out.push_str(new_header);
    out.push_str(&src[header_len..]);

    if rewrites.is_empty() {
        return out;
    }

    let mut rewritten = String::with_capacity(out.len());
    for (idx, line) in out.split_inclusive('\n').enumerate() {
        // The first line is the rewritten header; never touch it.
        if idx > 0
            && let Some(rw) = matching_rewrite(line, rewrites)
        {
            let indent_len = line.len() - line.trim_start().len();
            rewritten.push_str(&line[..indent_len]);
            rewritten.push_str(&rw.line);
            if line.ends_with('\n') {
                rewritten.push('\n');
            }
            continue;
        }
        rewritten.push_str(line);
    }
    rewritten
}

fn matching_rewrite<'r>(line: &str, rewrites: &'r [DirectiveRewrite]) -> Option<&'r DirectiveRewrite> {
    let t = line.trim_start();
    rewrites.iter().find(|rw| {
        t.starts_with(rw.key.as_str())
            && t[rw.key.len()..]
                .chars()
                .next()
                .is_none_or(|c| c.is_whitespace())
    })
}
