//! Insertion planning.
//!
//! The host format tries sibling `location` blocks most-specific-first, and
//! the generic `location /` catch-all must stay last or newly added, more
//! specific blocks would never be reached. The planner therefore places new
//! blocks immediately before the catch-all when one exists, and before the
//! parent's closing brace otherwise.

use memchr::memrchr;

use crate::core::locate::{self, LocationSelector};
use crate::core::scan::BlockTree;

/// Byte offset within `text` at which a new child block of `parent` should
/// be inserted. `None` when the parent has no usable structure; callers
/// treat that as a skip, not a failure.
pub fn insertion_point(text: &str, tree: &BlockTree, parent: usize) -> Option<usize> {
    let node = tree.node(parent);
    if node.body.is_empty() {
        return None;
    }

    let catch_all = LocationSelector::plain("/");
    let at = match locate::find_children(text, tree, parent, &catch_all).first() {
        Some(&child) => line_start(text, tree.node(child).span.start),
        // No fallback sibling: insert just before the closing brace line.
        None => line_start(text, node.span.end.checked_sub(1)?),
    };
    // A `{ ... }` one-liner has no line of its own to insert before;
    // walking back to the line start would land outside the body.
    (at > node.body.start).then_some(at)
}

/// Start offset of the line containing `offset`.
pub fn line_start(text: &str, offset: usize) -> usize {
    memrchr(b'\n', &text.as_bytes()[..offset]).map_or(0, |pos| pos + 1)
}

/// Leading whitespace of the line containing `offset`, used to match a
/// sibling's indentation when composing inserted text.
pub fn line_indent(text: &str, offset: usize) -> &str {
    let start = line_start(text, offset);
    let line = &text[start..];
    let end = line
        .find(|c: char| !matches!(c, ' ' | '\t'))
        .unwrap_or(line.len());
    &line[..end]
}
