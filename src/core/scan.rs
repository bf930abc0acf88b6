//! Brace-depth block scanner.
//!
//! Builds an explicit arena tree of `name { ... }` spans from raw config
//! text. The tree is immutable; after any edit to the text it must be
//! rebuilt wholesale, which keeps every span valid for exactly as long as
//! the buffer it was computed from.

use memchr::memchr;

/// Half-open byte range `[start, end)` into the scanned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn slice<'t>(&self, text: &'t str) -> &'t str {
        &text[self.start..self.end]
    }
}

/// One brace-delimited block. Containment is positional: `span` covers the
/// header through the closing brace, `body` the bytes between the braces.
#[derive(Debug, Clone)]
pub struct BlockNode {
    /// Header start through closing `}` (inclusive of the brace).
    pub span: Span,
    /// Header text span, from the first header byte to just before `{`.
    pub header: Span,
    /// Bytes strictly between `{` and the matching `}`.
    pub body: Span,
    /// 0 for top-level blocks.
    pub depth: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Arena tree of blocks, indexed by position of discovery (left to right,
/// outer before inner).
#[derive(Debug, Default)]
pub struct BlockTree {
    nodes: Vec<BlockNode>,
    roots: Vec<usize>,
    balanced: bool,
}

#[derive(Copy, Clone)]
enum Lex {
    Code,
    Single,
    Double,
}

impl BlockTree {
    /// Scan `text` into a block tree.
    ///
    /// Braces inside `#` comments and quoted strings are ignored; a `\`
    /// escapes the following byte. On unbalanced input the scan stops at
    /// the corruption point and returns the blocks completed so far with
    /// `is_balanced() == false`; callers must refuse to write back.
    pub fn parse(text: &str) -> Self {
        let bytes = text.as_bytes();
        let mut tree = BlockTree {
            nodes: Vec::new(),
            roots: Vec::new(),
            balanced: true,
        };

        // Ids of blocks whose closing brace has not been seen yet.
        let mut open: Vec<usize> = Vec::new();
        // Offset where the current statement's text begins; the header of
        // a block runs from here (whitespace-trimmed) to its `{`.
        let mut stmt_start = 0usize;
        let mut state = Lex::Code;
        let mut i = 0usize;

        while i < bytes.len() {
            let b = bytes[i];
            match state {
                Lex::Code => match b {
                    b'#' => {
                        // Skip the comment; it never contributes header text.
                        let eol = memchr(b'\n', &bytes[i..]).map_or(bytes.len(), |off| i + off);
                        i = eol;
                        stmt_start = eol.min(bytes.len());
                    }
                    b'\'' => state = Lex::Single,
                    b'"' => state = Lex::Double,
                    b'\\' => i += 1,
                    b'{' => {
                        let hstart = text[stmt_start..i]
                            .find(|c: char| !c.is_whitespace())
                            .map_or(i, |off| stmt_start + off);
                        let hend = text[hstart..i]
                            .rfind(|c: char| !c.is_whitespace())
                            .map_or(hstart, |off| hstart + off + 1);
                        let id = tree.nodes.len();
                        let parent = open.last().copied();
                        tree.nodes.push(BlockNode {
                            span: Span { start: hstart, end: 0 },
                            header: Span { start: hstart, end: hend },
                            body: Span { start: i + 1, end: 0 },
                            depth: open.len(),
                            parent,
                            children: Vec::new(),
                        });
                        match parent {
                            Some(p) => tree.nodes[p].children.push(id),
                            None => tree.roots.push(id),
                        }
                        open.push(id);
                        stmt_start = i + 1;
                    }
                    b'}' => {
                        let Some(id) = open.pop() else {
                            // Closing brace with nothing open: stop here
                            // rather than guess at structure.
                            tree.balanced = false;
                            return tree;
                        };
                        tree.nodes[id].body.end = i;
                        tree.nodes[id].span.end = i + 1;
                        stmt_start = i + 1;
                    }
                    b';' => stmt_start = i + 1,
                    _ => {}
                },
                Lex::Single => match b {
                    b'\\' => i += 1,
                    b'\'' => state = Lex::Code,
                    _ => {}
                },
                Lex::Double => match b {
                    b'\\' => i += 1,
                    b'"' => state = Lex::Code,
                    _ => {}
                },
            }
            i += 1;
        }

        if !open.is_empty() {
            // Unclosed blocks at EOF: only completed spans stay reachable.
            tree.balanced = false;
            tree.detach(&open);
        }
        tree
    }

    /// Unlink still-open blocks so traversal only ever sees completed spans.
    fn detach(&mut self, open: &[usize]) {
        for &id in open {
            match self.nodes[id].parent {
                Some(p) => self.nodes[p].children.retain(|&c| c != id),
                None => self.roots.retain(|&r| r != id),
            }
        }
    }

    /// False when the input had unbalanced braces; the tree then holds only
    /// the blocks completed before the corruption point.
    pub fn is_balanced(&self) -> bool {
        self.balanced
    }

    /// Top-level block ids in document order.
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn node(&self, id: usize) -> &BlockNode {
        &self.nodes[id]
    }

    pub fn children(&self, id: usize) -> &[usize] {
        &self.nodes[id].children
    }

    pub fn header_text<'t>(&self, text: &'t str, id: usize) -> &'t str {
        self.nodes[id].header.slice(text)
    }

    pub fn block_text<'t>(&self, text: &'t str, id: usize) -> &'t str {
        self.nodes[id].span.slice(text)
    }

    pub fn body_text<'t>(&self, text: &'t str, id: usize) -> &'t str {
        self.nodes[id].body.slice(text)
    }

    /// Body ranges belonging to this block itself, with every child span
    /// cut out. Directive lookups use these so nested blocks never shadow
    /// or satisfy a match in the parent.
    pub fn own_body_ranges(&self, id: usize) -> Vec<Span> {
        let node = &self.nodes[id];
        let mut out = Vec::new();
        let mut cursor = node.body.start;
        for &child in &node.children {
            let cs = self.nodes[child].span;
            if cs.start > cursor {
                out.push(Span { start: cursor, end: cs.start });
            }
            cursor = cursor.max(cs.end);
        }
        if cursor < node.body.end {
            out.push(Span {
                start: cursor,
                end: node.body.end,
            });
        }
        out
    }

    /// Concatenated own-body text (children removed). Allocates; use
    /// `own_body_ranges` when offsets matter.
    pub fn own_body_text(&self, text: &str, id: usize) -> String {
        self.own_body_ranges(id)
            .iter()
            .map(|s| s.slice(text))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "server {\n    listen 80;\n    location / {\n        try_files $uri /index.html;\n    }\n}\n";

    #[test]
    fn finds_top_level_and_nested_blocks() {
        let tree = BlockTree::parse(SIMPLE);
        assert!(tree.is_balanced());
        assert_eq!(tree.roots().len(), 1);

        let root = tree.roots()[0];
        assert_eq!(tree.header_text(SIMPLE, root), "server");
        assert_eq!(tree.node(root).depth, 0);

        let kids = tree.children(root);
        assert_eq!(kids.len(), 1);
        assert_eq!(tree.header_text(SIMPLE, kids[0]), "location /");
        assert_eq!(tree.node(kids[0]).depth, 1);
    }

    #[test]
    fn block_span_covers_header_through_closing_brace() {
        let text = "upstream api { server 127.0.0.1:3001; }\n";
        let tree = BlockTree::parse(text);
        let root = tree.roots()[0];
        assert_eq!(
            tree.block_text(text, root),
            "upstream api { server 127.0.0.1:3001; }"
        );
        assert_eq!(tree.body_text(text, root), " server 127.0.0.1:3001; ");
    }

    #[test]
    fn braces_in_comments_are_ignored() {
        let text = "server {\n    # not a block: { nope }\n    listen 80;\n}\n";
        let tree = BlockTree::parse(text);
        assert!(tree.is_balanced());
        assert_eq!(tree.roots().len(), 1);
        assert!(tree.children(tree.roots()[0]).is_empty());
    }

    #[test]
    fn braces_in_strings_are_ignored() {
        let text = "server {\n    add_header X-Demo \"{json}\" always;\n    return 200 '{\"ok\":true}';\n}\n";
        let tree = BlockTree::parse(text);
        assert!(tree.is_balanced());
        assert_eq!(tree.roots().len(), 1);
        assert!(tree.children(tree.roots()[0]).is_empty());
    }

    #[test]
    fn comment_before_header_is_not_part_of_it() {
        let text = "listen 80;\n# managed below\nserver {\n}\n";
        let tree = BlockTree::parse(text);
        let root = tree.roots()[0];
        assert_eq!(tree.header_text(text, root), "server");
    }

    #[test]
    fn unclosed_block_is_flagged_and_detached() {
        let text = "server {\n    location / {\n    }\n";
        let tree = BlockTree::parse(text);
        assert!(!tree.is_balanced());
        // The unclosed server block must not be reachable.
        assert!(tree.roots().is_empty());
    }

    #[test]
    fn stray_closing_brace_stops_the_scan() {
        let text = "server {\n    listen 80;\n}\n}\nserver {\n    listen 81;\n}\n";
        let tree = BlockTree::parse(text);
        assert!(!tree.is_balanced());
        // Only the block completed before the corruption point survives.
        assert_eq!(tree.roots().len(), 1);
    }

    #[test]
    fn own_body_excludes_children() {
        let tree = BlockTree::parse(SIMPLE);
        let own = tree.own_body_text(SIMPLE, tree.roots()[0]);
        assert!(own.contains("listen 80;"));
        assert!(!own.contains("try_files"));
    }

    #[test]
    fn sibling_blocks_keep_document_order() {
        let text = "server { listen 80; }\nserver { listen 443; }\n";
        let tree = BlockTree::parse(text);
        let roots = tree.roots();
        assert_eq!(roots.len(), 2);
        assert!(tree.node(roots[0]).span.end <= tree.node(roots[1]).span.start);
    }
}
