//! Header identity extraction and block location.
//!
//! Matching runs against the scanner's header spans, never against raw
//! lines, so a `location` mentioned inside a string literal or comment can
//! never be mistaken for a real block header.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::scan::BlockTree;
use crate::core::session::PatchError;

static SERVER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*server_name\s+([^;]+);").unwrap());

/// Identity tokens declared by a block's `server_name` directive, taken
/// from the block's own body only (nested blocks excluded). Variable
/// references (`$host` and friends) are not literal names and are dropped.
/// Returns `None` when the directive is absent.
pub fn server_names(text: &str, tree: &BlockTree, id: usize) -> Option<Vec<String>> {
    let own = tree.own_body_text(text, id);
    let caps = SERVER_NAME_RE.captures(&own)?;
    Some(
        caps[1]
            .split_whitespace()
            .filter(|tok| !tok.starts_with('$'))
            .map(str::to_string)
            .collect(),
    )
}

/// Location match modifier, mirroring the host format's specificity flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    /// `location = /path`
    Exact,
    /// `location ^~ /path`
    Prefix,
    /// `location /path`
    Plain,
}

/// Anchored matcher for a `location` header.
#[derive(Debug, Clone)]
pub struct LocationSelector {
    modifier: Modifier,
    path: String,
    re: Regex,
}

impl LocationSelector {
    pub fn exact(path: &str) -> Self {
        Self::build(Modifier::Exact, path)
    }

    pub fn prefix(path: &str) -> Self {
        Self::build(Modifier::Prefix, path)
    }

    pub fn plain(path: &str) -> Self {
        Self::build(Modifier::Plain, path)
    }

    fn build(modifier: Modifier, path: &str) -> Self {
        let escaped = regex::escape(path);
        let pattern = match modifier {
            Modifier::Exact => format!(r"^location\s*=\s*{escaped}$"),
            Modifier::Prefix => format!(r"^location\s+\^~\s+{escaped}$"),
            Modifier::Plain => format!(r"^location\s+{escaped}$"),
        };
        let re = Regex::new(&pattern).expect("location selector regex");
        Self {
            modifier,
            path: path.to_string(),
            re,
        }
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Canonical header text for this selector, used when composing new
    /// blocks and in action descriptions.
    pub fn header(&self) -> String {
        match self.modifier {
            Modifier::Exact => format!("location = {}", self.path),
            Modifier::Prefix => format!("location ^~ {}", self.path),
            Modifier::Plain => format!("location {}", self.path),
        }
    }

    pub fn matches_header(&self, header: &str) -> bool {
        self.re.is_match(header.trim())
    }
}

/// Direct children of `parent` whose header matches the selector, in
/// document order.
pub fn find_children(
    text: &str,
    tree: &BlockTree,
    parent: usize,
    selector: &LocationSelector,
) -> Vec<usize> {
    tree.children(parent)
        .iter()
        .copied()
        .filter(|&child| selector.matches_header(tree.header_text(text, child)))
        .collect()
}

/// The unique child matching the selector, `None` when absent. More than
/// one candidate is an error: no action beats a guess.
pub fn find_unique(
    text: &str,
    tree: &BlockTree,
    parent: usize,
    selector: &LocationSelector,
) -> Result<Option<usize>, PatchError> {
    let found = find_children(text, tree, parent, selector);
    match found.len() {
        0 => Ok(None),
        1 => Ok(Some(found[0])),
        n => Err(PatchError::Ambiguous {
            what: selector.header(),
            count: n,
        }),
    }
}

/// Top-level blocks whose header keyword matches, e.g. every `server` block.
pub fn keyword_roots(text: &str, tree: &BlockTree, keyword: &str) -> Vec<usize> {
    tree.roots()
        .iter()
        .copied()
        .filter(|&id| {
            tree.header_text(text, id)
                .split_whitespace()
                .next()
                .is_some_and(|tok| tok == keyword)
        })
        .collect()
}

/// True when a directive with the given key appears in the block's own
/// body. The key must match the line's leading token(s) exactly; a
/// multi-word key like `add_header Cache-Control` matches that header only.
pub fn has_directive(text: &str, tree: &BlockTree, id: usize, key: &str) -> bool {
    tree.own_body_ranges(id).iter().any(|range| {
        range.slice(text).lines().any(|line| {
            let t = line.trim_start();
            t.starts_with(key)
                && t[key.len()..]
                    .chars()
                    .next()
                    .is_none_or(|c| c.is_whitespace() || c == ';')
        })
    })
}
