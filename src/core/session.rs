//! Patch session orchestration.
//!
//! One session owns one document for its lifetime: scan once, apply a
//! sequence of idempotent rules to the matching `server` blocks, and report
//! whether anything changed. Matched blocks are visited from the last byte
//! offset to the first so that splicing a longer block back in never
//! invalidates the spans still waiting to be patched.

use serde::Serialize;
use tracing::debug;

use crate::core::locate;
use crate::core::scan::BlockTree;

/// Typed failure taxonomy. A session that returns one of these has not
/// written anything; `NoopSkipped` is an outcome, not an error, and lives
/// in [`PatchReport::changed`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum PatchError {
    /// Unbalanced or unrecognizable block structure; the input is presumed
    /// hand-edited and needs human review, never an automatic retry.
    #[error("unbalanced block structure; refusing to patch")]
    StructuralParse,

    /// A required reference block is missing.
    #[error("required anchor block not found: {0}")]
    AnchorNotFound(String),

    /// More than one candidate for a predicate expected to be unique.
    #[error("ambiguous match for `{what}`: {count} candidates")]
    Ambiguous { what: String, count: usize },
}

/// Exit code mapping for the CLI boundary.
/// 0=success/noop, 2=structural, 3=anchor, 4=ambiguous.
pub fn exit_code_for(e: &PatchError) -> i32 {
    match e {
        PatchError::StructuralParse => 2,
        PatchError::AnchorNotFound(_) => 3,
        PatchError::Ambiguous { .. } => 4,
    }
}

/// Aggregate outcome of one session: whether the buffer changed plus an
/// ordered log of human-readable actions. Immutable once returned.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchReport {
    pub changed: bool,
    /// Count of `server` blocks the predicate accepted.
    pub matched: usize,
    pub actions: Vec<String>,
}

/// Identity attributes of a `server` block, fed to the caller's predicate.
#[derive(Debug, Clone)]
pub struct BlockIdentity {
    /// Literal names from `server_name`, empty when the directive is absent.
    pub names: Vec<String>,
}

/// Effect of one rule on one block.
#[derive(Debug)]
pub struct RuleEffect {
    /// Replacement block text, `None` when nothing changed.
    pub text: Option<String>,
    /// Human-readable descriptions of what was done.
    pub actions: Vec<String>,
}

impl RuleEffect {
    pub fn unchanged() -> Self {
        Self {
            text: None,
            actions: Vec::new(),
        }
    }

    pub fn changed(text: String, action: impl Into<String>) -> Self {
        Self {
            text: Some(text),
            actions: vec![action.into()],
        }
    }
}

/// A named, idempotent transformation of a single block's text. Applying
/// the same rule twice to the same logical target must never change the
/// text the second time.
pub trait BlockRule {
    fn name(&self) -> &str;

    fn apply(&self, block: &str) -> Result<RuleEffect, PatchError>;
}

/// Owns the document text for the duration of one patch run.
#[derive(Debug)]
pub struct PatchSession {
    text: String,
    report: PatchReport,
}

impl PatchSession {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            report: PatchReport::default(),
        }
    }

    /// Apply rules to every top-level `server` block accepted by
    /// `predicate`. `build_rules` receives the block identity and returns
    /// the rules for that block, or `None` to skip it.
    ///
    /// Any error aborts the session with the text left as it was before
    /// `run` was called; partial patches are never observable.
    pub fn run(
        &mut self,
        predicate: &dyn Fn(&BlockIdentity) -> bool,
        build_rules: &dyn Fn(&BlockIdentity) -> Option<Vec<Box<dyn BlockRule>>>,
    ) -> Result<(), PatchError> {
        let tree = BlockTree::parse(&self.text);
        if !tree.is_balanced() {
            return Err(PatchError::StructuralParse);
        }

        // Collect matched spans first; the tree is invalidated by the first
        // splice below.
        let mut targets = Vec::new();
        for id in locate::keyword_roots(&self.text, &tree, "server") {
            let identity = BlockIdentity {
                names: locate::server_names(&self.text, &tree, id).unwrap_or_default(),
            };
            if predicate(&identity) {
                targets.push((tree.node(id).span, identity));
            }
        }
        debug!(matched = targets.len(), "scanned document");

        let mut staged = self.text.clone();
        let mut staged_report = self.report.clone();
        staged_report.matched += targets.len();

        for (span, identity) in targets.iter().rev() {
            let Some(rules) = build_rules(identity) else {
                continue;
            };

            let mut block = span.slice(&staged).to_string();
            let mut block_changed = false;
            for rule in &rules {
                let effect = rule.apply(&block)?;
                if let Some(new_text) = effect.text {
                    debug!(rule = rule.name(), "block changed");
                    block = new_text;
                    block_changed = true;
                }
                staged_report.actions.extend(effect.actions);
            }

            if block_changed {
                staged.replace_range(span.start..span.end, &block);
                staged_report.changed = true;
            }
        }

        // Commit only after every rule succeeded.
        self.text = staged;
        self.report = staged_report;
        Ok(())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn report(&self) -> &PatchReport {
        &self.report
    }

    pub fn into_parts(self) -> (String, PatchReport) {
        (self.text, self.report)
    }
}
