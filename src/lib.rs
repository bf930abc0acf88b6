//! **vhostpatch** - Idempotent structural patcher for nginx vhost files
//!
//! Scans brace-delimited config into a block tree, then applies a catalog
//! of insert/clone/augment rules to the matching `server` blocks. Running
//! the same patch twice never changes the file a second time, and a file
//! that cannot be parsed is never written at all.

/// Command-line interface with clap integration
pub mod cli;

/// Shell completion generation
pub mod completion;

/// Core engine - scanning, locating, and rewriting block-structured config
pub mod core {
    /// Brace-depth scanner producing the block tree
    pub mod scan;
    pub use scan::{BlockTree, Span};

    /// Header matching and block location (server names, location selectors)
    pub mod locate;
    pub use locate::LocationSelector;

    /// Insertion-point planning inside a parent block
    pub mod insert;

    /// Structure-preserving block cloning with directive rewrites
    pub mod clone;

    /// Directive-level augmentation of existing blocks
    pub mod augment;

    /// Patch session: staged, all-or-nothing rule application per document
    pub mod session;
    pub use session::{
        BlockIdentity, BlockRule, PatchError, PatchReport, PatchSession, RuleEffect,
        exit_code_for,
    };

    /// The managed vhost rule catalog
    pub mod rules;
    pub use rules::{TargetParams, vhost_rules};

    /// The `patch` command orchestration
    pub mod apply;
    pub use apply::run as patch_run;

    /// The `scan` command: read-only block outline
    pub mod inspect;
    pub use inspect::run as scan_run;

    /// Pre-write backups with an append-only JSONL index
    pub mod backup;
    pub use backup::{BackupRecord, FsStorage, Storage, run as backups_run};
}

/// Infrastructure - configuration and checked file I/O
pub mod infra {
    /// Configuration layering: defaults, vhostpatch.toml, environment
    pub mod config;
    pub use config::{Config, init as config_init, load_config};

    /// Checked reads and atomic writes
    pub mod io;
    pub use io::{create_if_missing, read_text, write_atomic};
}

// Strategic re-exports for clean CLI interface
pub use cli::{AppContext, Cli, Commands};
pub use core::{
    BlockRule, BlockTree, LocationSelector, PatchError, PatchReport, PatchSession, TargetParams,
    exit_code_for, vhost_rules,
};
pub use infra::{Config, load_config};
