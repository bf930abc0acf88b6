//! The `scan` command: print the block outline of a config file.
//!
//! Read-only companion to `patch`; useful for checking what the scanner
//! sees before letting it loose on a live vhost.

use anyhow::Result;
use serde::Serialize;

use crate::cli::{AppContext, ScanArgs};
use crate::core::locate;
use crate::core::scan::BlockTree;
use crate::core::session::PatchError;
use crate::infra::io;

#[derive(Debug, Serialize)]
struct NodeOutline {
    header: String,
    children: Vec<NodeOutline>,
}

#[derive(Debug, Serialize)]
struct Outline {
    balanced: bool,
    blocks: Vec<NodeOutline>,
}

pub fn run(args: ScanArgs, ctx: &AppContext) -> Result<()> {
    let text = io::read_text(&args.file)?;
    let tree = BlockTree::parse(&text);

    let outline = Outline {
        balanced: tree.is_balanced(),
        blocks: tree
            .roots()
            .iter()
            .map(|&id| outline_node(&text, &tree, id))
            .collect(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outline)?);
    } else if !ctx.quiet {
        for block in &outline.blocks {
            print_node(block, 0);
        }
        for names in server_summaries(&text, &tree) {
            println!("server: {}", names.join(" "));
        }
    }

    if !outline.balanced {
        return Err(anyhow::Error::new(PatchError::StructuralParse));
    }
    Ok(())
}

fn outline_node(text: &str, tree: &BlockTree, id: usize) -> NodeOutline {
    NodeOutline {
        header: tree.header_text(text, id).trim().to_string(),
        children: tree
            .children(id)
            .iter()
            .map(|&c| outline_node(text, tree, c))
            .collect(),
    }
}

fn print_node(node: &NodeOutline, depth: usize) {
    println!("{}{} {{ .. }}", "    ".repeat(depth), node.header);
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

fn server_summaries(text: &str, tree: &BlockTree) -> Vec<Vec<String>> {
    locate::keyword_roots(text, tree, "server")
        .into_iter()
        .filter_map(|id| {
            let names = locate::server_names(text, tree, id)?;
            (!names.is_empty()).then_some(names)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_reflects_nesting() {
        let text = "\
server {
    server_name app.memtest.dev;
    location / {
        try_files $uri /index.html;
    }
}";
        let tree = BlockTree::parse(text);
        let root = tree.roots()[0];
        let node = outline_node(text, &tree, root);
        assert_eq!(node.header, "server");
        assert_eq!(node.children.len(), 1);
        assert_eq!(node.children[0].header, "location /");
    }

    #[test]
    fn server_summaries_skip_nameless_blocks() {
        let text = "server {\n    listen 80 default_server;\n}\n";
        let tree = BlockTree::parse(text);
        assert!(server_summaries(text, &tree).is_empty());
    }
}
