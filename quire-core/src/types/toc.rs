//! Table of contents tree

use serde::{Deserialize, Serialize};

/// A node in the table of contents. The root node has an empty title and no target.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TocNode {
    /// Display title
    pub title: String,

    /// Target container name, root-relative
    pub href: Option<String>,

    /// Anchor within the target
    pub fragment: Option<String>,

    /// Identifier carried over from NCX/nav, if any
    pub id: Option<String>,

    /// Child entries for nested TOC
    pub children: Vec<TocNode>,
}

impl TocNode {
    /// An empty root
    pub fn root() -> Self {
        Self::default()
    }

    /// Create a new TOC entry
    pub fn new(title: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            href: Some(href.into()),
            ..Self::default()
        }
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        let fragment = fragment.into();
        self.fragment = (!fragment.is_empty()).then_some(fragment);
        self
    }

    /// Add child entries
    pub fn with_children(mut self, children: Vec<TocNode>) -> Self {
        self.children = children;
        self
    }

    /// Add a single child entry, returning a handle to it
    pub fn add_child(&mut self, child: TocNode) -> &mut TocNode {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// `name#fragment` form of the target
    pub fn target(&self) -> Option<String> {
        let href = self.href.as_ref()?;
        Some(match &self.fragment {
            Some(frag) => format!("{href}#{frag}"),
            None => href.clone(),
        })
    }

    /// Number of entries below this node
    pub fn count(&self) -> usize {
        self.children.iter().map(|c| 1 + c.count()).sum()
    }

    /// Depth of the subtree below this node (a root with only leaves has depth 1)
    pub fn depth(&self) -> usize {
        self.children
            .iter()
            .map(|c| 1 + c.depth())
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Entries in depth-first order together with their level (1 = top level)
    pub fn flatten(&self) -> Vec<(usize, &TocNode)> {
        fn walk<'a>(node: &'a TocNode, level: usize, out: &mut Vec<(usize, &'a TocNode)>) {
            for child in &node.children {
                out.push((level, child));
                walk(child, level + 1, out);
            }
        }
        let mut out = Vec::new();
        walk(self, 1, &mut out);
        out
    }

    /// Visit every entry mutably, depth first
    pub fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut TocNode)) {
        for child in &mut self.children {
            f(child);
            child.for_each_mut(f);
        }
    }

    /// Remove entries for which `keep` returns false. Children of removed
    /// entries are promoted into their place.
    pub fn retain(&mut self, keep: &mut dyn FnMut(&TocNode) -> bool) {
        let children = std::mem::take(&mut self.children);
        for mut child in children {
            child.retain(keep);
            if keep(&child) {
                self.children.push(child);
            } else {
                self.children.append(&mut child.children);
            }
        }
    }
}
