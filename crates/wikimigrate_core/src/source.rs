use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::frontmatter::{self, FrontMatter};

/// Top-level readme of a Wiki.js git export; not a wiki page.
pub const RESERVED_README: &str = "README.md";

/// One markdown file discovered under the import root. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Slash-separated path relative to the import root, extension included.
    pub relative_path: String,
    /// Extension-stripped relative path; the join key between the file set
    /// and its hierarchy position.
    pub path_key: String,
    pub matter: FrontMatter,
    pub body: String,
}

impl SourceDocument {
    pub fn title(&self) -> String {
        self.matter
            .title
            .clone()
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| {
                let stem = self.path_key.rsplit('/').next().unwrap_or(&self.path_key);
                title_from_segment(stem)
            })
    }
}

/// Strip the markdown extension from a relative path.
pub fn path_key(relative_path: &str) -> String {
    relative_path
        .strip_suffix(".md")
        .unwrap_or(relative_path)
        .to_string()
}

/// The path key one directory level up, or None for root-level keys.
pub fn parent_key(path_key: &str) -> Option<&str> {
    path_key.rsplit_once('/').map(|(parent, _)| parent)
}

/// Human title from a path segment: separators become spaces, words are
/// capitalized.
pub fn title_from_segment(segment: &str) -> String {
    segment
        .replace(['_', '-'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ordering key guaranteeing every ancestor path sorts strictly before any of
/// its descendants: each extension-stripped path component is paired with its
/// depth position, so `a.md` < `a/b.md` < `a/b/c.md` regardless of sibling
/// names.
pub fn ordering_key(relative_path: &str) -> Vec<(usize, String)> {
    path_key(relative_path)
        .split('/')
        .enumerate()
        .map(|(depth, component)| (depth, component.to_string()))
        .collect()
}

/// Walk the import root for markdown files (excluding the reserved readme),
/// parse each one, and return them in ancestor-first order. Document creation
/// is a single sequential pass with no retry-on-missing-parent, so this order
/// is load-bearing for the later import passes.
pub fn enumerate_documents(root: &Path) -> Result<Vec<SourceDocument>> {
    let mut documents = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|entry| entry.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
            continue;
        }
        if path.file_name().and_then(|name| name.to_str()) == Some(RESERVED_README) {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("path {} escapes import root", path.display()))?;
        let relative_path = relative.to_string_lossy().replace('\\', "/");
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let (matter, body) = frontmatter::parse(&raw);
        documents.push(SourceDocument {
            path_key: path_key(&relative_path),
            relative_path,
            matter,
            body,
        });
    }
    documents.sort_by_key(|doc| ordering_key(&doc.relative_path));
    Ok(documents)
}

/// Recursive mirror of the directory nesting. A directory may exist with no
/// corresponding document; the hierarchy builder uses this to validate parent
/// lookups before synthesizing placeholders.
#[derive(Debug, Default)]
pub struct WikiTree {
    roots: BTreeMap<String, WikiNode>,
}

#[derive(Debug, Default)]
struct WikiNode {
    children: BTreeMap<String, WikiNode>,
    has_document: bool,
}

impl WikiTree {
    pub fn build(documents: &[SourceDocument]) -> Self {
        let mut tree = Self::default();
        for doc in documents {
            let mut level = &mut tree.roots;
            let components: Vec<&str> = doc.path_key.split('/').collect();
            for (index, component) in components.iter().enumerate() {
                let node = level.entry((*component).to_string()).or_default();
                if index + 1 == components.len() {
                    node.has_document = true;
                }
                level = &mut node.children;
            }
        }
        tree
    }

    /// Whether a path key names a node in the tree, either a document or a
    /// directory on the way to one.
    pub fn contains(&self, path_key: &str) -> bool {
        let mut level = &self.roots;
        let mut node = None;
        for component in path_key.split('/') {
            match level.get(component) {
                Some(found) => {
                    level = &found.children;
                    node = Some(found);
                }
                None => return false,
            }
        }
        node.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sorted_by_key(mut paths: Vec<&str>) -> Vec<String> {
        paths.sort_by_key(|path| ordering_key(path));
        paths.into_iter().map(ToString::to_string).collect()
    }

    #[test]
    fn ancestors_sort_before_descendants() {
        let sorted = sorted_by_key(vec![
            "hw-development/hw-documentation/tests.md",
            "hw-development.md",
            "home.md",
            "hw-development/hw-documentation.md",
            "hw-development/roadmap.md",
        ]);
        assert_eq!(
            sorted,
            vec![
                "home.md",
                "hw-development.md",
                "hw-development/hw-documentation.md",
                "hw-development/hw-documentation/tests.md",
                "hw-development/roadmap.md",
            ]
        );
    }

    #[test]
    fn ordering_invariant_holds_for_generated_path_sets() {
        // Deterministic pseudo-random nested path sets; every ancestor that
        // has a document must sort strictly before each of its descendants.
        let mut state: u64 = 0x2545F491;
        let mut next = move |bound: u64| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) % bound
        };
        let segments = ["a", "b", "c", "dd", "e-f", "g_h"];

        for _ in 0..50 {
            let mut paths = Vec::new();
            for _ in 0..20 {
                let depth = next(4) as usize + 1;
                let mut components = Vec::new();
                for _ in 0..depth {
                    components.push(segments[next(segments.len() as u64) as usize]);
                }
                paths.push(format!("{}.md", components.join("/")));
            }
            paths.sort();
            paths.dedup();
            paths.sort_by_key(|path| ordering_key(path));

            let keys: Vec<String> = paths.iter().map(|path| path_key(path)).collect();
            for (child_pos, key) in keys.iter().enumerate() {
                let mut ancestor = key.as_str();
                while let Some(parent) = parent_key(ancestor) {
                    if let Some(parent_pos) = keys.iter().position(|k| k.as_str() == parent) {
                        assert!(
                            parent_pos < child_pos,
                            "{parent} must sort before {key}"
                        );
                    }
                    ancestor = parent;
                }
            }
        }
    }

    #[test]
    fn enumerate_skips_readme_and_orders_documents() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("a/b")).expect("mkdir");
        fs::write(root.join("README.md"), "ignored").expect("write");
        fs::write(root.join("a/b/c.md"), "---\ntitle: C\n---\n\nbody").expect("write");
        fs::write(root.join("a.md"), "no front matter").expect("write");

        let documents = enumerate_documents(root).expect("enumerate");
        let paths: Vec<&str> = documents
            .iter()
            .map(|doc| doc.relative_path.as_str())
            .collect();
        assert_eq!(paths, vec!["a.md", "a/b/c.md"]);
        assert_eq!(documents[1].title(), "C");
        assert_eq!(documents[1].body, "body");
        assert_eq!(documents[0].title(), "A");
    }

    #[test]
    fn title_from_segment_capitalizes_words() {
        assert_eq!(title_from_segment("hw-development"), "Hw Development");
        assert_eq!(title_from_segment("release_notes"), "Release Notes");
        assert_eq!(title_from_segment("api"), "Api");
    }

    #[test]
    fn parent_key_walks_one_level() {
        assert_eq!(parent_key("a/b/c"), Some("a/b"));
        assert_eq!(parent_key("a/b"), Some("a"));
        assert_eq!(parent_key("a"), None);
    }

    #[test]
    fn wiki_tree_contains_directories_without_documents() {
        let documents = vec![SourceDocument {
            relative_path: "a/b/c.md".to_string(),
            path_key: "a/b/c".to_string(),
            matter: FrontMatter::default(),
            body: String::new(),
        }];
        let tree = WikiTree::build(&documents);
        assert!(tree.contains("a"));
        assert!(tree.contains("a/b"));
        assert!(tree.contains("a/b/c"));
        assert!(!tree.contains("a/x"));
    }
}
