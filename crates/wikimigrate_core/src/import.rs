use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use regex::{Captures, Regex};

use crate::attachments::AttachmentPipeline;
use crate::log::{LogCategory, LogDetail, LogStatus, MigrationLog};
use crate::markup;
use crate::outline::Destination;
use crate::source::{self, SourceDocument, WikiTree, parent_key, title_from_segment};

/// Nesting guard for parent resolution; real wikis never get close.
const MAX_HIERARCHY_DEPTH: usize = 64;

pub struct ImportOptions {
    pub wiki_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub document_throttle: Duration,
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub documents_created: usize,
    pub documents_failed: usize,
    pub placeholders_created: usize,
    pub moves_failed: usize,
    pub crosslinks_rewritten: usize,
}

/// One import run against a destination. Holds the path-to-id map that the
/// hierarchy and crosslink passes both depend on.
pub struct ImportSession<'a> {
    destination: &'a dyn Destination,
    wiki_dir: PathBuf,
    max_upload_bytes: u64,
    throttle: Duration,
    document_map: BTreeMap<String, String>,
    log: MigrationLog,
    summary: ImportSummary,
}

impl<'a> ImportSession<'a> {
    pub fn new(destination: &'a dyn Destination, options: ImportOptions) -> Self {
        Self {
            destination,
            wiki_dir: options.wiki_dir,
            max_upload_bytes: options.max_upload_bytes,
            throttle: options.document_throttle,
            document_map: BTreeMap::new(),
            log: MigrationLog::default(),
            summary: ImportSummary::default(),
        }
    }

    pub fn run(mut self) -> Result<ImportSummary> {
        let documents = source::enumerate_documents(&self.wiki_dir)?;
        println!("Found {} documents to import", documents.len());
        for doc in documents.iter().take(10) {
            println!("  {}", doc.relative_path);
        }
        if documents.len() > 10 {
            println!("  ... and {} more", documents.len() - 10);
        }

        let tree = WikiTree::build(&documents);
        self.create_documents(&documents);
        self.organize_hierarchy(&documents, &tree);
        self.rewrite_crosslinks(&documents);
        self.log.write_reports(&self.wiki_dir)?;
        Ok(self.summary)
    }

    /// First pass: every document is created flat in the collection. Parents
    /// are sorted first, so by the time a child fails to find its parent the
    /// cause is a genuine creation failure, not ordering.
    fn create_documents(&mut self, documents: &[SourceDocument]) {
        println!("\nCreating {} documents", documents.len());
        for (index, doc) in documents.iter().enumerate() {
            println!(
                "[{}/{}] {}",
                index + 1,
                documents.len(),
                doc.relative_path
            );
            let mut pipeline =
                AttachmentPipeline::new(self.destination, self.max_upload_bytes, &mut self.log);
            let body = markup::transform_body(
                &doc.body,
                &doc.relative_path,
                &self.wiki_dir,
                &mut pipeline,
            );
            match self
                .destination
                .create_document(&doc.title(), &body, doc.matter.published)
            {
                Ok(created) => {
                    self.log.record(
                        &doc.relative_path,
                        LogCategory::Document,
                        LogStatus::Success,
                        "created document",
                        LogDetail::id(&created.id),
                    );
                    self.document_map.insert(doc.path_key.clone(), created.id);
                    self.summary.documents_created += 1;
                }
                Err(err) => {
                    self.log.record(
                        &doc.relative_path,
                        LogCategory::Document,
                        LogStatus::Failed,
                        format!("create failed: {err:#}"),
                        LogDetail::default(),
                    );
                    self.summary.documents_failed += 1;
                }
            }
            std::thread::sleep(self.throttle);
        }
    }

    /// Second pass: move documents under their parents, creating placeholder
    /// parents for paths that exist only as directories.
    fn organize_hierarchy(&mut self, documents: &[SourceDocument], tree: &WikiTree) {
        println!("\nOrganizing hierarchy");
        for doc in documents {
            let Some(parent) = parent_key(&doc.path_key).map(str::to_string) else {
                continue;
            };
            let Some(doc_id) = self.document_map.get(&doc.path_key).cloned() else {
                continue;
            };
            match self.resolve_parent(&parent, tree, 0) {
                Ok(Some(parent_id)) => {
                    match self.destination.move_document(&doc_id, Some(&parent_id)) {
                        Ok(()) => self.log.record(
                            &doc.relative_path,
                            LogCategory::Move,
                            LogStatus::Success,
                            format!("moved under {parent}"),
                            LogDetail::id(&parent_id),
                        ),
                        Err(err) => {
                            self.summary.moves_failed += 1;
                            self.log.record(
                                &doc.relative_path,
                                LogCategory::Move,
                                LogStatus::Failed,
                                format!("move failed: {err:#}"),
                                LogDetail::id(&parent_id),
                            );
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    self.summary.moves_failed += 1;
                    self.log.record(
                        &doc.relative_path,
                        LogCategory::Move,
                        LogStatus::Failed,
                        format!("parent resolution failed: {err:#}"),
                        LogDetail::default(),
                    );
                }
            }
        }
    }

    /// Resolve a parent path key to a document id, synthesizing placeholder
    /// documents up the chain as needed. Returns None when the path does not
    /// belong to the imported tree at all.
    fn resolve_parent(
        &mut self,
        parent_key: &str,
        tree: &WikiTree,
        depth: usize,
    ) -> Result<Option<String>> {
        if depth > MAX_HIERARCHY_DEPTH {
            anyhow::bail!("hierarchy deeper than {MAX_HIERARCHY_DEPTH} at {parent_key}");
        }
        if let Some(id) = self.document_map.get(parent_key) {
            return Ok(Some(id.clone()));
        }
        if !tree.contains(parent_key) {
            return Ok(None);
        }

        // The path exists only as a directory; synthesize a placeholder and
        // hang it under its own parent first.
        let grandparent_id = match parent_key.rsplit_once('/') {
            Some((grandparent, _)) => self.resolve_parent(grandparent, tree, depth + 1)?,
            None => None,
        };
        let segment = parent_key.rsplit('/').next().unwrap_or(parent_key);
        let title = title_from_segment(segment);
        let body = format!(
            "# {title}\n\nThis page was automatically created to maintain the imported hierarchy.\n"
        );
        let created = self.destination.create_document(&title, &body, true)?;
        if let Some(grandparent_id) = grandparent_id {
            self.destination
                .move_document(&created.id, Some(&grandparent_id))?;
        }
        self.log.record(
            parent_key,
            LogCategory::Document,
            LogStatus::Success,
            "created placeholder parent",
            LogDetail::id(&created.id),
        );
        self.document_map
            .insert(parent_key.to_string(), created.id.clone());
        self.summary.placeholders_created += 1;
        std::thread::sleep(self.throttle);
        Ok(Some(created.id))
    }

    /// Third pass: re-read every created document and point internal wiki
    /// links at their new document URLs. Iterates the source documents so
    /// log entries share the file key used by the earlier passes; synthetic
    /// placeholders have no wiki links and are skipped by construction.
    fn rewrite_crosslinks(&mut self, documents: &[SourceDocument]) {
        println!("\nRewriting cross-links");
        for doc in documents {
            let Some(doc_id) = self.document_map.get(&doc.path_key).cloned() else {
                continue;
            };
            let text = match self.destination.document_text(&doc_id) {
                Ok(text) => text,
                Err(err) => {
                    self.log.record(
                        &doc.relative_path,
                        LogCategory::Crosslinks,
                        LogStatus::Failed,
                        format!("fetch failed: {err:#}"),
                        LogDetail::id(&doc_id),
                    );
                    continue;
                }
            };
            let (rewritten, count) = rewrite_crosslinks_text(&text, &self.document_map);
            if count == 0 {
                continue;
            }
            match self.destination.update_document(&doc_id, &rewritten) {
                Ok(()) => {
                    self.summary.crosslinks_rewritten += count;
                    self.log.record(
                        &doc.relative_path,
                        LogCategory::Crosslinks,
                        LogStatus::Success,
                        format!("rewrote {count} links"),
                        LogDetail::id(&doc_id),
                    );
                }
                Err(err) => self.log.record(
                    &doc.relative_path,
                    LogCategory::Crosslinks,
                    LogStatus::Failed,
                    format!("update failed: {err:#}"),
                    LogDetail::id(&doc_id),
                ),
            }
            std::thread::sleep(self.throttle);
        }
    }
}

/// Rewrite `[label](/path)` and `[label](/en/path)` links whose target is a
/// migrated document. Returns the new text and how many links changed.
pub fn rewrite_crosslinks_text(
    text: &str,
    document_map: &BTreeMap<String, String>,
) -> (String, usize) {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("valid regex"));

    let mut count = 0;
    let rewritten = LINK_RE.replace_all(text, |caps: &Captures| {
        let label = &caps[1];
        let target = caps[2].trim();
        let key = target
            .strip_prefix("/en/")
            .or_else(|| target.strip_prefix('/'))
            .map(|key| key.trim_end_matches('/'));
        match key.and_then(|key| document_map.get(key)) {
            Some(id) => {
                count += 1;
                format!("[{label}](/doc/{id})")
            }
            None => caps[0].to_string(),
        }
    });
    (rewritten.into_owned(), count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::CreatedDocument;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Debug, Clone)]
    struct FakeDoc {
        id: String,
        title: String,
        text: String,
        parent: Option<String>,
    }

    #[derive(Default)]
    struct FakeDestination {
        docs: RefCell<Vec<FakeDoc>>,
        updates: RefCell<usize>,
        fail_moves: bool,
    }

    impl FakeDestination {
        fn doc(&self, id: &str) -> FakeDoc {
            self.docs
                .borrow()
                .iter()
                .find(|doc| doc.id == id)
                .cloned()
                .expect("document exists")
        }

        fn by_title(&self, title: &str) -> FakeDoc {
            self.docs
                .borrow()
                .iter()
                .find(|doc| doc.title == title)
                .cloned()
                .expect("document exists")
        }
    }

    impl Destination for FakeDestination {
        fn create_document(&self, title: &str, text: &str, _publish: bool) -> Result<CreatedDocument> {
            let mut docs = self.docs.borrow_mut();
            let id = format!("doc-{}", docs.len() + 1);
            docs.push(FakeDoc {
                id: id.clone(),
                title: title.to_string(),
                text: text.to_string(),
                parent: None,
            });
            Ok(CreatedDocument {
                id: id.clone(),
                url: Some(format!("/doc/{id}")),
            })
        }

        fn move_document(&self, id: &str, parent_id: Option<&str>) -> Result<()> {
            if self.fail_moves {
                anyhow::bail!("documents.move returned 400")
            }
            let mut docs = self.docs.borrow_mut();
            let doc = docs
                .iter_mut()
                .find(|doc| doc.id == id)
                .expect("document exists");
            doc.parent = parent_id.map(str::to_string);
            Ok(())
        }

        fn document_text(&self, id: &str) -> Result<String> {
            Ok(self.doc(id).text)
        }

        fn update_document(&self, id: &str, text: &str) -> Result<()> {
            *self.updates.borrow_mut() += 1;
            let mut docs = self.docs.borrow_mut();
            let doc = docs
                .iter_mut()
                .find(|doc| doc.id == id)
                .expect("document exists");
            doc.text = text.to_string();
            Ok(())
        }

        fn delete_document(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        fn upload_file(&self, file_name: &str, _mime: &str, _bytes: &[u8]) -> Result<String> {
            Ok(format!("https://files.example.org/{file_name}"))
        }
    }

    fn session<'a>(
        destination: &'a FakeDestination,
        wiki_dir: PathBuf,
    ) -> ImportSession<'a> {
        ImportSession::new(
            destination,
            ImportOptions {
                wiki_dir,
                max_upload_bytes: 10_000_000,
                document_throttle: Duration::ZERO,
            },
        )
    }

    #[test]
    fn nested_document_gets_placeholder_ancestors() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("guides/setup")).expect("mkdir");
        fs::write(
            temp.path().join("guides/setup/install.md"),
            "---\ntitle: Installing\n---\n\nSteps here.\n",
        )
        .expect("write");

        let destination = FakeDestination::default();
        let summary = session(&destination, temp.path().to_path_buf())
            .run()
            .expect("import");

        assert_eq!(summary.documents_created, 1);
        assert_eq!(summary.placeholders_created, 2);
        assert_eq!(summary.moves_failed, 0);

        let install = destination.by_title("Installing");
        let setup = destination.by_title("Setup");
        let guides = destination.by_title("Guides");
        assert_eq!(install.parent.as_deref(), Some(setup.id.as_str()));
        assert_eq!(setup.parent.as_deref(), Some(guides.id.as_str()));
        assert_eq!(guides.parent, None);
        assert!(setup.text.contains("automatically created"));
    }

    #[test]
    fn real_documents_are_preferred_over_placeholders() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("guides")).expect("mkdir");
        fs::write(temp.path().join("guides.md"), "# Guides overview\n").expect("write");
        fs::write(temp.path().join("guides/intro.md"), "# Intro\n").expect("write");

        let destination = FakeDestination::default();
        let summary = session(&destination, temp.path().to_path_buf())
            .run()
            .expect("import");

        // guides.md sorts before guides/intro.md, so the child hangs off the
        // real page and no placeholder is needed.
        assert_eq!(summary.documents_created, 2);
        assert_eq!(summary.placeholders_created, 0);
        let parent = destination.by_title("Guides");
        let child = destination.by_title("Intro");
        assert_eq!(child.parent.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn crosslinks_rewrite_to_document_urls() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("alpha.md"), "See [beta](/beta) and [out](https://e.org).\n")
            .expect("write");
        fs::write(temp.path().join("beta.md"), "See [alpha](/en/alpha).\n").expect("write");

        let destination = FakeDestination::default();
        let summary = session(&destination, temp.path().to_path_buf())
            .run()
            .expect("import");

        assert_eq!(summary.crosslinks_rewritten, 2);
        let alpha = destination.by_title("Alpha");
        let beta = destination.by_title("Beta");
        assert!(alpha.text.contains(&format!("[beta](/doc/{})", beta.id)));
        assert!(alpha.text.contains("[out](https://e.org)"));
        assert!(beta.text.contains(&format!("[alpha](/doc/{})", alpha.id)));
    }

    #[test]
    fn log_keys_every_pass_by_the_source_file() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("a")).expect("mkdir");
        fs::write(temp.path().join("a/b.md"), "See [a](/a/b).\n").expect("write");

        let destination = FakeDestination::default();
        session(&destination, temp.path().to_path_buf())
            .run()
            .expect("import");

        // Creation, move, and crosslink entries for one source file must
        // land under one heading, keyed by its relative path.
        let report = fs::read_to_string(temp.path().join(crate::log::MIGRATION_LOG_FILE))
            .expect("report");
        assert!(report.contains("## a/b.md"));
        assert!(!report.contains("## a/b\n"));
        let sections = report.matches("## a/b").count();
        assert_eq!(sections, 1, "report:\n{report}");
    }

    #[test]
    fn documents_without_resolvable_links_are_not_updated() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("solo.md"), "Plain text, [ext](https://e.org).\n")
            .expect("write");

        let destination = FakeDestination::default();
        session(&destination, temp.path().to_path_buf())
            .run()
            .expect("import");
        assert_eq!(*destination.updates.borrow(), 0);
    }

    #[test]
    fn move_failures_do_not_stop_the_run() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("a")).expect("mkdir");
        fs::write(temp.path().join("a.md"), "# A\n").expect("write");
        fs::write(temp.path().join("a/b.md"), "# B\n").expect("write");
        fs::write(temp.path().join("c.md"), "# C\n").expect("write");

        let destination = FakeDestination {
            fail_moves: true,
            ..FakeDestination::default()
        };
        let summary = session(&destination, temp.path().to_path_buf())
            .run()
            .expect("import");
        assert_eq!(summary.documents_created, 3);
        assert_eq!(summary.moves_failed, 1);
    }

    #[test]
    fn crosslink_rewriting_is_a_pure_text_transform() {
        let mut map = BTreeMap::new();
        map.insert("guides/intro".to_string(), "abc123".to_string());
        let (text, count) =
            rewrite_crosslinks_text("[intro](/guides/intro) and [gone](/nope)", &map);
        assert_eq!(count, 1);
        assert_eq!(text, "[intro](/doc/abc123) and [gone](/nope)");
    }
}
