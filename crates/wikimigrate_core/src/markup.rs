use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::{Captures, Regex};

use crate::attachments::AttachmentStore;

/// Non-image extensions that Wiki.js serves as downloadable assets. Plain
/// markdown links pointing at these get the same upload-and-rewrite
/// treatment as images.
pub const FILE_LINK_EXTENSIONS: &[&str] = &[
    "xml", "txt", "csv", "json", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "zip", "rar",
    "7z", "yaml", "yml", "drawio",
];

/// Full transformation pass over a document body. Order matters: callouts
/// first so their inner image references still look like plain markdown,
/// then images, then file links.
pub fn transform_body(
    body: &str,
    doc_relative_path: &str,
    root: &Path,
    store: &mut dyn AttachmentStore,
) -> String {
    let body = convert_callout_blocks(body);
    let body = rewrite_images(&body, doc_relative_path, root, store);
    rewrite_file_links(&body, doc_relative_path, root, store)
}

fn callout_kind(class: &str) -> &'static str {
    match class {
        "is-warning" | "is-danger" => "warning",
        "is-success" => "tip",
        _ => "info",
    }
}

/// Convert Wiki.js `{.is-*}` callout annotations into fenced `:::kind`
/// callouts. Handles both the blockquote form and the bare-line form.
pub fn convert_callout_blocks(body: &str) -> String {
    static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)((?:^>.*\n?)+)[ \t]*\{\.(is-[a-z0-9-]+)\}").expect("valid regex")
    });
    static INLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^([^\n>][^\n]*?)[ \t]*\{\.(is-[a-z0-9-]+)\}[ \t]*$").expect("valid regex")
    });

    let body = BLOCK_RE.replace_all(body, |caps: &Captures| {
        let kind = callout_kind(&caps[2]);
        let content = caps[1]
            .lines()
            .map(|line| {
                line.strip_prefix("> ")
                    .or_else(|| line.strip_prefix('>'))
                    .unwrap_or(line)
                    .trim_end()
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(":::{kind}\n{}\n:::", content.trim())
    });
    INLINE_RE
        .replace_all(&body, |caps: &Captures| {
            let kind = callout_kind(&caps[2]);
            format!(":::{kind}\n{}\n:::", caps[1].trim())
        })
        .into_owned()
}

/// Strip a trailing Wiki.js size suffix (`=500x300`, `=40%x`, `=x200`, ...)
/// from an image target.
pub fn strip_size_suffix(target: &str) -> String {
    static SIZE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s*=(?:\d+%?)?x?\d*%?\s*$").expect("valid regex"));
    match SIZE_RE.find(target) {
        // Bare targets with no digits after '=' are not size suffixes.
        Some(found) if found.as_str().trim_start().len() > 1 => {
            target[..found.start()].trim_end().to_string()
        }
        _ => target.trim_end().to_string(),
    }
}

fn decode(target: &str) -> String {
    percent_decode_str(target)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| target.to_string())
}

/// Map a reference target to a local path: absolute targets resolve from the
/// export root, relative ones from the referencing document's directory.
pub fn resolve_reference(target: &str, doc_relative_path: &str, root: &Path) -> PathBuf {
    let decoded = decode(target);
    if let Some(stripped) = decoded.strip_prefix('/') {
        root.join(stripped)
    } else {
        let parent = Path::new(doc_relative_path)
            .parent()
            .unwrap_or_else(|| Path::new(""));
        root.join(parent).join(decoded)
    }
}

fn is_external(target: &str) -> bool {
    target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("data:")
        || target.starts_with("mailto:")
}

/// Rewrite markdown and HTML image references to uploaded URLs. References
/// that are external, missing on disk, or rejected by the store are left
/// byte-for-byte unchanged.
pub fn rewrite_images(
    body: &str,
    doc_relative_path: &str,
    root: &Path,
    store: &mut dyn AttachmentStore,
) -> String {
    static MD_IMAGE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").expect("valid regex"));
    static HTML_IMG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<img[^>]+>").expect("valid regex"));
    static SRC_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"src\s*=\s*["']([^"']+)["']"#).expect("valid regex"));
    static ALT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"alt\s*=\s*["']([^"']*)["']"#).expect("valid regex"));
    static WIDTH_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"width\s*=\s*["']?(\d+)"#).expect("valid regex"));
    static HEIGHT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"height\s*=\s*["']?(\d+)"#).expect("valid regex"));

    let body = MD_IMAGE_RE.replace_all(body, |caps: &Captures| {
        let alt = &caps[1];
        let target = strip_size_suffix(caps[2].trim());
        match upload_local(&target, doc_relative_path, root, store) {
            Some(url) => format!("![{alt}]({url})"),
            None => caps[0].to_string(),
        }
    });

    HTML_IMG_RE
        .replace_all(&body, |caps: &Captures| {
            let tag = &caps[0];
            let Some(src) = SRC_RE.captures(tag).map(|src| src[1].to_string()) else {
                return tag.to_string();
            };
            match upload_local(&src, doc_relative_path, root, store) {
                Some(url) => {
                    let alt = ALT_RE
                        .captures(tag)
                        .map(|alt| alt[1].to_string())
                        .unwrap_or_default();
                    // Dimensions fold into the alt text since fenced markdown
                    // has nowhere else to carry them.
                    let width = WIDTH_RE.captures(tag).map(|w| w[1].to_string());
                    let height = HEIGHT_RE.captures(tag).map(|h| h[1].to_string());
                    let alt = match (width, height) {
                        (Some(w), Some(h)) => format!("{alt} ({w}x{h})"),
                        (Some(w), None) => format!("{alt} (width {w})"),
                        (None, Some(h)) => format!("{alt} (height {h})"),
                        (None, None) => alt,
                    };
                    format!("![{}]({url})", alt.trim())
                }
                None => tag.to_string(),
            }
        })
        .into_owned()
}

/// Rewrite `[label](path.ext)` links whose extension marks them as hosted
/// files rather than wiki pages.
pub fn rewrite_file_links(
    body: &str,
    doc_relative_path: &str,
    root: &Path,
    store: &mut dyn AttachmentStore,
) -> String {
    static FILE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
        let extensions = FILE_LINK_EXTENSIONS.join("|");
        Regex::new(&format!(
            r"(?i)\[([^\]]+)\]\(([^)\s]+\.(?:{extensions}))(?:\s*=[^)]*)?\)"
        ))
        .expect("valid regex")
    });

    FILE_LINK_RE
        .replace_all(body, |caps: &Captures| {
            let label = &caps[1];
            match upload_local(&caps[2], doc_relative_path, root, store) {
                Some(url) => format!("[{label}]({url})"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn upload_local(
    target: &str,
    doc_relative_path: &str,
    root: &Path,
    store: &mut dyn AttachmentStore,
) -> Option<String> {
    if is_external(target) {
        return None;
    }
    let local = resolve_reference(target, doc_relative_path, root);
    if !local.exists() {
        return None;
    }
    store.upload(&local, doc_relative_path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::UploadError;
    use std::fs;
    use tempfile::tempdir;

    /// Store fake that "uploads" every file it is handed, or rejects all.
    struct StubStore {
        uploaded: Vec<PathBuf>,
        reject: bool,
    }

    impl StubStore {
        fn new() -> Self {
            Self {
                uploaded: Vec::new(),
                reject: false,
            }
        }
    }

    impl AttachmentStore for StubStore {
        fn upload(&mut self, file: &Path, _doc: &str) -> Result<String, UploadError> {
            if self.reject {
                return Err(UploadError::Rejected {
                    path: file.to_path_buf(),
                    reasons: vec!["rejected".to_string()],
                });
            }
            self.uploaded.push(file.to_path_buf());
            let name = file.file_name().unwrap().to_str().unwrap();
            Ok(format!("https://files.example.org/{name}"))
        }
    }

    #[test]
    fn blockquote_callouts_become_fences() {
        let body = "> Careful with this step.\n> It bites.\n{.is-warning}\n\ntext";
        let converted = convert_callout_blocks(body);
        assert_eq!(
            converted,
            ":::warning\nCareful with this step.\nIt bites.\n:::\n\ntext"
        );
    }

    #[test]
    fn inline_callout_classes_map_to_kinds() {
        assert_eq!(
            convert_callout_blocks("All good {.is-success}"),
            ":::tip\nAll good\n:::"
        );
        assert_eq!(
            convert_callout_blocks("Note this {.is-info}"),
            ":::info\nNote this\n:::"
        );
        assert_eq!(
            convert_callout_blocks("Danger zone {.is-danger}"),
            ":::warning\nDanger zone\n:::"
        );
    }

    #[test]
    fn size_suffixes_strip_exactly() {
        assert_eq!(strip_size_suffix("diagram.png =500x300"), "diagram.png");
        assert_eq!(strip_size_suffix("icon.svg =40%x"), "icon.svg");
        assert_eq!(strip_size_suffix("photo.jpg =x200"), "photo.jpg");
        assert_eq!(strip_size_suffix("plain.png"), "plain.png");
        assert_eq!(strip_size_suffix("odd=name.png"), "odd=name.png");
    }

    #[test]
    fn absolute_and_relative_references_resolve() {
        let root = Path::new("/export");
        assert_eq!(
            resolve_reference("/assets/logo.png", "team/about.md", root),
            Path::new("/export/assets/logo.png")
        );
        assert_eq!(
            resolve_reference("img/chart.png", "team/about.md", root),
            Path::new("/export/team/img/chart.png")
        );
        assert_eq!(
            resolve_reference("my%20file.pdf", "a.md", root),
            Path::new("/export/my file.pdf")
        );
    }

    #[test]
    fn local_images_rewrite_to_uploaded_urls() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("assets")).expect("mkdir");
        fs::write(temp.path().join("assets/logo.png"), [0u8]).expect("write");

        let mut store = StubStore::new();
        let body = "intro\n\n![Logo](/assets/logo.png =200x100)\n";
        let rewritten = rewrite_images(body, "team/about.md", temp.path(), &mut store);
        assert_eq!(
            rewritten,
            "intro\n\n![Logo](https://files.example.org/logo.png)\n"
        );
        assert_eq!(store.uploaded.len(), 1);
    }

    #[test]
    fn external_and_missing_images_are_untouched() {
        let temp = tempdir().expect("tempdir");
        let mut store = StubStore::new();
        let body = "![a](https://elsewhere.example/x.png)\n![b](/assets/gone.png)\n";
        let rewritten = rewrite_images(body, "a.md", temp.path(), &mut store);
        assert_eq!(rewritten, body);
        assert!(store.uploaded.is_empty());
    }

    #[test]
    fn rejected_uploads_leave_the_reference_alone() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("logo.png"), [0u8]).expect("write");
        let mut store = StubStore::new();
        store.reject = true;
        let body = "![Logo](/logo.png)";
        assert_eq!(rewrite_images(body, "a.md", temp.path(), &mut store), body);
    }

    #[test]
    fn html_img_dimensions_fold_into_alt() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("chart.png"), [0u8]).expect("write");
        let mut store = StubStore::new();
        let body = r#"<img src="/chart.png" alt="Quarterly" width="640" height="480">"#;
        let rewritten = rewrite_images(body, "a.md", temp.path(), &mut store);
        assert_eq!(
            rewritten,
            "![Quarterly (640x480)](https://files.example.org/chart.png)"
        );
    }

    #[test]
    fn file_links_rewrite_like_images() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("datasheet.pdf"), [0u8]).expect("write");
        let mut store = StubStore::new();
        let body = "See [the datasheet](/datasheet.pdf) and [a page](/guides/intro).";
        let rewritten = rewrite_file_links(body, "a.md", temp.path(), &mut store);
        assert_eq!(
            rewritten,
            "See [the datasheet](https://files.example.org/datasheet.pdf) and [a page](/guides/intro)."
        );
    }

    #[test]
    fn transform_runs_callouts_before_uploads() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("warn.png"), [0u8]).expect("write");
        let mut store = StubStore::new();
        let body = "> ![icon](/warn.png)\n{.is-danger}";
        let transformed = transform_body(body, "a.md", temp.path(), &mut store);
        assert_eq!(
            transformed,
            ":::warning\n![icon](https://files.example.org/warn.png)\n:::"
        );
    }
}
