use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;

use crate::frontmatter::{self, FrontMatter};
use crate::graphql::GraphQlClient;

pub const EXPORT_MANIFEST_FILE: &str = "_export_manifest.json";
pub const FAILED_ASSETS_LOG_FILE: &str = "_failed_assets_log.md";
pub const FAILED_ASSETS_CSV_FILE: &str = "_failed_assets.csv";

/// URL prefixes Wiki.js releases have served assets under. Tried in order
/// until one returns something that is not an HTML error page.
const ASSET_PREFIXES: &[&str] = &[
    "", "/a", "/assets", "/uploads", "/files", "/content", "/media", "/static",
];

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Extension alternation for downloadable assets. Plain hrefs and markdown
/// links only count as asset references when they end in one of these;
/// anything else is a page link and stays out of the download queue.
const ASSET_EXTENSION_PATTERN: &str =
    r"png|jpe?g|gif|svg|webp|bmp|ico|pdf|zip|xml|csv|json|docx?|xlsx?|pptx?|txt|ya?ml|drawio|rar|7z";

pub struct ExportOptions {
    pub wiki_url: String,
    pub token: String,
    pub output_dir: PathBuf,
    pub assets_only: bool,
    pub page_throttle: Duration,
}

#[derive(Debug, Serialize)]
struct PageSummary {
    title: String,
    path: String,
    id: i64,
}

#[derive(Serialize)]
struct ExportManifest<'a> {
    exported_at: String,
    wiki_url: &'a str,
    page_count: usize,
    asset_success_count: usize,
    asset_failure_count: usize,
    pages: &'a [PageSummary],
}

/// Export state: which assets we still owe, which landed, and which failed
/// with what reason chain.
struct ExportSession {
    wiki_url: String,
    output_dir: PathBuf,
    client: Client,
    token: String,
    queued_assets: BTreeSet<String>,
    downloaded: BTreeSet<String>,
    failed: BTreeMap<String, Vec<String>>,
    // asset path to the pages that reference it, for the failure report
    asset_pages: BTreeMap<String, Vec<String>>,
    exported_pages: Vec<PageSummary>,
}

pub fn run_export(options: ExportOptions) -> Result<()> {
    let graphql = GraphQlClient::connect(&options.wiki_url, &options.token)?;
    fs::create_dir_all(&options.output_dir).with_context(|| {
        format!("failed to create output dir {}", options.output_dir.display())
    })?;

    let mut session = ExportSession {
        wiki_url: options.wiki_url.trim_end_matches('/').to_string(),
        output_dir: options.output_dir.clone(),
        client: Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?,
        token: options.token.clone(),
        queued_assets: BTreeSet::new(),
        downloaded: BTreeSet::new(),
        failed: BTreeMap::new(),
        asset_pages: BTreeMap::new(),
        exported_pages: Vec::new(),
    };

    if !options.assets_only {
        let pages = graphql.list_pages()?;
        println!("Found {} pages", pages.len());
        for (index, page) in pages.iter().enumerate() {
            let id = page.get("id").and_then(Value::as_i64).unwrap_or_default();
            let path = page
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            println!("[{}/{}] exporting {path}", index + 1, pages.len());
            match graphql.page_content(id, &path) {
                Ok(full) => session.export_page(&full)?,
                Err(err) => println!("  skipped: {err:#}"),
            }
            std::thread::sleep(options.page_throttle);
        }
    }

    // The asset manager sees files no page references anymore; queue those
    // too so the export is complete.
    for asset in graphql.list_assets()? {
        session.queue_asset(&asset.url_path(), None);
    }

    session.download_queued();
    session.write_reports(&options.wiki_url)?;
    println!(
        "Export complete: {} pages, {} assets, {} failures",
        session.exported_pages.len(),
        session.downloaded.len(),
        session.failed.len()
    );
    Ok(())
}

/// Pull asset reference targets out of a page body. Covers markdown images,
/// markdown file links, and raw HTML src/href attributes.
pub fn extract_asset_references(body: &str) -> Vec<String> {
    static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
        vec![
            Regex::new(r"!\[[^\]]*\]\(([^)\s]+)").expect("valid regex"),
            Regex::new(r#"<img[^>]+src\s*=\s*["']([^"']+)["']"#).expect("valid regex"),
            Regex::new(&format!(
                r#"(?i)<a[^>]+href\s*=\s*["']([^"']+\.(?:{ASSET_EXTENSION_PATTERN}))["']"#
            ))
            .expect("valid regex"),
            Regex::new(&format!(
                r"(?i)\[[^\]]+\]\(([^)\s]+\.(?:{ASSET_EXTENSION_PATTERN}))"
            ))
            .expect("valid regex"),
        ]
    });
    let mut seen = BTreeSet::new();
    let mut targets = Vec::new();
    for pattern in PATTERNS.iter() {
        for caps in pattern.captures_iter(body) {
            let target = caps[caps.len() - 1].trim().to_string();
            if seen.insert(target.clone()) {
                targets.push(target);
            }
        }
    }
    targets
}

/// A target counts as wiki-hosted when it is relative or points at the wiki
/// host or one of its subdomains.
pub fn is_wiki_hosted(target: &str, wiki_url: &str) -> bool {
    if !target.starts_with("http://") && !target.starts_with("https://") {
        return !target.starts_with("data:") && !target.starts_with("mailto:");
    }
    let (Ok(target_url), Ok(base_url)) = (Url::parse(target), Url::parse(wiki_url)) else {
        return false;
    };
    match (target_url.host_str(), base_url.host_str()) {
        (Some(target_host), Some(base_host)) => {
            target_host == base_host || target_host.ends_with(&format!(".{base_host}"))
        }
        _ => false,
    }
}

/// Normalize a reference into a site-relative asset path, or reject it.
/// Percent-encoding is decoded here so the path on disk matches what the
/// importer resolves references against.
pub fn clean_asset_path(target: &str) -> Option<String> {
    let target = target.split(['#', '?']).next().unwrap_or(target);
    let path = if target.starts_with("http://") || target.starts_with("https://") {
        Url::parse(target).ok()?.path().to_string()
    } else {
        target.to_string()
    };
    let decoded = percent_decode_str(&path)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or(path);
    // Traversal check runs after decoding so encoded dots cannot hide one.
    if decoded.contains("..") {
        return None;
    }
    let cleaned = decoded.trim_start_matches('/').to_string();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

impl ExportSession {
    fn export_page(&mut self, page: &Value) -> Result<()> {
        let path = page
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim_matches('/')
            .to_string();
        let content = page.get("content").and_then(Value::as_str).unwrap_or("");

        let file_name = match path.as_str() {
            "" => "index.md".to_string(),
            "home" => "home.md".to_string(),
            other => format!("{other}.md"),
        };
        let target = self.output_dir.join(&file_name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let matter = frontmatter_from_page(page);
        let rendered = format!("{}{content}", frontmatter::render(&matter)?);
        fs::write(&target, rendered)
            .with_context(|| format!("failed to write {}", target.display()))?;

        for reference in extract_asset_references(content) {
            if !is_wiki_hosted(&reference, &self.wiki_url) {
                continue;
            }
            if let Some(cleaned) = clean_asset_path(&reference) {
                self.queue_asset(&cleaned, Some(&file_name));
            }
        }

        self.exported_pages.push(PageSummary {
            title: page
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(&path)
                .to_string(),
            path,
            id: page.get("id").and_then(Value::as_i64).unwrap_or_default(),
        });
        Ok(())
    }

    fn queue_asset(&mut self, asset_path: &str, referencing_page: Option<&str>) {
        if asset_path.ends_with(".md") {
            return;
        }
        self.queued_assets.insert(asset_path.to_string());
        if let Some(page) = referencing_page {
            let pages = self.asset_pages.entry(asset_path.to_string()).or_default();
            if !pages.iter().any(|known| known == page) {
                pages.push(page.to_string());
            }
        }
    }

    fn download_queued(&mut self) {
        let queued: Vec<String> = self.queued_assets.iter().cloned().collect();
        println!("Downloading {} assets", queued.len());
        for asset_path in queued {
            if self.downloaded.contains(&asset_path) {
                continue;
            }
            match self.download_asset(&asset_path) {
                Ok(()) => {
                    self.downloaded.insert(asset_path);
                }
                Err(reasons) => {
                    println!("  failed: {asset_path}");
                    self.failed.insert(asset_path, reasons);
                }
            }
        }
    }

    /// Try every known serving prefix. An HTML response body means the wiki
    /// answered with an error page, which counts as a miss.
    fn download_asset(&self, asset_path: &str) -> Result<(), Vec<String>> {
        let mut reasons = Vec::new();
        for prefix in ASSET_PREFIXES {
            let url = format!("{}{prefix}/{asset_path}", self.wiki_url);
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .send();
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    reasons.push(format!("{url}: {err}"));
                    continue;
                }
            };
            if !response.status().is_success() {
                reasons.push(format!("{url}: HTTP {}", response.status()));
                continue;
            }
            let html = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.starts_with("text/html"));
            if html {
                reasons.push(format!("{url}: got an HTML page instead of the file"));
                continue;
            }
            let bytes = match response.bytes() {
                Ok(bytes) => bytes,
                Err(err) => {
                    reasons.push(format!("{url}: body read failed: {err}"));
                    continue;
                }
            };
            let target = self.output_dir.join(asset_path);
            if let Some(parent) = target.parent()
                && let Err(err) = fs::create_dir_all(parent)
            {
                reasons.push(format!("mkdir {}: {err}", parent.display()));
                continue;
            }
            return fs::write(&target, &bytes)
                .map_err(|err| vec![format!("write {}: {err}", target.display())]);
        }
        Err(reasons)
    }

    fn write_reports(&self, wiki_url: &str) -> Result<()> {
        let manifest = ExportManifest {
            exported_at: chrono::Utc::now().to_rfc3339(),
            wiki_url,
            page_count: self.exported_pages.len(),
            asset_success_count: self.downloaded.len(),
            asset_failure_count: self.failed.len(),
            pages: &self.exported_pages,
        };
        let manifest_path = self.output_dir.join(EXPORT_MANIFEST_FILE);
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .with_context(|| format!("failed to write {}", manifest_path.display()))?;

        if self.failed.is_empty() {
            return Ok(());
        }
        let log_path = self.output_dir.join(FAILED_ASSETS_LOG_FILE);
        fs::write(&log_path, self.render_failure_log())
            .with_context(|| format!("failed to write {}", log_path.display()))?;
        let csv_path = self.output_dir.join(FAILED_ASSETS_CSV_FILE);
        fs::write(&csv_path, self.render_failure_csv())
            .with_context(|| format!("failed to write {}", csv_path.display()))?;
        Ok(())
    }

    fn render_failure_log(&self) -> String {
        let mut out = String::from("# Failed Asset Downloads\n\n");
        out.push_str(&format!(
            "{} assets could not be downloaded.\n\n",
            self.failed.len()
        ));

        let mut by_page: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut orphaned: Vec<&str> = Vec::new();
        for asset in self.failed.keys() {
            match self.asset_pages.get(asset) {
                Some(pages) if !pages.is_empty() => {
                    for page in pages {
                        by_page.entry(page).or_default().push(asset);
                    }
                }
                _ => orphaned.push(asset),
            }
        }

        if !by_page.is_empty() {
            out.push_str("## By referencing page\n\n");
            for (page, assets) in &by_page {
                out.push_str(&format!("### {page}\n\n"));
                for asset in assets {
                    out.push_str(&format!("- `{asset}`\n"));
                }
                out.push('\n');
            }
        }
        if !orphaned.is_empty() {
            out.push_str("## Not referenced by any exported page\n\n");
            for asset in &orphaned {
                out.push_str(&format!("- `{asset}`\n"));
            }
            out.push('\n');
        }

        out.push_str("## All failures\n\n");
        for (asset, reasons) in &self.failed {
            out.push_str(&format!("- `{asset}`\n"));
            for reason in reasons {
                out.push_str(&format!("  - {reason}\n"));
            }
        }
        out
    }

    fn render_failure_csv(&self) -> String {
        let mut out = String::from("asset,referencing_pages,reasons\n");
        for (asset, reasons) in &self.failed {
            let pages = self
                .asset_pages
                .get(asset)
                .map(|pages| pages.join(";"))
                .unwrap_or_default();
            let reasons = reasons.join(";").replace(',', ";");
            out.push_str(&format!("{asset},{pages},{reasons}\n"));
        }
        out
    }
}

fn frontmatter_from_page(page: &Value) -> FrontMatter {
    let str_field = |key: &str| {
        page.get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    FrontMatter {
        title: str_field("title"),
        description: str_field("description"),
        published: page
            .get("isPublished")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        date: str_field("updatedAt"),
        tags: page
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|tag| {
                        tag.get("tag")
                            .and_then(Value::as_str)
                            .or_else(|| tag.as_str())
                    })
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        editor: str_field("editor"),
        date_created: str_field("createdAt"),
    }
}
