use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde_json::{Value, json};

const ENDPOINT_CANDIDATES: &[&str] = &["/graphql", "/api/graphql", "/gql"];
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Asset kinds to fall back on when the schema's own enum cannot be read.
const DEFAULT_ASSET_KINDS: &[&str] = &["IMAGE", "BINARY", "DOCUMENT", "VIDEO", "AUDIO", "OTHER"];

/// One asset as reported by the Wiki.js asset manager.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AssetRecord {
    pub filename: String,
    pub folder_path: String,
    pub kind: String,
}

impl AssetRecord {
    /// Site-relative path the asset is served under.
    pub fn url_path(&self) -> String {
        if self.folder_path.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.folder_path, self.filename)
        }
    }
}

/// Blocking GraphQL client bound to whichever endpoint and auth header shape
/// the probe settled on.
pub struct GraphQlClient {
    client: Client,
    endpoint: String,
    auth_header: (&'static str, String),
}

fn auth_candidates(token: &str) -> Vec<(&'static str, String)> {
    vec![
        ("Authorization", format!("Bearer {token}")),
        ("Authorization", format!("Token {token}")),
        ("X-API-Key", token.to_string()),
        ("Cookie", format!("jwt={token}")),
    ]
}

impl GraphQlClient {
    /// Probe every known endpoint path and auth header shape until one
    /// answers a trivial introspection query.
    pub fn connect(wiki_url: &str, token: &str) -> Result<Self> {
        Self::connect_with(wiki_url, token, PROBE_TIMEOUT)
    }

    /// The timeout applies to probe requests only; the client the content
    /// queries run on carries none, since a large page or a slow instance
    /// is not a failure.
    fn connect_with(wiki_url: &str, token: &str, probe_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        let base = wiki_url.trim_end_matches('/');

        for path in ENDPOINT_CANDIDATES {
            let endpoint = format!("{base}{path}");
            for (header, value) in auth_candidates(token) {
                let probe = client
                    .post(&endpoint)
                    .timeout(probe_timeout)
                    .header(header, &value)
                    .json(&json!({"query": "{ __typename }"}))
                    .send();
                let Ok(response) = probe else { continue };
                if !response.status().is_success() {
                    continue;
                }
                let Ok(body) = response.json::<Value>() else {
                    continue;
                };
                if body.get("data").is_some() {
                    println!("Connected to GraphQL at {endpoint} ({header})");
                    return Ok(Self {
                        client,
                        endpoint,
                        auth_header: (header, value),
                    });
                }
            }
        }
        bail!(
            "could not reach the Wiki.js GraphQL API at {base}\n\
             Checked paths: {}\n\
             Things to verify:\n\
             - the URL points at the wiki root, not a page\n\
             - the API key is a full JWT from Administration > API Access\n\
             - the API is enabled in the wiki's admin panel",
            ENDPOINT_CANDIDATES.join(", ")
        )
    }

    /// Run one query and return its `data` payload. GraphQL-level errors are
    /// promoted to hard failures.
    pub fn query(&self, query: &str) -> Result<Value> {
        let (header, value) = &self.auth_header;
        let response = self
            .client
            .post(&self.endpoint)
            .header(*header, value)
            .json(&json!({ "query": query }))
            .send()
            .with_context(|| format!("GraphQL request to {} failed", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            bail!("GraphQL endpoint returned {status}");
        }
        let body: Value = response.json().context("GraphQL response was not JSON")?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array)
            && !errors.is_empty()
        {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|err| err.get("message").and_then(Value::as_str))
                .collect();
            bail!("GraphQL errors: {}", messages.join("; "));
        }
        body.get("data")
            .cloned()
            .context("GraphQL response had no data field")
    }

    /// Top-level query field names, for diagnostics when page listing fails.
    pub fn schema_query_fields(&self) -> Vec<String> {
        let Ok(data) = self.query("{ __schema { queryType { fields { name } } } }") else {
            return Vec::new();
        };
        data.pointer("/__schema/queryType/fields")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|field| field.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// List all pages, trying query shapes from newest to oldest Wiki.js
    /// releases until one yields pages.
    pub fn list_pages(&self) -> Result<Vec<Value>> {
        let candidates = [
            "{ pages { list { id path title description isPublished updatedAt createdAt } } }",
            "{ pages { list { id path title } } }",
            "{ pages { search(query: \"\") { results { id path title } } } }",
            "{ pages { tree(mode: ALL, locale: \"en\") { id path title } } }",
        ];
        let mut last_error = None;
        for query in candidates {
            match self.query(query) {
                Ok(data) => {
                    let pages = pages_from_payload(&data);
                    if !pages.is_empty() {
                        return Ok(pages);
                    }
                }
                Err(err) => last_error = Some(err),
            }
        }
        let fields = self.schema_query_fields();
        let hint = if fields.is_empty() {
            String::new()
        } else {
            format!("\nAvailable query fields: {}", fields.join(", "))
        };
        match last_error {
            Some(err) => Err(err.context(format!("no page listing query succeeded{hint}"))),
            None => bail!("the wiki reported zero pages{hint}"),
        }
    }

    /// Fetch one page's full content, trying by id first and by path second.
    pub fn page_content(&self, id: i64, path: &str) -> Result<Value> {
        let candidates = [
            format!(
                "{{ pages {{ single(id: {id}) {{ id path title description content isPublished \
                 editor createdAt updatedAt tags {{ tag }} }} }} }}"
            ),
            format!("{{ pages {{ single(id: {id}) {{ id path title content }} }} }}"),
            format!("{{ page(id: {id}) {{ id path title content }} }}"),
            format!(
                "{{ pages {{ singleByPath(path: \"{path}\", locale: \"en\") \
                 {{ id path title content }} }} }}"
            ),
        ];
        let mut last_error = None;
        for query in &candidates {
            match self.query(query) {
                Ok(data) => {
                    if let Some(page) = page_from_payload(&data) {
                        return Ok(page);
                    }
                }
                Err(err) => last_error = Some(err),
            }
        }
        match last_error {
            Some(err) => Err(err.context(format!("could not fetch content for page {path}"))),
            None => bail!("page {path} came back empty from every content query"),
        }
    }

    /// Walk the asset folder tree breadth-first from the root folder and
    /// return folder id to path.
    pub fn asset_folders(&self) -> Result<BTreeMap<i64, String>> {
        let mut folders = BTreeMap::new();
        folders.insert(0, String::new());
        let mut queue = VecDeque::from([0i64]);
        while let Some(parent) = queue.pop_front() {
            let query = format!(
                "{{ assets {{ folders(parentFolderId: {parent}) {{ id name slug }} }} }}"
            );
            let Ok(data) = self.query(&query) else {
                continue;
            };
            let Some(children) = data.pointer("/assets/folders").and_then(Value::as_array) else {
                continue;
            };
            let parent_path = folders.get(&parent).cloned().unwrap_or_default();
            for child in children {
                let Some(id) = child.get("id").and_then(Value::as_i64) else {
                    continue;
                };
                let name = child
                    .get("slug")
                    .or_else(|| child.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let path = if parent_path.is_empty() {
                    name.to_string()
                } else {
                    format!("{parent_path}/{name}")
                };
                if folders.insert(id, path).is_none() {
                    queue.push_back(id);
                }
            }
        }
        Ok(folders)
    }

    /// Discover the schema's asset kind enum values from a sample query,
    /// falling back to the values every known release has shipped.
    fn asset_kinds(&self) -> Vec<String> {
        let data = self.query(
            "{ __type(name: \"AssetKind\") { enumValues { name } } }",
        );
        if let Ok(data) = data
            && let Some(values) = data.pointer("/__type/enumValues").and_then(Value::as_array)
        {
            let kinds: Vec<String> = values
                .iter()
                .filter_map(|value| value.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if !kinds.is_empty() {
                return kinds;
            }
        }
        DEFAULT_ASSET_KINDS.iter().map(|v| v.to_string()).collect()
    }

    /// Enumerate every asset across every folder, deduplicated by
    /// folder-qualified filename.
    pub fn list_assets(&self) -> Result<Vec<AssetRecord>> {
        let folders = self.asset_folders()?;
        println!("Found {} asset folders", folders.len());
        let kinds = self.asset_kinds();

        let mut seen = BTreeSet::new();
        let mut assets = Vec::new();
        for (folder_id, folder_path) in &folders {
            // Unfiltered first; ALL is not accepted by every release, so the
            // per-kind sweep below covers the rest.
            let mut queries = vec![format!(
                "{{ assets {{ list(folderId: {folder_id}, kind: ALL) {{ filename kind }} }} }}"
            )];
            for kind in &kinds {
                queries.push(format!(
                    "{{ assets {{ list(folderId: {folder_id}, kind: {kind}) {{ filename kind }} }} }}"
                ));
            }
            for query in queries {
                let Ok(data) = self.query(&query) else {
                    continue;
                };
                let Some(list) = data.pointer("/assets/list").and_then(Value::as_array) else {
                    continue;
                };
                for entry in list {
                    let Some(filename) = entry.get("filename").and_then(Value::as_str) else {
                        continue;
                    };
                    let record = AssetRecord {
                        filename: filename.to_string(),
                        folder_path: folder_path.clone(),
                        kind: entry
                            .get("kind")
                            .and_then(Value::as_str)
                            .unwrap_or("UNKNOWN")
                            .to_string(),
                    };
                    if seen.insert(record.url_path()) {
                        assets.push(record);
                    }
                }
            }
        }
        Ok(assets)
    }
}

/// Pull page entries out of whatever shape the listing query returned.
pub fn pages_from_payload(data: &Value) -> Vec<Value> {
    let candidates = [
        data.pointer("/pages/list"),
        data.pointer("/pages/search/results"),
        data.pointer("/pages/tree"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(list) = candidate.as_array()
            && !list.is_empty()
        {
            return list.clone();
        }
    }
    if let Some(list) = data.as_array() {
        return list.clone();
    }
    Vec::new()
}

/// Pull a single page object out of a content query response.
pub fn page_from_payload(data: &Value) -> Option<Value> {
    let page = data
        .pointer("/pages/single")
        .or_else(|| data.pointer("/pages/singleByPath"))
        .or_else(|| data.pointer("/page"))?;
    if page.is_null() { None } else { Some(page.clone()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_extraction_handles_list_shape() {
        let data = json!({"pages": {"list": [{"id": 1, "path": "home"}]}});
        let pages = pages_from_payload(&data);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0]["path"], "home");
    }

    #[test]
    fn payload_extraction_handles_search_and_tree_shapes() {
        let search = json!({"pages": {"search": {"results": [{"id": 2}]}}});
        assert_eq!(pages_from_payload(&search).len(), 1);
        let tree = json!({"pages": {"tree": [{"id": 3}, {"id": 4}]}});
        assert_eq!(pages_from_payload(&tree).len(), 2);
    }

    #[test]
    fn empty_payloads_yield_no_pages() {
        assert!(pages_from_payload(&json!({"pages": {"list": []}})).is_empty());
        assert!(pages_from_payload(&json!({})).is_empty());
    }

    #[test]
    fn single_page_extraction_rejects_null() {
        let hit = json!({"pages": {"single": {"id": 7, "content": "# Hi"}}});
        assert_eq!(page_from_payload(&hit).expect("page")["id"], 7);
        let miss = json!({"pages": {"single": null}});
        assert!(page_from_payload(&miss).is_none());
    }

    #[test]
    fn single_page_extraction_handles_bare_page_shape() {
        let hit = json!({"page": {"id": 9, "content": "# Hello"}});
        assert_eq!(page_from_payload(&hit).expect("page")["id"], 9);
        assert!(page_from_payload(&json!({"page": null})).is_none());
    }

    #[test]
    fn probe_times_out_against_a_silent_server() {
        // A listener that never answers: the bounded per-request timeout has
        // to fail every probe instead of hanging the connection attempt.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        let started = std::time::Instant::now();
        let result = GraphQlClient::connect_with(&url, "token", Duration::from_millis(50));
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn asset_url_paths_join_folder_and_name() {
        let rooted = AssetRecord {
            filename: "logo.png".into(),
            folder_path: String::new(),
            kind: "IMAGE".into(),
        };
        assert_eq!(rooted.url_path(), "logo.png");
        let nested = AssetRecord {
            filename: "chart.png".into(),
            folder_path: "reports/2024".into(),
            kind: "IMAGE".into(),
        };
        assert_eq!(nested.url_path(), "reports/2024/chart.png");
    }

    #[test]
    fn auth_candidates_cover_all_header_shapes() {
        let candidates = auth_candidates("tok");
        assert_eq!(candidates.len(), 4);
        assert_eq!(candidates[0], ("Authorization", "Bearer tok".to_string()));
        assert_eq!(candidates[3], ("Cookie", "jwt=tok".to_string()));
    }
}
