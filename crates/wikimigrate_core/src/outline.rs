use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use serde_json::{Value, json};

pub const DEFAULT_COLLECTION_NAME: &str = "WikiJS Import";
pub const DEFAULT_COLLECTION_DESCRIPTION: &str = "Migrated from WikiJS";

const SELF_TEST_TITLE: &str = "_TEST_DOC_DELETE_ME";

#[derive(Debug, Clone)]
pub struct CreatedDocument {
    pub id: String,
    pub url: Option<String>,
}

/// The slice of the Outline REST API the import passes consume. A trait seam
/// so the passes can run against an in-memory fake in tests.
pub trait Destination {
    fn create_document(&self, title: &str, text: &str, publish: bool) -> Result<CreatedDocument>;
    fn move_document(&self, document_id: &str, parent_id: Option<&str>) -> Result<()>;
    fn document_text(&self, document_id: &str) -> Result<String>;
    fn update_document(&self, document_id: &str, text: &str) -> Result<()>;
    fn delete_document(&self, document_id: &str) -> Result<()>;
    /// Two-step attachment upload: create the attachment record, then POST
    /// the bytes to the returned upload URL. Returns the attachment URL.
    fn upload_file(&self, file_name: &str, mime: &str, bytes: &[u8]) -> Result<String>;
}

/// Blocking JSON-over-HTTP client for an Outline instance, bearer-token
/// authorized. Strictly sequential; the destination rate limits aggressively.
pub struct OutlineClient {
    base_url: String,
    token: String,
    client: Client,
    collection_id: Option<String>,
}

impl OutlineClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent("wikimigrate/0.2 (import)")
            .build()
            .context("failed to build Outline HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
            collection_id: None,
        })
    }

    pub fn collection_id(&self) -> Result<&str> {
        self.collection_id
            .as_deref()
            .context("collection not initialised; call ensure_collection first")
    }

    fn post_json(&self, endpoint: &str, body: Value) -> Result<Value> {
        let url = format!("{}/api/{endpoint}", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if status.as_u16() == 401 {
            bail!(
                "authentication failed (401) at {url}; check the API token and its permissions"
            );
        }
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!(
                "{endpoint} returned HTTP {}: {}",
                status.as_u16(),
                excerpt(&text)
            );
        }
        response
            .json()
            .with_context(|| format!("invalid JSON from {endpoint}"))
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{url}", self.base_url)
        } else {
            url.to_string()
        }
    }

    pub fn list_collections(&self) -> Result<Vec<Value>> {
        let payload = self.post_json("collections.list", json!({}))?;
        Ok(payload["data"].as_array().cloned().unwrap_or_default())
    }

    pub fn create_collection(&self, name: &str, description: &str) -> Result<String> {
        let payload = self.post_json(
            "collections.create",
            json!({ "name": name, "description": description }),
        )?;
        let id = payload["data"]["id"]
            .as_str()
            .context("collections.create response missing id")?;
        Ok(id.to_string())
    }

    pub fn collection_info(&self, collection_id: &str) -> Result<Value> {
        let payload = self.post_json("collections.info", json!({ "id": collection_id }))?;
        Ok(payload["data"].clone())
    }

    /// Find the named collection or create it, and pin it for the run.
    pub fn ensure_collection(&mut self, name: &str, description: &str) -> Result<String> {
        let collections = self.list_collections()?;
        println!("Found {} collections", collections.len());
        let existing = collections.iter().find(|collection| {
            collection.get("name").and_then(Value::as_str) == Some(name)
        });
        let id = match existing {
            Some(collection) => {
                let id = collection["id"]
                    .as_str()
                    .context("collections.list entry missing id")?
                    .to_string();
                println!("Using existing collection: {name} (ID: {id})");
                id
            }
            None => {
                println!("Creating new collection '{name}'...");
                let id = self.create_collection(name, description)?;
                println!("Created collection with ID: {id}");
                id
            }
        };
        self.collection_id = Some(id.clone());
        Ok(id)
    }

    /// Create and immediately delete a throwaway document to verify the token
    /// can write into the collection. Fatal on failure; a run that cannot
    /// create documents has nothing useful to do.
    pub fn permission_self_test(&self) -> Result<()> {
        println!("Testing document creation permission...");
        let created = match Destination::create_document(self, SELF_TEST_TITLE, "Test content", true)
        {
            Ok(created) => created,
            Err(err) => {
                if let Ok(collection_id) = self.collection_id()
                    && let Ok(info) = self.collection_info(collection_id)
                {
                    let permission = info
                        .get("permission")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    println!("Collection permission: {permission}");
                }
                return Err(err.context("cannot create documents - check token permissions"));
            }
        };
        println!("Test document created (ID: {})", created.id);
        match self.delete_document(&created.id) {
            Ok(()) => println!("Test document deleted"),
            Err(err) => println!("Warning: could not delete test document: {err}"),
        }
        Ok(())
    }
}

impl Destination for OutlineClient {
    fn create_document(&self, title: &str, text: &str, publish: bool) -> Result<CreatedDocument> {
        let payload = self.post_json(
            "documents.create",
            json!({
                "title": title,
                "text": text,
                "collectionId": self.collection_id()?,
                "publish": publish,
            }),
        )?;
        let data = &payload["data"];
        let id = data["id"]
            .as_str()
            .context("documents.create response missing id")?
            .to_string();
        let url = data["url"].as_str().map(ToString::to_string);
        Ok(CreatedDocument { id, url })
    }

    fn move_document(&self, document_id: &str, parent_id: Option<&str>) -> Result<()> {
        let mut body = json!({
            "id": document_id,
            "collectionId": self.collection_id()?,
        });
        if let Some(parent_id) = parent_id {
            body["parentDocumentId"] = Value::String(parent_id.to_string());
        }
        self.post_json("documents.move", body)?;
        Ok(())
    }

    fn document_text(&self, document_id: &str) -> Result<String> {
        let payload = self.post_json("documents.info", json!({ "id": document_id }))?;
        let text = payload["data"]["text"]
            .as_str()
            .context("documents.info response missing text")?;
        Ok(text.to_string())
    }

    fn update_document(&self, document_id: &str, text: &str) -> Result<()> {
        self.post_json(
            "documents.update",
            json!({ "id": document_id, "text": text }),
        )?;
        Ok(())
    }

    fn delete_document(&self, document_id: &str) -> Result<()> {
        self.post_json("documents.delete", json!({ "id": document_id }))?;
        Ok(())
    }

    fn upload_file(&self, file_name: &str, mime: &str, bytes: &[u8]) -> Result<String> {
        let created = self.post_json(
            "attachments.create",
            json!({
                "name": file_name,
                "contentType": mime,
                "size": bytes.len(),
            }),
        )?;
        let data = &created["data"];
        let upload_url = data
            .get("uploadUrl")
            .and_then(Value::as_str)
            .context("no upload URL received")?;
        let upload_url = self.absolute_url(upload_url);

        let mut form = Form::new();
        if let Some(fields) = data.get("form").and_then(Value::as_object) {
            for (key, value) in fields {
                let text = value
                    .as_str()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| value.to_string());
                form = form.text(key.clone(), text);
            }
        }
        let part = Part::bytes(bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime)
            .with_context(|| format!("invalid MIME type {mime}"))?;
        form = form.part("file", part);

        let response = self
            .client
            .post(&upload_url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .with_context(|| format!("upload to {upload_url} failed"))?;
        let status = response.status();
        if !matches!(status.as_u16(), 200 | 201 | 204) {
            let text = response.text().unwrap_or_default();
            bail!("upload returned HTTP {}: {}", status.as_u16(), excerpt(&text));
        }

        let attachment_url = data["attachment"]["url"]
            .as_str()
            .context("no attachment URL in response")?;
        Ok(self.absolute_url(attachment_url))
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > 200 {
        let cut: String = trimmed.chars().take(200).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_url_resolves_relative_paths() {
        let client = OutlineClient::new("https://outline.example.org/", "token").expect("client");
        assert_eq!(
            client.absolute_url("/api/files.create"),
            "https://outline.example.org/api/files.create"
        );
        assert_eq!(
            client.absolute_url("https://storage.example.org/bucket"),
            "https://storage.example.org/bucket"
        );
    }

    #[test]
    fn collection_id_requires_initialisation() {
        let client = OutlineClient::new("https://outline.example.org", "token").expect("client");
        assert!(client.collection_id().is_err());
    }

    #[test]
    fn excerpt_truncates_long_bodies() {
        let long = "x".repeat(500);
        assert_eq!(excerpt(&long).len(), 203);
        assert_eq!(excerpt("  short  "), "short");
    }
}
