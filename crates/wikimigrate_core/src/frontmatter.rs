use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// YAML front matter in the shape Wiki.js git exports use. Unknown keys are
/// ignored; a front-matter block that fails to parse degrades to defaults
/// rather than failing the whole file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontMatter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_published")]
    pub published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
    #[serde(
        default,
        rename = "dateCreated",
        skip_serializing_if = "Option::is_none"
    )]
    pub date_created: Option<String>,
}

impl Default for FrontMatter {
    fn default() -> Self {
        Self {
            title: None,
            description: None,
            published: true,
            date: None,
            tags: Vec::new(),
            editor: None,
            date_created: None,
        }
    }
}

fn default_published() -> bool {
    true
}

/// Split a raw markdown file into front matter and body. Files without a
/// leading `---` block keep their full content as the body.
pub fn parse(raw: &str) -> (FrontMatter, String) {
    if let Some(rest) = raw.strip_prefix("---")
        && let Some(end) = rest.find("\n---")
    {
        let matter_text = &rest[..end];
        let body = &rest[end + 4..];
        let matter = serde_yaml::from_str::<FrontMatter>(matter_text).unwrap_or_default();
        return (matter, body.trim().to_string());
    }
    (FrontMatter::default(), raw.trim().to_string())
}

/// Render a front-matter block ready to prefix a markdown body.
pub fn render(matter: &FrontMatter) -> Result<String> {
    let yaml = serde_yaml::to_string(matter).context("failed to serialize front matter")?;
    Ok(format!("---\n{yaml}---\n\n"))
}
