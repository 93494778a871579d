use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// A readable document exposed by a toolkit, addressed by URI
/// (e.g. "file:///path/to/file" or "str:///content").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Resource {
    /// Creates a new Resource, deriving the name from the URI path when none
    /// is given
    pub fn new<S: AsRef<str>>(uri: S, name: Option<String>) -> Result<Self> {
        let uri = uri.as_ref();
        let url = Url::parse(uri).map_err(|e| anyhow!("Invalid URI '{uri}': {e}"))?;

        let name = match name {
            Some(n) => n,
            None => url
                .path_segments()
                .and_then(|segments| segments.last())
                .filter(|segment| !segment.is_empty())
                .unwrap_or("unnamed")
                .to_string(),
        };

        Ok(Self {
            uri: uri.to_string(),
            name,
            description: None,
            mime_type: None,
        })
    }

    /// Sets the description of the resource
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the MIME type of the resource
    pub fn with_mime_type<S: Into<String>>(mut self, mime_type: S) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Returns the scheme of the URI
    pub fn scheme(&self) -> Result<String> {
        let url = Url::parse(&self.uri)?;
        Ok(url.scheme().to_string())
    }
}
