//! # Resource identity
//!
//! Keys naming cacheable resources and the descriptors callers hand to the
//! download manager.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a cacheable resource: a resource id plus an optional qualifier
/// (rendition, page, band, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    id: String,
    qualifier: Option<String>,
}

impl ResourceKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            qualifier: None,
        }
    }

    pub fn with_qualifier(id: impl Into<String>, qualifier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            qualifier: Some(qualifier.into()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    /// Convert to a filename-safe string
    pub fn to_filename(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        if let Some(qualifier) = &self.qualifier {
            hasher.update(":");
            hasher.update(qualifier.as_bytes());
        }

        let hash = hasher.finalize();
        format!("{hash:x}")
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(qualifier) => write!(f, "{}#{}", self.id, qualifier),
            None => f.write_str(&self.id),
        }
    }
}

impl From<&str> for ResourceKey {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceKey {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// What the manager needs to know to fetch and label a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Cache and de-duplication key
    pub key: ResourceKey,
    /// Size announced by the catalog, if known
    pub declared_size: Option<u64>,
    /// Media type of the resource
    pub media_type: Option<String>,
    /// Location consulted by location-aware retrievers
    pub uri: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(key: impl Into<ResourceKey>) -> Self {
        Self {
            key: key.into(),
            declared_size: None,
            media_type: None,
            uri: None,
        }
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }
}
