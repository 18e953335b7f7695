//! Graph API types and listing conversion
//!
//! Defines the subset of the `driveItem` resource the browser needs and the
//! conversion into cache-friendly [`Entry`] values.

use serde::Deserialize;

/// Folder facet, present only on folders
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: u64,
}

/// A child item from a `/children` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created_date_time: String,
    #[serde(default)]
    pub last_modified_date_time: String,
    /// Pre-authenticated, short-lived content URL (files only)
    #[serde(rename = "@microsoft.graph.downloadUrl", default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub folder: Option<FolderFacet>,
}

/// Error object returned in place of a payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Response from `GET .../children`
#[derive(Debug, Deserialize)]
pub struct DriveItems {
    #[serde(default)]
    pub value: Vec<DriveItem>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

/// Response from the OAuth token endpoint
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// A single entry of a folder listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub size: u64,
    pub created_at: String,
    pub modified_at: String,
    pub download_url: String,
    pub is_folder: bool,
    /// Number of children, folders only
    pub child_count: Option<u64>,
}

impl From<DriveItem> for Entry {
    fn from(item: DriveItem) -> Self {
        Entry {
            name: item.name,
            size: item.size,
            created_at: item.created_date_time,
            modified_at: item.last_modified_date_time,
            download_url: item.download_url.unwrap_or_default(),
            is_folder: item.folder.is_some(),
            child_count: item.folder.map(|f| f.child_count),
        }
    }
}

impl DriveItems {
    /// Convert a response into entries, or the API error message if one is present
    pub fn into_entries(self) -> Result<Vec<Entry>, String> {
        if let Some(err) = self.error {
            if !err.message.is_empty() {
                return Err(err.message);
            }
            if !err.code.is_empty() {
                return Err(err.code);
            }
        }
        Ok(self.value.into_iter().map(Entry::from).collect())
    }
}
