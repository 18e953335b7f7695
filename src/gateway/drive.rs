//! Drive Gateway
//!
//! Answers listing and file requests from the caches, going to the remote
//! API only on a miss. Token freshness is checked once per remote listing;
//! file downloads use pre-authenticated URLs taken from the listing.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::tee::tee;
use super::{FileBody, GatewayError};
use crate::auth::{Freshness, TokenCoordinator};
use crate::cache::{normalize_path, ContentCache, ListingCache, ListingSnapshot};
use crate::clock::unix_now;
use crate::graph::{DriveItems, DriveTransport, RemoteError};

/// Listing shown before an account has been connected
const NOT_READY: &str = "server is not available yet";

/// Listing shown while the token endpoint keeps failing
const TRY_LATER: &str = "please try again later";

/// Request orchestration over the caches and the remote API
pub struct DriveGateway {
    coordinator: Arc<TokenCoordinator>,
    listings: ListingCache,
    content: Arc<ContentCache>,
    transport: Arc<dyn DriveTransport>,
}

impl DriveGateway {
    pub fn new(
        coordinator: Arc<TokenCoordinator>,
        listings: ListingCache,
        content: Arc<ContentCache>,
        transport: Arc<dyn DriveTransport>,
    ) -> Self {
        Self {
            coordinator,
            listings,
            content,
            transport,
        }
    }

    pub fn coordinator(&self) -> &TokenCoordinator {
        &self.coordinator
    }

    pub fn listings(&self) -> &ListingCache {
        &self.listings
    }

    pub fn content(&self) -> &ContentCache {
        &self.content
    }

    /// List a remote folder
    ///
    /// Never fails: problems are reported inside the snapshot. Freshness
    /// failures are not cached, every remote outcome is.
    pub async fn list(&self, path: &str) -> Arc<ListingSnapshot> {
        if let Some(snapshot) = self.listings.get(path) {
            return snapshot;
        }

        match self.coordinator.ensure_fresh().await {
            Freshness::Ok => {}
            Freshness::TimedOut => {
                debug!(path = %path, "Token coordinator busy, listing with current token");
            }
            Freshness::NotInitialized => {
                return Arc::new(ListingSnapshot::failed(path, NOT_READY, unix_now()));
            }
            Freshness::RefreshFailed => {
                return Arc::new(ListingSnapshot::failed(path, TRY_LATER, unix_now()));
            }
        }

        let snapshot = self.fetch_listing(path).await;
        self.listings.put(snapshot)
    }

    async fn fetch_listing(&self, path: &str) -> ListingSnapshot {
        let endpoint = children_endpoint(path);
        let token = self.coordinator.access_token();

        let response = match self.transport.get(&endpoint, &token).await {
            Ok(response) => response,
            Err(e) => {
                warn!(path = %path, error = %e, "Listing request failed");
                return ListingSnapshot::failed(path, e.to_string(), unix_now());
            }
        };

        let items: DriveItems = match serde_json::from_slice(&response.body) {
            Ok(items) => items,
            Err(e) => {
                warn!(path = %path, status = response.status, error = %e, "Listing response is not valid JSON");
                let message = RemoteError::Malformed(e.to_string()).to_string();
                return ListingSnapshot::failed(path, message, unix_now());
            }
        };

        let failed_status = !(200..300).contains(&response.status);
        match items.into_entries() {
            Ok(_) if failed_status => {
                let body = String::from_utf8_lossy(&response.body);
                let message = RemoteError::from_status(response.status, &body).to_string();
                warn!(path = %path, status = response.status, "Listing request rejected");
                ListingSnapshot::failed(path, message, unix_now())
            }
            Ok(entries) => {
                debug!(path = %path, count = entries.len(), "Listed remote folder");
                ListingSnapshot::ok(path, entries, unix_now())
            }
            Err(message) => {
                warn!(path = %path, status = response.status, error = %message, "Listing returned an API error");
                ListingSnapshot::failed(path, message, unix_now())
            }
        }
    }

    /// Open the file `name` in folder `path`
    pub async fn open_file(&self, path: &str, name: &str) -> Result<FileBody, GatewayError> {
        let snapshot = self.list(path).await;
        if let Some(message) = &snapshot.error {
            return Err(GatewayError::Unavailable(message.clone()));
        }
        let entry = snapshot
            .file(name)
            .ok_or_else(|| GatewayError::NotFound(format!("{}{}", snapshot.path, name)))?;

        let logical = format!("{}{}", snapshot.path, name);
        let key = self.content.key_for(&logical, name);

        if self.content.touch(&key) {
            match tokio::fs::File::open(&key).await {
                Ok(file) => {
                    let len = match file.metadata().await {
                        Ok(metadata) => metadata.len(),
                        Err(_) => entry.size,
                    };
                    debug!(path = %logical, size = len, "Serving file from content cache");
                    return Ok(FileBody::Cached { file, len });
                }
                Err(e) => {
                    warn!(path = %logical, error = %e, "Cached file vanished, fetching again");
                    self.content.invalidate(&key);
                }
            }
        }

        let download = match self.transport.download(&entry.download_url).await {
            Ok(download) => download,
            Err(e) => {
                if matches!(e, RemoteError::Forbidden(_) | RemoteError::NotFound(_)) {
                    // Download URLs expire; the next listing brings a new one
                    self.listings.invalidate(&snapshot.path);
                }
                warn!(path = %logical, error = %e, "Download failed");
                return Err(GatewayError::Unavailable(e.to_string()));
            }
        };

        let sink = match self.content.begin_write(&key).await {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!(path = %logical, error = %e, "Cannot create cache file, streaming uncached");
                None
            }
        };

        info!(path = %logical, size = ?download.content_length, cached = sink.is_some(), "Fetching file");
        Ok(FileBody::Remote {
            headers: download.headers,
            content_length: download.content_length,
            body: tee(download.body, sink, self.content.clone(), download.content_length),
        })
    }

    /// Read a whole file of at most `limit` bytes, through the content cache
    pub async fn read_file(&self, path: &str, name: &str, limit: u64) -> Result<Vec<u8>, GatewayError> {
        let too_large = || GatewayError::Unavailable(format!("{} is larger than {} bytes", name, limit));
        let mut out = Vec::new();

        match self.open_file(path, name).await? {
            FileBody::Cached { mut file, len } => {
                if len > limit {
                    return Err(too_large());
                }
                file.read_to_end(&mut out)
                    .await
                    .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
            }
            FileBody::Remote { mut body, .. } => {
                while let Some(chunk) = body.next().await {
                    let chunk = chunk.map_err(|e| GatewayError::Unavailable(e.to_string()))?;
                    if out.len() as u64 + chunk.len() as u64 > limit {
                        return Err(too_large());
                    }
                    out.extend_from_slice(&chunk);
                }
            }
        }
        Ok(out)
    }

    /// Finish the OAuth consent flow with an authorization code
    pub async fn redeem_code(&self, code: &str) -> Result<(), GatewayError> {
        self.coordinator
            .redeem(code)
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        self.listings.clear();
        Ok(())
    }
}

/// Graph endpoint listing the children of a folder
fn children_endpoint(path: &str) -> String {
    let normalized = normalize_path(path);
    let trimmed = normalized.trim_matches('/');
    if trimmed.is_empty() {
        return "/me/drive/root/children".to_string();
    }

    let encoded: Vec<String> = trimmed
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("/me/drive/root:/{}:/children", encoded.join("/"))
}
