//! Microsoft Graph API Client
//!
//! Authenticated access to a single OneDrive account: folder listings,
//! content downloads and the OAuth token endpoint. The rest of the daemon
//! only sees the [`TokenExchange`] and [`DriveTransport`] traits.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::errors::RemoteError;
use super::types::TokenResponse;

/// Graph API base URL
const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Microsoft identity platform base URL
const LOGIN_BASE: &str = "https://login.microsoftonline.com";

/// Token and authorize endpoints relative to the login base
const TOKEN_PATH: &str = "/common/oauth2/v2.0/token";
const AUTHORIZE_PATH: &str = "/common/oauth2/v2.0/authorize";

/// Scopes requested at consent time
const SCOPE: &str = "files.readwrite.all offline_access";

/// Timeout for API calls (listings, token exchange)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for content downloads, which have no total deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chunked response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteError>> + Send>>;

/// OAuth grant sent to the token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    RefreshToken(String),
    AuthorizationCode(String),
}

/// Token pair issued by a successful exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Raw result of an authenticated GET
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Bytes,
}

/// An in-progress content download
pub struct Download {
    /// Upstream headers worth forwarding to the client
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Access to the OAuth token endpoint
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, grant: Grant) -> Result<IssuedTokens, RemoteError>;
}

/// Access to the drive API
#[async_trait]
pub trait DriveTransport: Send + Sync {
    /// GET `endpoint` (relative to the API base) with a bearer token
    async fn get(&self, endpoint: &str, token: &str) -> Result<RemoteResponse, RemoteError>;

    /// Open a streamed download of a pre-authenticated content URL
    async fn download(&self, url: &str) -> Result<Download, RemoteError>;
}

/// Graph API client for a single registered OAuth application
#[derive(Clone)]
pub struct GraphClient {
    /// Client for short API calls
    http_client: Client,
    /// Client for long-running downloads
    download_client: Client,
    graph_base: String,
    login_base: String,
    client_id: String,
    client_secret: String,
    redirect_url: String,
}

impl GraphClient {
    /// Create a client talking to the public Microsoft endpoints
    pub fn new(client_id: &str, client_secret: &str, redirect_url: &str) -> Result<Self, RemoteError> {
        Self::with_base_urls(GRAPH_BASE, LOGIN_BASE, client_id, client_secret, redirect_url)
    }

    /// Create a client with custom endpoints
    pub fn with_base_urls(
        graph_base: &str,
        login_base: &str,
        client_id: &str,
        client_secret: &str,
        redirect_url: &str,
    ) -> Result<Self, RemoteError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Request(format!("Failed to create HTTP client: {}", e)))?;
        let download_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            download_client,
            graph_base: graph_base.trim_end_matches('/').to_string(),
            login_base: login_base.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_url: redirect_url.to_string(),
        })
    }

    /// URL of the consent page that eventually redirects to `/authcallback`
    pub fn authorize_url(&self) -> String {
        format!(
            "{}{}?client_id={}&scope={}&response_type=code&redirect_uri={}",
            self.login_base,
            AUTHORIZE_PATH,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(SCOPE),
            urlencoding::encode(&self.redirect_url),
        )
    }

    /// Form parameters shared by every grant
    fn grant_form(&self, grant: &Grant) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("client_id", self.client_id.clone()),
            ("redirect_uri", self.redirect_url.clone()),
            ("client_secret", self.client_secret.clone()),
        ];
        match grant {
            Grant::RefreshToken(token) => {
                form.push(("refresh_token", token.clone()));
                form.push(("grant_type", "refresh_token".to_string()));
            }
            Grant::AuthorizationCode(code) => {
                form.push(("code", code.clone()));
                form.push(("grant_type", "authorization_code".to_string()));
            }
        }
        form
    }
}

#[async_trait]
impl TokenExchange for GraphClient {
    async fn exchange(&self, grant: Grant) -> Result<IssuedTokens, RemoteError> {
        let url = format!("{}{}", self.login_base, TOKEN_PATH);
        let kind = match grant {
            Grant::RefreshToken(_) => "refresh_token",
            Grant::AuthorizationCode(_) => "authorization_code",
        };
        debug!(grant = kind, "Exchanging OAuth grant");

        let response = self
            .http_client
            .post(&url)
            .form(&self.grant_form(&grant))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let payload: TokenResponse = match serde_json::from_str(&body) {
            Ok(payload) => payload,
            Err(_) if !status.is_success() => {
                return Err(RemoteError::from_status(status.as_u16(), &body))
            }
            Err(e) => return Err(RemoteError::Malformed(e.to_string())),
        };

        if let Some(error) = payload.error {
            let description = payload.error_description.unwrap_or_default();
            warn!(status = status.as_u16(), error = %error, "Token endpoint rejected grant");
            return Err(RemoteError::TokenRejected(format!("{}: {}", error, description)));
        }
        if !status.is_success() {
            return Err(RemoteError::from_status(status.as_u16(), &body));
        }

        match (payload.access_token, payload.refresh_token) {
            (Some(access_token), Some(refresh_token))
                if !access_token.is_empty() && !refresh_token.is_empty() =>
            {
                info!(
                    grant = kind,
                    access_len = access_token.len(),
                    refresh_len = refresh_token.len(),
                    "OAuth grant exchanged"
                );
                Ok(IssuedTokens {
                    access_token,
                    refresh_token,
                })
            }
            _ => Err(RemoteError::TokenRejected(format!(
                "missing access_token or refresh_token ({})",
                status
            ))),
        }
    }
}

#[async_trait]
impl DriveTransport for GraphClient {
    async fn get(&self, endpoint: &str, token: &str) -> Result<RemoteResponse, RemoteError> {
        let url = format!("{}{}", self.graph_base, endpoint);
        debug!(url = %url, "Graph GET");

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(RemoteResponse { status, body })
    }

    async fn download(&self, url: &str) -> Result<Download, RemoteError> {
        let response = self.download_client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), &body));
        }

        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| *name != CONTENT_DISPOSITION)
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(RemoteError::from))
            .boxed();

        Ok(Download {
            headers,
            content_length,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GraphClient {
        GraphClient::with_base_urls(
            &server.uri(),
            &server.uri(),
            "client-id",
            "client-secret",
            "https://example.com/authcallback",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_grant_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .and(body_string_contains("client_secret=client-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "refresh_token": "refresh-2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = client(&server)
            .exchange(Grant::RefreshToken("refresh-1".into()))
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "access-2");
        assert_eq!(tokens.refresh_token, "refresh-2");
    }

    #[tokio::test]
    async fn test_code_grant_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "a",
                "refresh_token": "r"
            })))
            .mount(&server)
            .await;

        let tokens = client(&server)
            .exchange(Grant::AuthorizationCode("abc".into()))
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "a");
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "only-access"
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .exchange(Grant::RefreshToken("r".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::TokenRejected(_)));
    }

    #[tokio::test]
    async fn test_oauth_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70000: expired"
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .exchange(Grant::RefreshToken("r".into()))
            .await
            .unwrap_err();
        match err {
            RemoteError::TokenRejected(msg) => assert!(msg.starts_with("invalid_grant")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_sends_bearer_and_returns_error_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/drive/root/children"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me/drive/root:/missing:/children"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "itemNotFound", "message": "not here"}
            })))
            .mount(&server)
            .await;

        let graph = client(&server);
        let ok = graph.get("/me/drive/root/children", "tok").await.unwrap();
        assert_eq!(ok.status, 200);

        let missing = graph
            .get("/me/drive/root:/missing:/children", "tok")
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
        assert!(String::from_utf8_lossy(&missing.body).contains("not here"));
    }

    #[tokio::test]
    async fn test_download_streams_and_drops_disposition() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/content/song.mp3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-disposition", "attachment; filename=\"song.mp3\"")
                    .insert_header("content-type", "audio/mpeg")
                    .set_body_bytes(vec![7u8; 4096]),
            )
            .mount(&server)
            .await;

        let url = format!("{}/content/song.mp3", server.uri());
        let mut download = client(&server).download(&url).await.unwrap();

        assert!(download
            .headers
            .iter()
            .all(|(name, _)| name != "content-disposition"));
        assert!(download
            .headers
            .iter()
            .any(|(name, value)| name == "content-type" && value == "audio/mpeg"));

        let mut total = 0;
        while let Some(chunk) = download.body.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 4096);
    }

    #[tokio::test]
    async fn test_download_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("expired link"))
            .mount(&server)
            .await;

        let url = format!("{}/content/x", server.uri());
        let err = client(&server).download(&url).await.err().unwrap();
        assert!(matches!(err, RemoteError::Forbidden(_)));
    }

    #[test]
    fn test_authorize_url() {
        let graph = GraphClient::new("id", "secret", "https://example.com/authcallback").unwrap();
        let url = graph.authorize_url();
        assert!(url.starts_with("https://login.microsoftonline.com/common/oauth2/v2.0/authorize?"));
        assert!(url.contains("client_id=id"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("offline_access"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fexample.com%2Fauthcallback"));
    }
}
