use crate::collaborators::{
    CollaboratorError, CommerceClient, FeedPostRequest, FeedPublisher, FeedReceipt,
    IdentityDirectory, ImageProcessor, ListingReceipt, ListingSummary, MediaHandle,
    SettingsSource,
};
use crate::config::AppConfig;
use crate::http::build_client;
use crate::parser::ParsedProduct;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::{debug, warn};

/// REST client for the host commerce platform. One instance backs every
/// collaborator trait the orchestrator needs.
#[derive(Debug, Clone)]
pub struct HostApiClient {
    base_url: String,
    api_key: Option<String>,
    notifications_fallback: bool,
    http: Client,
}

#[derive(Serialize)]
struct CreateListingBody<'a> {
    sender_id: &'a str,
    product: &'a ParsedProduct,
}

#[derive(Deserialize)]
struct AccountLookup {
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Deserialize)]
struct SellerStatus {
    is_seller: bool,
}

#[derive(Deserialize)]
struct Subscribers {
    #[serde(default)]
    chat_ids: Vec<String>,
}

#[derive(Deserialize)]
struct StoredMedia {
    media_ref: String,
}

#[derive(Deserialize)]
struct NotificationSetting {
    enabled: bool,
}

impl HostApiClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        notifications_fallback: bool,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            notifications_fallback,
            http: build_client(timeout, connect_timeout),
        }
    }

    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let base_url = config.host_api_url.as_deref()?;
        Some(Self::new(
            base_url,
            config.host_api_key.clone(),
            config.notifications_enabled,
            config.media_timeout,
            config.connect_timeout,
        ))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, CollaboratorError> {
        self.authorized(request)
            .send()
            .await
            .map_err(|err| CollaboratorError::Request(err.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CollaboratorError> {
        let response = self.send(self.http.get(self.url(path))).await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, CollaboratorError> {
    if !response.status().is_success() {
        return Err(CollaboratorError::Request(format!(
            "HTTP {}",
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|err| CollaboratorError::Deserialize(err.to_string()))
}

/// Receipts carry their own `success`/`error`; a 4xx with a receipt body is
/// a rejection, not a transport failure.
async fn decode_receipt<T: DeserializeOwned>(response: Response) -> Result<T, CollaboratorError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(CollaboratorError::Request(format!("HTTP {status}")));
    }
    let body = response
        .text()
        .await
        .map_err(|err| CollaboratorError::Request(err.to_string()))?;
    serde_json::from_str(&body).map_err(|err| {
        if status.is_success() {
            CollaboratorError::Deserialize(err.to_string())
        } else {
            CollaboratorError::Rejected(format!("HTTP {status}"))
        }
    })
}

#[async_trait]
impl CommerceClient for HostApiClient {
    async fn create_listing(
        &self,
        product: &ParsedProduct,
        sender_id: &str,
    ) -> Result<ListingReceipt, CollaboratorError> {
        let body = CreateListingBody { sender_id, product };
        let response = self
            .send(self.http.post(self.url("/listings")).json(&body))
            .await?;
        decode_receipt(response).await
    }

    async fn recent_listings(
        &self,
        account_id: &str,
    ) -> Result<Vec<ListingSummary>, CollaboratorError> {
        self.get_json(&format!(
            "/accounts/{}/listings?limit=10",
            urlencoding::encode(account_id)
        ))
        .await
    }
}

#[async_trait]
impl FeedPublisher for HostApiClient {
    async fn publish_post(
        &self,
        request: &FeedPostRequest<'_>,
    ) -> Result<FeedReceipt, CollaboratorError> {
        let response = self
            .send(self.http.post(self.url("/feed/posts")).json(request))
            .await?;
        decode_receipt(response).await
    }
}

#[async_trait]
impl IdentityDirectory for HostApiClient {
    async fn find_account_by_chat_id(
        &self,
        sender_id: &str,
    ) -> Result<Option<String>, CollaboratorError> {
        let url = self.url(&format!(
            "/identities/chat/{}",
            urlencoding::encode(sender_id)
        ));
        let response = self.send(self.http.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let lookup: AccountLookup = decode(response).await?;
        Ok(lookup.account_id.filter(|id| !id.is_empty()))
    }

    async fn is_seller(&self, account_id: &str) -> Result<bool, CollaboratorError> {
        let status: SellerStatus = self
            .get_json(&format!(
                "/accounts/{}/seller",
                urlencoding::encode(account_id)
            ))
            .await?;
        Ok(status.is_seller)
    }

    async fn subscribers_of(&self, account_id: &str) -> Result<Vec<String>, CollaboratorError> {
        let subscribers: Subscribers = self
            .get_json(&format!(
                "/accounts/{}/subscribers",
                urlencoding::encode(account_id)
            ))
            .await?;
        Ok(subscribers.chat_ids)
    }
}

#[async_trait]
impl ImageProcessor for HostApiClient {
    async fn process(&self, handle: &MediaHandle) -> Result<String, CollaboratorError> {
        let bytes = tokio::fs::read(&handle.path)
            .await
            .map_err(|err| CollaboratorError::Request(err.to_string()))?;
        let content_type = handle
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let request = self
            .http
            .post(self.url("/media"))
            .header("Content-Type", content_type)
            .header("X-Media-Id", &handle.media_id)
            .body(bytes);
        let stored: StoredMedia = decode(self.send(request).await?).await?;
        debug!(target = "intake.media", media_id = %handle.media_id, media_ref = %stored.media_ref, "media stored");
        Ok(stored.media_ref)
    }
}

#[async_trait]
impl SettingsSource for HostApiClient {
    async fn chat_notifications_enabled(&self) -> bool {
        match self
            .get_json::<NotificationSetting>("/settings/chat-notifications")
            .await
        {
            Ok(setting) => setting.enabled,
            Err(err) => {
                warn!(
                    target = "intake.reply",
                    error = %err,
                    fallback = self.notifications_fallback,
                    "settings_lookup_failed"
                );
                self.notifications_fallback
            }
        }
    }

    fn fallback(&self) -> bool {
        self.notifications_fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Currency;
    use axum::{
        Json, Router,
        body::Bytes,
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::{get, post},
    };
    use serde_json::{Value, json};
    use std::path::PathBuf;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn host() -> Router {
        Router::new()
            .route(
                "/listings",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        == Some("Bearer host-key");
                    if !authorized {
                        return (StatusCode::UNAUTHORIZED, Json(json!({})));
                    }
                    if body["product"]["name"] == "Banned" {
                        return (
                            StatusCode::UNPROCESSABLE_ENTITY,
                            Json(json!({"success": false, "error": "name rejected"})),
                        );
                    }
                    (
                        StatusCode::OK,
                        Json(json!({"success": true, "listing_id": format!("L-{}", body["sender_id"].as_str().unwrap())})),
                    )
                }),
            )
            .route(
                "/identities/chat/{id}",
                get(|Path(id): Path<String>| async move {
                    if id == "u1" {
                        (StatusCode::OK, Json(json!({"account_id": "acct-1"})))
                    } else {
                        (StatusCode::NOT_FOUND, Json(json!({})))
                    }
                }),
            )
            .route(
                "/accounts/{id}/seller",
                get(|Path(id): Path<String>| async move {
                    Json(json!({"is_seller": id == "acct-1"}))
                }),
            )
            .route(
                "/media",
                post(|headers: HeaderMap, body: Bytes| async move {
                    let id = headers
                        .get("x-media-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({"media_ref": format!("stored/{id}/{}", body.len())}))
                }),
            )
            .route(
                "/settings/chat-notifications",
                get(|| async { Json(json!({"enabled": false})) }),
            )
    }

    fn client(base: &str) -> HostApiClient {
        HostApiClient::new(
            base,
            Some("host-key".into()),
            true,
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
    }

    fn product(name: &str) -> ParsedProduct {
        ParsedProduct {
            name: name.into(),
            price_minor_units: 35_000,
            currency: Currency::Twd,
            quantity: 20,
            arrival_date: None,
            preorder_deadline: None,
            media_ref: None,
        }
    }

    #[tokio::test]
    async fn create_listing_reads_receipts() {
        let host = client(&serve(host()).await);
        let receipt = host.create_listing(&product("Keychain"), "u1").await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.listing_id.as_deref(), Some("L-u1"));

        let rejected = host.create_listing(&product("Banned"), "u1").await.unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.error.as_deref(), Some("name rejected"));
    }

    #[tokio::test]
    async fn identity_lookup_maps_not_found_to_none() {
        let host = client(&serve(host()).await);
        assert_eq!(
            host.find_account_by_chat_id("u1").await.unwrap().as_deref(),
            Some("acct-1")
        );
        assert_eq!(host.find_account_by_chat_id("stranger").await.unwrap(), None);
        assert!(host.is_seller("acct-1").await.unwrap());
        assert!(!host.is_seller("acct-2").await.unwrap());
    }

    #[tokio::test]
    async fn image_upload_posts_file_bytes() {
        let host = client(&serve(host()).await);
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("m1.bin");
        tokio::fs::write(&path, [1u8, 2, 3, 4]).await.unwrap();
        let handle = MediaHandle {
            media_id: "m1".into(),
            path,
            size: 4,
            content_type: Some("image/jpeg".into()),
        };
        assert_eq!(host.process(&handle).await.unwrap(), "stored/m1/4");
    }

    #[tokio::test]
    async fn settings_fall_back_when_host_is_down() {
        let host = client(&serve(host()).await);
        assert!(!host.chat_notifications_enabled().await);

        let offline = client("http://127.0.0.1:9");
        assert!(offline.chat_notifications_enabled().await);
        assert!(matches!(
            offline.create_listing(&product("Keychain"), "u1").await,
            Err(CollaboratorError::Request(_))
        ));
    }
}
