//! Narrow interfaces to systems that live outside this service.

use crate::parser::ParsedProduct;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListingReceipt {
    pub success: bool,
    #[serde(default)]
    pub listing_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListingSummary {
    pub listing_id: String,
    pub name: String,
    #[serde(default)]
    pub price_label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedPostRequest<'a> {
    pub listing_id: &'a str,
    pub seller_account_id: &'a str,
    pub product: &'a ParsedProduct,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedReceipt {
    pub success: bool,
    #[serde(default)]
    pub feed_post_id: Option<String>,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A downloaded media asset waiting in the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub media_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait CommerceClient: Send + Sync {
    async fn create_listing(
        &self,
        product: &ParsedProduct,
        sender_id: &str,
    ) -> Result<ListingReceipt, CollaboratorError>;

    async fn recent_listings(
        &self,
        account_id: &str,
    ) -> Result<Vec<ListingSummary>, CollaboratorError>;
}

#[async_trait]
pub trait FeedPublisher: Send + Sync {
    async fn publish_post(
        &self,
        request: &FeedPostRequest<'_>,
    ) -> Result<FeedReceipt, CollaboratorError>;
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn find_account_by_chat_id(
        &self,
        sender_id: &str,
    ) -> Result<Option<String>, CollaboratorError>;

    async fn is_seller(&self, account_id: &str) -> Result<bool, CollaboratorError>;

    /// Chat identities subscribed to the seller's audience.
    async fn subscribers_of(&self, account_id: &str) -> Result<Vec<String>, CollaboratorError>;
}

#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Takes ownership of the scratch file's content and returns the stored media reference.
    async fn process(&self, handle: &MediaHandle) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn chat_notifications_enabled(&self) -> bool;

    /// Value assumed when a lookup does not answer in time.
    fn fallback(&self) -> bool {
        true
    }
}

/// Fixed flag, used when the host platform's settings are not reachable.
pub struct StaticSettings(pub bool);

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn chat_notifications_enabled(&self) -> bool {
        self.0
    }

    fn fallback(&self) -> bool {
        self.0
    }
}
