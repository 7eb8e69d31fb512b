use crate::collaborators::{
    CommerceClient, FeedPostRequest, FeedPublisher, IdentityDirectory, ListingReceipt,
};
use crate::media::MediaSource;
use crate::models::{PendingUpload, PublishedListing};
use crate::parser::{FieldLabels, ParsedProduct, ParserOptions, ProductTextParser, ValidationFailure};
use crate::reply::{Delivery, Messenger, OutboundMessage};
use crate::state_store::ConversationStateStore;
use crate::templates;
use crate::workflow::{Recorder, RunOutcome, StepName, WorkflowTracker};
use serde::Serialize;
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where one upload attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    AwaitingImage,
    AwaitingText,
    Validating,
    CreatingListing,
    PublishingFeed,
    NotifyingSender,
    Done,
    Rejected,
    Degraded,
}

impl UploadState {
    pub fn can_transition_to(self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (AwaitingImage, AwaitingText)
                | (AwaitingImage, Validating)
                | (AwaitingText, Validating)
                | (Validating, CreatingListing)
                | (Validating, Rejected)
                | (CreatingListing, PublishingFeed)
                | (CreatingListing, Rejected)
                | (PublishingFeed, NotifyingSender)
                | (NotifyingSender, Done)
                | (NotifyingSender, Degraded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadState::Done | UploadState::Rejected | UploadState::Degraded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadState::AwaitingImage => "awaiting_image",
            UploadState::AwaitingText => "awaiting_text",
            UploadState::Validating => "validating",
            UploadState::CreatingListing => "creating_listing",
            UploadState::PublishingFeed => "publishing_feed",
            UploadState::NotifyingSender => "notifying_sender",
            UploadState::Done => "done",
            UploadState::Rejected => "rejected",
            UploadState::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("sender {0} is not a registered seller")]
    UnauthorizedSender(String),
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error("listing creation failed: {0}")]
    FatalCreation(String),
    #[error("feed publication failed for listing {listing_id}: {detail}")]
    DegradedPublish { listing_id: String, detail: String },
    #[error("pending upload was consumed by a concurrent request")]
    Conflict,
}

impl UploadError {
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::UnauthorizedSender(_) => "unauthorized_sender",
            UploadError::TransientIo(_) => "transient_io",
            UploadError::Validation(_) => "validation",
            UploadError::FatalCreation(_) => "fatal_creation",
            UploadError::DegradedPublish { .. } => "degraded_publish",
            UploadError::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    List,
}

impl Command {
    pub fn detect(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "help" | "說明" | "幫助" | "?" | "？" => Some(Command::Help),
            "list" | "列表" | "我的商品" => Some(Command::List),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    AwaitingText {
        workflow_id: Option<Uuid>,
        pending: PendingUpload,
    },
    Command(Command),
    Published {
        workflow_id: Option<Uuid>,
        listing: PublishedListing,
        state: UploadState,
    },
    Ignored,
}

pub struct Collaborators {
    pub store: Arc<dyn ConversationStateStore>,
    pub tracker: Arc<dyn WorkflowTracker>,
    pub media: Arc<dyn MediaSource>,
    pub messenger: Arc<dyn Messenger>,
    pub commerce: Arc<dyn CommerceClient>,
    pub feed: Arc<dyn FeedPublisher>,
    pub identity: Arc<dyn IdentityDirectory>,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub pending_ttl: Duration,
    pub parser: ParserOptions,
    pub labels: FieldLabels,
    pub broadcast_listings: bool,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(3600),
            parser: ParserOptions::default(),
            labels: FieldLabels::default(),
            broadcast_listings: true,
        }
    }
}

/// Serializes the requests of one sender inside this process.
#[derive(Clone, Default)]
struct SenderLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SenderLocks {
    async fn acquire(&self, sender_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut guard = self.inner.lock().await;
            // entries nobody holds or waits on
            guard.retain(|_, lock| Arc::strong_count(lock) > 1);
            guard.entry(sender_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

struct Progress<'a> {
    sender_id: &'a str,
    state: UploadState,
}

impl<'a> Progress<'a> {
    fn new(sender_id: &'a str, state: UploadState) -> Self {
        Self { sender_id, state }
    }

    fn advance(&mut self, next: UploadState) {
        if !self.state.can_transition_to(next) {
            warn!(
                target = "intake.orchestrator",
                sender = %self.sender_id,
                from = self.state.as_str(),
                to = next.as_str(),
                "unexpected_state_transition"
            );
        }
        debug!(
            target = "intake.orchestrator",
            sender = %self.sender_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "upload_state"
        );
        self.state = next;
        if next.is_terminal() {
            crate::metrics::upload_finished(next.as_str());
        }
    }
}

#[derive(Clone)]
pub struct UploadOrchestrator {
    store: Arc<dyn ConversationStateStore>,
    tracker: Arc<dyn WorkflowTracker>,
    recorder: Recorder,
    media: Arc<dyn MediaSource>,
    messenger: Arc<dyn Messenger>,
    commerce: Arc<dyn CommerceClient>,
    feed: Arc<dyn FeedPublisher>,
    identity: Arc<dyn IdentityDirectory>,
    settings: Arc<UploadSettings>,
    locks: SenderLocks,
}

impl UploadOrchestrator {
    pub fn new(collaborators: Collaborators, settings: UploadSettings) -> Self {
        Self {
            recorder: Recorder::new(collaborators.tracker.clone()),
            store: collaborators.store,
            tracker: collaborators.tracker,
            media: collaborators.media,
            messenger: collaborators.messenger,
            commerce: collaborators.commerce,
            feed: collaborators.feed,
            identity: collaborators.identity,
            settings: Arc::new(settings),
            locks: SenderLocks::default(),
        }
    }

    pub fn workflows(&self) -> &Arc<dyn WorkflowTracker> {
        &self.tracker
    }

    pub async fn handle_image(
        &self,
        sender_id: &str,
        media_id: &str,
        reply_token: Option<&str>,
    ) -> Result<Handled, UploadError> {
        if let Err(err) = self.authorize(sender_id).await {
            self.reply_for_access_error(sender_id, reply_token, &err).await;
            return Err(err);
        }
        let _guard = self.locks.acquire(sender_id).await;
        let mut progress = Progress::new(sender_id, UploadState::AwaitingImage);

        let started = Instant::now();
        let media_ref = match self.media.ingest(media_id).await {
            Ok(media_ref) => media_ref,
            Err(err) => {
                warn!(
                    target = "intake.orchestrator",
                    sender = %sender_id,
                    media_id = %media_id,
                    error = %err,
                    "media_ingest_failed"
                );
                self.send(sender_id, reply_token, vec![templates::retry_image()])
                    .await;
                return Err(UploadError::TransientIo(err.to_string()));
            }
        };
        let ingest_ms = started.elapsed().as_millis() as u64;
        crate::metrics::step_elapsed(StepName::ProcessImage.as_str(), ingest_ms);

        let run = self.recorder.start(sender_id).await;
        self.recorder
            .record(run, StepName::ReceiveImage, json!({ "media_id": media_id }))
            .await;
        self.recorder
            .record(
                run,
                StepName::ProcessImage,
                json!({ "media_ref": media_ref, "elapsed_ms": ingest_ms }),
            )
            .await;

        self.abandon_previous(sender_id, run).await;

        let workflow_id = run.unwrap_or_else(Uuid::new_v4);
        let pending = match self
            .store
            .put(sender_id, &media_ref, workflow_id, self.settings.pending_ttl)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                error!(
                    target = "intake.orchestrator",
                    sender = %sender_id,
                    error = %err,
                    "pending_upload_store_failed"
                );
                self.recorder.finish(run, RunOutcome::Abandoned).await;
                self.send(sender_id, reply_token, vec![templates::retry_image()])
                    .await;
                return Err(UploadError::TransientIo(err.to_string()));
            }
        };

        self.recorder
            .begin(run, StepName::PromptForText, Value::Null)
            .await;
        let delivery = self
            .send(sender_id, reply_token, vec![templates::prompt_for_text()])
            .await;
        self.recorder
            .complete(run, StepName::PromptForText, json!({ "delivery": delivery }))
            .await;
        progress.advance(UploadState::AwaitingText);

        info!(
            target = "intake.orchestrator",
            sender = %sender_id,
            workflow = %workflow_id,
            "image received; awaiting product text"
        );
        Ok(Handled::AwaitingText {
            workflow_id: run,
            pending,
        })
    }

    pub async fn handle_text(
        &self,
        sender_id: &str,
        text: &str,
        reply_token: Option<&str>,
    ) -> Result<Handled, UploadError> {
        if let Some(command) = Command::detect(text) {
            return self.handle_command(sender_id, command, reply_token).await;
        }

        let account_id = match self.authorize(sender_id).await {
            Ok(account_id) => account_id,
            Err(err) => {
                self.reply_for_access_error(sender_id, reply_token, &err).await;
                return Err(err);
            }
        };
        let _guard = self.locks.acquire(sender_id).await;

        let pending = match self.store.get(sender_id).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(target = "intake.orchestrator", sender = %sender_id, error = %err, "pending_upload_lookup_failed");
                None
            }
        };
        let mut progress = Progress::new(
            sender_id,
            if pending.is_some() {
                UploadState::AwaitingText
            } else {
                UploadState::AwaitingImage
            },
        );
        let resumed = match &pending {
            Some(pending) => self.recorder.open_run(pending.workflow_id).await,
            None => None,
        };
        let run = match resumed {
            Some(run) => Some(run),
            None => self.recorder.start(sender_id).await,
        };

        progress.advance(UploadState::Validating);
        self.recorder
            .begin(
                run,
                StepName::ReceiveData,
                json!({ "has_media": pending.is_some(), "chars": text.chars().count() }),
            )
            .await;

        let mut product = match ProductTextParser::new(self.settings.parser).parse(text) {
            Ok(product) => product,
            Err(failure) => {
                self.recorder
                    .fail(
                        run,
                        StepName::ReceiveData,
                        json!({
                            "missing": failure.missing_keys(),
                            "unknown_lines": failure.unknown_lines.len(),
                        }),
                    )
                    .await;
                self.recorder.finish(run, RunOutcome::Rejected).await;
                progress.advance(UploadState::Rejected);
                let message = if failure.missing.is_empty() {
                    templates::unknown_lines(&failure.unknown_lines)
                } else {
                    templates::missing_fields(&failure.missing, &self.settings.labels)
                };
                self.send(sender_id, reply_token, vec![message]).await;
                info!(
                    target = "intake.orchestrator",
                    sender = %sender_id,
                    missing = ?failure.missing_keys(),
                    "product text rejected"
                );
                return Err(UploadError::Validation(failure));
            }
        };

        if let Some(pending) = &pending {
            match self.store.take(sender_id, pending.workflow_id).await {
                Ok(true) => product.media_ref = Some(pending.media_ref.clone()),
                Ok(false) => {
                    self.recorder
                        .fail(
                            run,
                            StepName::ReceiveData,
                            json!({ "reason": "pending_upload_claimed" }),
                        )
                        .await;
                    self.recorder.finish(run, RunOutcome::Abandoned).await;
                    progress.advance(UploadState::Rejected);
                    self.send(sender_id, reply_token, vec![templates::already_processing()])
                        .await;
                    return Err(UploadError::Conflict);
                }
                Err(err) => {
                    warn!(target = "intake.orchestrator", sender = %sender_id, error = %err, "pending_upload_claim_failed");
                    product.media_ref = Some(pending.media_ref.clone());
                }
            }
        }
        self.recorder
            .complete(
                run,
                StepName::ReceiveData,
                json!({
                    "name": product.name,
                    "currency": product.currency.code(),
                    "price_minor_units": product.price_minor_units,
                    "quantity": product.quantity,
                    "media_ref": product.media_ref,
                }),
            )
            .await;

        progress.advance(UploadState::CreatingListing);
        let listing_id = match self.create_listing(run, sender_id, &product).await {
            Ok(listing_id) => listing_id,
            Err(detail) => {
                self.recorder.finish(run, RunOutcome::Rejected).await;
                progress.advance(UploadState::Rejected);
                self.send(sender_id, reply_token, vec![templates::creation_failed()])
                    .await;
                return Err(UploadError::FatalCreation(detail));
            }
        };

        progress.advance(UploadState::PublishingFeed);
        let (published, degraded) = self
            .publish_feed_post(run, &account_id, &listing_id, &product)
            .await;

        progress.advance(UploadState::NotifyingSender);
        self.recorder
            .begin(run, StepName::NotifySender, Value::Null)
            .await;
        let delivery = self
            .send(
                sender_id,
                reply_token,
                templates::confirmation(&product, &published),
            )
            .await;
        let broadcast = if self.settings.broadcast_listings {
            Some(
                self.broadcast(sender_id, &account_id, &product, &published)
                    .await,
            )
        } else {
            None
        };
        self.recorder
            .complete(
                run,
                StepName::NotifySender,
                json!({ "delivery": delivery, "broadcast": broadcast }),
            )
            .await;

        let (state, outcome) = if degraded {
            (UploadState::Degraded, RunOutcome::Degraded)
        } else {
            (UploadState::Done, RunOutcome::Done)
        };
        progress.advance(state);
        self.recorder.finish(run, outcome).await;
        info!(
            target = "intake.orchestrator",
            sender = %sender_id,
            listing_id = %published.listing_id,
            degraded,
            "listing published"
        );
        Ok(Handled::Published {
            workflow_id: run,
            listing: published,
            state,
        })
    }

    pub async fn handle_follow(&self, sender_id: &str, reply_token: Option<&str>) -> Handled {
        info!(target = "intake.orchestrator", sender = %sender_id, "follow");
        self.send(sender_id, reply_token, vec![templates::welcome()])
            .await;
        Handled::Ignored
    }

    /// Drops any half-finished upload of a sender who left.
    pub async fn handle_unfollow(&self, sender_id: &str) -> Handled {
        info!(target = "intake.orchestrator", sender = %sender_id, "unfollow");
        let _guard = self.locks.acquire(sender_id).await;
        if let Ok(Some(pending)) = self.store.get(sender_id).await {
            if let Some(run) = self.recorder.open_run(pending.workflow_id).await {
                self.recorder.finish(Some(run), RunOutcome::Abandoned).await;
            }
            if let Err(err) = self.store.delete(sender_id).await {
                warn!(target = "intake.orchestrator", sender = %sender_id, error = %err, "pending_upload_delete_failed");
            }
        }
        Handled::Ignored
    }

    async fn handle_command(
        &self,
        sender_id: &str,
        command: Command,
        reply_token: Option<&str>,
    ) -> Result<Handled, UploadError> {
        debug!(target = "intake.orchestrator", sender = %sender_id, ?command, "command");
        match command {
            Command::Help => {
                self.send(sender_id, reply_token, vec![templates::help()])
                    .await;
            }
            Command::List => {
                let account_id = match self.authorize(sender_id).await {
                    Ok(account_id) => account_id,
                    Err(err) => {
                        self.reply_for_access_error(sender_id, reply_token, &err).await;
                        return Err(err);
                    }
                };
                let message = match self.commerce.recent_listings(&account_id).await {
                    Ok(listings) => templates::recent_listings(&listings),
                    Err(err) => {
                        warn!(target = "intake.orchestrator", sender = %sender_id, error = %err, "recent_listings_failed");
                        templates::service_unavailable()
                    }
                };
                self.send(sender_id, reply_token, vec![message]).await;
            }
        }
        Ok(Handled::Command(command))
    }

    async fn authorize(&self, sender_id: &str) -> Result<String, UploadError> {
        let account = self
            .identity
            .find_account_by_chat_id(sender_id)
            .await
            .map_err(|err| UploadError::TransientIo(err.to_string()))?;
        let Some(account_id) = account else {
            return Err(UploadError::UnauthorizedSender(sender_id.to_string()));
        };
        let seller = self
            .identity
            .is_seller(&account_id)
            .await
            .map_err(|err| UploadError::TransientIo(err.to_string()))?;
        if seller {
            Ok(account_id)
        } else {
            Err(UploadError::UnauthorizedSender(sender_id.to_string()))
        }
    }

    async fn reply_for_access_error(
        &self,
        sender_id: &str,
        reply_token: Option<&str>,
        err: &UploadError,
    ) {
        let message = match err {
            UploadError::UnauthorizedSender(_) => {
                info!(target = "intake.orchestrator", sender = %sender_id, "sender is not a seller");
                templates::unauthorized_sender()
            }
            other => {
                warn!(target = "intake.orchestrator", sender = %sender_id, error = %other, "identity_lookup_failed");
                templates::service_unavailable()
            }
        };
        self.send(sender_id, reply_token, vec![message]).await;
    }

    async fn abandon_previous(&self, sender_id: &str, current: Option<Uuid>) {
        let previous = match self.store.get(sender_id).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(target = "intake.orchestrator", sender = %sender_id, error = %err, "pending_upload_lookup_failed");
                return;
            }
        };
        if let Some(previous) = previous
            && Some(previous.workflow_id) != current
            && let Some(run) = self.recorder.open_run(previous.workflow_id).await
        {
            debug!(target = "intake.orchestrator", sender = %sender_id, workflow = %run, "replacing pending upload");
            self.recorder.finish(Some(run), RunOutcome::Abandoned).await;
        }
    }

    async fn create_listing(
        &self,
        run: Option<Uuid>,
        sender_id: &str,
        product: &ParsedProduct,
    ) -> Result<String, String> {
        self.recorder
            .begin(run, StepName::CreateListing, Value::Null)
            .await;
        let started = Instant::now();
        let result = match self.commerce.create_listing(product, sender_id).await {
            Ok(ListingReceipt {
                success: true,
                listing_id: Some(listing_id),
                ..
            }) if !listing_id.trim().is_empty() => Ok(listing_id),
            Ok(receipt) => Err(receipt
                .error
                .unwrap_or_else(|| "listing rejected without id".to_string())),
            Err(err) => Err(err.to_string()),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        crate::metrics::step_elapsed(StepName::CreateListing.as_str(), elapsed_ms);
        match &result {
            Ok(listing_id) => {
                self.recorder
                    .complete(
                        run,
                        StepName::CreateListing,
                        json!({ "listing_id": listing_id, "elapsed_ms": elapsed_ms }),
                    )
                    .await;
            }
            Err(detail) => {
                error!(
                    target = "intake.orchestrator",
                    sender = %sender_id,
                    error = %detail,
                    "listing_creation_failed"
                );
                self.recorder
                    .fail(
                        run,
                        StepName::CreateListing,
                        json!({ "error": detail, "elapsed_ms": elapsed_ms }),
                    )
                    .await;
            }
        }
        result
    }

    /// Never fails the upload: the listing already exists at this point.
    /// The flag is true when the post could not be published.
    async fn publish_feed_post(
        &self,
        run: Option<Uuid>,
        account_id: &str,
        listing_id: &str,
        product: &ParsedProduct,
    ) -> (PublishedListing, bool) {
        self.recorder
            .begin(run, StepName::PublishFeedPost, Value::Null)
            .await;
        let request = FeedPostRequest {
            listing_id,
            seller_account_id: account_id,
            product,
        };
        let detail = match self.feed.publish_post(&request).await {
            Ok(receipt) if receipt.success => {
                self.recorder
                    .complete(
                        run,
                        StepName::PublishFeedPost,
                        json!({ "feed_post_id": receipt.feed_post_id, "feed_url": receipt.feed_url }),
                    )
                    .await;
                let published = PublishedListing {
                    listing_id: listing_id.to_string(),
                    feed_post_id: receipt.feed_post_id,
                    feed_url: receipt.feed_url,
                };
                return (published, false);
            }
            Ok(receipt) => receipt
                .error
                .unwrap_or_else(|| "feed post rejected".to_string()),
            Err(err) => err.to_string(),
        };

        let err = UploadError::DegradedPublish {
            listing_id: listing_id.to_string(),
            detail: detail.clone(),
        };
        warn!(
            target = "intake.orchestrator",
            listing_id = %listing_id,
            kind = err.kind(),
            error = %err,
            "feed_publish_failed"
        );
        self.recorder
            .fail(
                run,
                StepName::PublishFeedPost,
                json!({ "listing_id": listing_id, "error": detail }),
            )
            .await;
        let published = PublishedListing {
            listing_id: listing_id.to_string(),
            feed_post_id: None,
            feed_url: None,
        };
        (published, true)
    }

    async fn broadcast(
        &self,
        sender_id: &str,
        account_id: &str,
        product: &ParsedProduct,
        published: &PublishedListing,
    ) -> Delivery {
        let subscribers = match self.identity.subscribers_of(account_id).await {
            Ok(subscribers) => subscribers,
            Err(err) => {
                warn!(target = "intake.orchestrator", account = %account_id, error = %err, "subscriber_lookup_failed");
                return Delivery::Failed;
            }
        };
        let recipients: Vec<String> = subscribers
            .into_iter()
            .filter(|id| id != sender_id)
            .collect();
        if recipients.is_empty() {
            return Delivery::Sent;
        }
        self.messenger
            .multicast(&recipients, templates::broadcast(product, published))
            .await
    }

    /// Reply token when the platform gave one, push otherwise.
    async fn send(
        &self,
        sender_id: &str,
        reply_token: Option<&str>,
        messages: Vec<OutboundMessage>,
    ) -> Delivery {
        match reply_token {
            Some(token) => self.messenger.reply(token, messages).await,
            None => self.messenger.push(sender_id, messages).await,
        }
    }
}
