use crate::collaborators::SettingsSource;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

/// Platform limit on recipients per multicast call.
const MULTICAST_CHUNK: usize = 500;
/// How long a notification-setting answer is reused across sends.
const SETTINGS_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        text: String,
    },
    Flex {
        #[serde(rename = "altText")]
        alt_text: String,
        contents: Value,
    },
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Sent,
    /// Notifications are switched off; nothing left the process.
    Suppressed,
    Failed,
}

/// Outbound chat. Sends are best effort and never error.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn reply(&self, reply_token: &str, messages: Vec<OutboundMessage>) -> Delivery;
    async fn push(&self, recipient_id: &str, messages: Vec<OutboundMessage>) -> Delivery;
    async fn multicast(&self, recipient_ids: &[String], messages: Vec<OutboundMessage>)
    -> Delivery;
}

/// The settings lookup and the send share one `timeout` budget; the lookup
/// may use at most half of it.
#[derive(Clone)]
pub struct ReplyDispatcher {
    http: Client,
    api_base: String,
    access_token: String,
    timeout: Duration,
    settings: Arc<dyn SettingsSource>,
    cached_setting: Arc<Mutex<Option<(bool, Instant)>>>,
}

impl ReplyDispatcher {
    pub fn new(
        api_base: &str,
        access_token: &str,
        settings: Arc<dyn SettingsSource>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            http: build_client(timeout, connect_timeout),
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            timeout,
            settings,
            cached_setting: Arc::new(Mutex::new(None)),
        }
    }

    async fn notifications_enabled(&self, budget: Duration) -> bool {
        let mut cached = self.cached_setting.lock().await;
        if let Some((enabled, at)) = *cached
            && at.elapsed() < SETTINGS_TTL
        {
            return enabled;
        }
        let enabled = match tokio::time::timeout(budget, self.settings.chat_notifications_enabled())
            .await
        {
            Ok(enabled) => enabled,
            Err(_) => {
                let fallback = self.settings.fallback();
                warn!(
                    target = "intake.reply",
                    budget_ms = budget.as_millis() as u64,
                    fallback,
                    "settings_lookup_timed_out"
                );
                fallback
            }
        };
        *cached = Some((enabled, Instant::now()));
        enabled
    }

    async fn send(&self, endpoint: &'static str, body: Value) -> Delivery {
        let started = Instant::now();
        if !self.notifications_enabled(self.timeout / 2).await {
            debug!(target = "intake.reply", endpoint, "chat notifications disabled; send skipped");
            return Delivery::Suppressed;
        }
        let remaining = self.timeout.saturating_sub(started.elapsed());
        let url = format!("{}/v2/bot/message/{endpoint}", self.api_base);
        match self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .timeout(remaining)
            .json(&body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Delivery::Sent,
            Ok(response) => {
                let status = response.status();
                let detail = response.text().await.unwrap_or_default();
                warn!(target = "intake.reply", endpoint, %status, detail = %detail, "chat_send_rejected");
                Delivery::Failed
            }
            Err(err) => {
                warn!(target = "intake.reply", endpoint, error = %err, "chat_send_failed");
                Delivery::Failed
            }
        }
    }
}

#[async_trait]
impl Messenger for ReplyDispatcher {
    async fn reply(&self, reply_token: &str, messages: Vec<OutboundMessage>) -> Delivery {
        self.send(
            "reply",
            json!({ "replyToken": reply_token, "messages": messages }),
        )
        .await
    }

    async fn push(&self, recipient_id: &str, messages: Vec<OutboundMessage>) -> Delivery {
        self.send("push", json!({ "to": recipient_id, "messages": messages }))
            .await
    }

    async fn multicast(
        &self,
        recipient_ids: &[String],
        messages: Vec<OutboundMessage>,
    ) -> Delivery {
        if recipient_ids.is_empty() {
            return Delivery::Sent;
        }
        let mut outcome = Delivery::Sent;
        for chunk in recipient_ids.chunks(MULTICAST_CHUNK) {
            let delivery = self
                .send("multicast", json!({ "to": chunk, "messages": messages }))
                .await;
            match delivery {
                Delivery::Suppressed => return Delivery::Suppressed,
                Delivery::Failed => outcome = Delivery::Failed,
                Delivery::Sent => {}
            }
        }
        outcome
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticSettings;
    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    type Captured = Arc<Mutex<Vec<(String, Value)>>>;

    async fn chat_server(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/v2/bot/message/{endpoint}",
                post(
                    |State((captured, status)): State<(Captured, StatusCode)>,
                     axum::extract::Path(endpoint): axum::extract::Path<String>,
                     Json(body): Json<Value>| async move {
                        captured.lock().unwrap().push((endpoint, body));
                        status
                    },
                ),
            )
            .with_state((captured.clone(), status));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    fn dispatcher(base: &str, enabled: bool) -> ReplyDispatcher {
        ReplyDispatcher::new(
            base,
            "token-1",
            Arc::new(StaticSettings(enabled)),
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn reply_posts_token_and_messages() {
        let (base, captured) = chat_server(StatusCode::OK).await;
        let delivery = dispatcher(&base, true)
            .reply("r1", vec![OutboundMessage::text("hello")])
            .await;
        assert_eq!(delivery, Delivery::Sent);
        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, "reply");
        assert_eq!(
            captured[0].1,
            json!({"replyToken": "r1", "messages": [{"type": "text", "text": "hello"}]})
        );
    }

    #[tokio::test]
    async fn disabled_notifications_are_a_silent_no_op() {
        let (base, captured) = chat_server(StatusCode::OK).await;
        let messenger = dispatcher(&base, false);
        assert_eq!(
            messenger.push("u1", vec![OutboundMessage::text("x")]).await,
            Delivery::Suppressed
        );
        assert_eq!(
            messenger
                .multicast(&["u1".to_string()], vec![OutboundMessage::text("x")])
                .await,
            Delivery::Suppressed
        );
        assert!(captured.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_failures_are_swallowed() {
        let (base, _captured) = chat_server(StatusCode::BAD_REQUEST).await;
        assert_eq!(
            dispatcher(&base, true)
                .reply("r1", vec![OutboundMessage::text("x")])
                .await,
            Delivery::Failed
        );
        assert_eq!(
            dispatcher("http://127.0.0.1:9", true)
                .push("u1", vec![OutboundMessage::text("x")])
                .await,
            Delivery::Failed
        );
    }

    #[tokio::test]
    async fn multicast_chunks_recipients() {
        let (base, captured) = chat_server(StatusCode::OK).await;
        let recipients: Vec<String> = (0..1_001).map(|i| format!("u{i}")).collect();
        let delivery = dispatcher(&base, true)
            .multicast(&recipients, vec![OutboundMessage::text("new listing")])
            .await;
        assert_eq!(delivery, Delivery::Sent);
        let captured = captured.lock().unwrap();
        let sizes: Vec<usize> = captured
            .iter()
            .map(|(_, body)| body["to"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![500, 500, 1]);
    }

    struct SlowSettings {
        calls: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl SettingsSource for SlowSettings {
        async fn chat_notifications_enabled(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            false
        }
    }

    fn slow_dispatcher(base: &str, settings: Arc<SlowSettings>) -> ReplyDispatcher {
        ReplyDispatcher::new(
            base,
            "token-1",
            settings,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn hanging_settings_lookup_stays_within_reply_budget() {
        let (base, captured) = chat_server(StatusCode::OK).await;
        let settings = Arc::new(SlowSettings {
            calls: AtomicUsize::new(0),
            hang: true,
        });
        let messenger = slow_dispatcher(&base, settings.clone());

        let started = std::time::Instant::now();
        let delivery = messenger
            .reply("r1", vec![OutboundMessage::text("x")])
            .await;
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        // falls back to the default, which is enabled
        assert_eq!(delivery, Delivery::Sent);

        let started = std::time::Instant::now();
        messenger.push("u1", vec![OutboundMessage::text("y")]).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(settings.calls.load(Ordering::SeqCst), 1);
        assert_eq!(captured.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn settings_answer_is_reused_between_sends() {
        let (base, captured) = chat_server(StatusCode::OK).await;
        let settings = Arc::new(SlowSettings {
            calls: AtomicUsize::new(0),
            hang: false,
        });
        let messenger = slow_dispatcher(&base, settings.clone());
        for _ in 0..3 {
            assert_eq!(
                messenger.push("u1", vec![OutboundMessage::text("x")]).await,
                Delivery::Suppressed
            );
        }
        assert_eq!(settings.calls.load(Ordering::SeqCst), 1);
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn flex_message_serializes_with_alt_text() {
        let message = OutboundMessage::Flex {
            alt_text: "Listing created".into(),
            contents: json!({"type": "bubble"}),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "flex", "altText": "Listing created", "contents": {"type": "bubble"}})
        );
    }
}
