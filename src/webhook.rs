use crate::models::{
    ApiError, EventKind, InboundEvent, InboundMessage, WebhookPayload, WebhookResponse,
};
use crate::orchestrator::{Handled, UploadError, UploadOrchestrator};
use axum::{Json, body::Bytes, extract::State, http::StatusCode};
use tracing::{debug, info, warn};

/// Entry point for verified chat-platform deliveries. Events are handled
/// one at a time, in delivery order.
pub async fn receive(
    State(orchestrator): State<UploadOrchestrator>,
    body: Bytes,
) -> Result<Json<WebhookResponse>, (StatusCode, Json<ApiError>)> {
    crate::metrics::inc_requests("/webhook");
    let payload: WebhookPayload = serde_json::from_slice(&body).map_err(|err| {
        warn!(target = "intake.webhook", error = %err, "unparseable webhook body");
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: "invalid_payload".to_string(),
                detail: Some("Body is not a webhook payload".to_string()),
            }),
        )
    })?;

    let processed = dispatch(&orchestrator, payload).await;
    Ok(Json(WebhookResponse {
        success: true,
        processed,
    }))
}

pub async fn dispatch(orchestrator: &UploadOrchestrator, payload: WebhookPayload) -> usize {
    let mut processed = 0;
    for raw in payload.events {
        let kind = raw.kind.clone();
        let Some(event) = InboundEvent::from_webhook(raw) else {
            debug!(target = "intake.webhook", kind = %kind, "event skipped");
            continue;
        };
        processed += 1;
        let label = event_label(&event);
        crate::metrics::inc_events(label);
        if let Err(err) = handle(orchestrator, event).await {
            info!(
                target = "intake.webhook",
                event = label,
                kind = err.kind(),
                error = %err,
                "event settled with error"
            );
        }
    }
    processed
}

async fn handle(
    orchestrator: &UploadOrchestrator,
    event: InboundEvent,
) -> Result<Handled, UploadError> {
    let sender = event.sender_id.as_str();
    let reply_token = event.reply_token.as_deref();
    match (event.kind, event.message) {
        (EventKind::Follow, _) => Ok(orchestrator.handle_follow(sender, reply_token).await),
        (EventKind::Unfollow, _) => Ok(orchestrator.handle_unfollow(sender).await),
        (EventKind::Message, Some(InboundMessage::Image { media_id })) => {
            orchestrator
                .handle_image(sender, &media_id, reply_token)
                .await
        }
        (EventKind::Message, Some(InboundMessage::Text { text })) => {
            orchestrator.handle_text(sender, &text, reply_token).await
        }
        (EventKind::Message, Some(InboundMessage::Other { kind })) => {
            debug!(target = "intake.webhook", sender = %sender, kind = %kind, "unsupported message type");
            Ok(Handled::Ignored)
        }
        (EventKind::Message, None) => Ok(Handled::Ignored),
    }
}

fn event_label(event: &InboundEvent) -> &'static str {
    match (&event.kind, &event.message) {
        (EventKind::Follow, _) => "follow",
        (EventKind::Unfollow, _) => "unfollow",
        (EventKind::Message, Some(InboundMessage::Text { .. })) => "message.text",
        (EventKind::Message, Some(InboundMessage::Image { .. })) => "message.image",
        (EventKind::Message, _) => "message.other",
    }
}
