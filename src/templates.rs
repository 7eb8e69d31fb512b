//! User-facing chat copy. Sender-visible text never carries collaborator error detail.

use crate::collaborators::ListingSummary;
use crate::models::PublishedListing;
use crate::parser::{FieldLabels, MissingField, ParsedProduct};
use crate::reply::OutboundMessage;
use serde_json::{Value, json};

/// Platform cap on a flex message's `altText`, counted in characters.
const ALT_TEXT_LIMIT: usize = 400;

pub const HELP_TEXT: &str = "上架方式：\n1. 先傳送商品照片\n2. 再傳送商品資訊，例如：\n\n商品名稱\n台幣：350\n數量：20\n到貨日：2026-12-01（選填）\n截止日：11/20（選填）\n\n指令：「說明」顯示本訊息，「我的商品」列出最近上架的商品。";

pub fn prompt_for_text() -> OutboundMessage {
    OutboundMessage::text(
        "已收到照片！請在一小時內傳送商品資訊：\n第一行為商品名稱，接著填寫「台幣：金額」與「數量：件數」。",
    )
}

pub fn retry_image() -> OutboundMessage {
    OutboundMessage::text("照片處理失敗，請稍後再傳送一次。")
}

pub fn unauthorized_sender() -> OutboundMessage {
    OutboundMessage::text("抱歉，此帳號尚未開通賣家權限，無法上架商品。如需協助請聯絡客服。")
}

pub fn service_unavailable() -> OutboundMessage {
    OutboundMessage::text("系統暫時無法處理您的訊息，請稍後再試。")
}

pub fn missing_fields(missing: &[MissingField], labels: &FieldLabels) -> OutboundMessage {
    let mut text = String::from("商品資訊不完整，缺少以下欄位：\n");
    for field in missing {
        text.push_str(&format!("・{}\n", labels.label(*field)));
    }
    text.push_str("請補齊後重新傳送商品資訊。");
    OutboundMessage::text(text)
}

pub fn unknown_lines(lines: &[String]) -> OutboundMessage {
    let mut text = String::from("無法辨識以下內容：\n");
    for line in lines {
        text.push_str(&format!("・{line}\n"));
    }
    text.push_str("請依照格式重新傳送商品資訊。");
    OutboundMessage::text(text)
}

pub fn creation_failed() -> OutboundMessage {
    OutboundMessage::text("商品建立失敗，請稍後重新傳送照片與商品資訊。")
}

pub fn already_processing() -> OutboundMessage {
    OutboundMessage::text("這張照片已在處理中，請稍候。")
}

pub fn welcome() -> OutboundMessage {
    OutboundMessage::text(format!("歡迎加入！\n\n{HELP_TEXT}"))
}

pub fn help() -> OutboundMessage {
    OutboundMessage::text(HELP_TEXT)
}

pub fn recent_listings(listings: &[ListingSummary]) -> OutboundMessage {
    if listings.is_empty() {
        return OutboundMessage::text("目前沒有上架中的商品。");
    }
    let mut text = String::from("最近上架的商品：\n");
    for (idx, listing) in listings.iter().take(10).enumerate() {
        match &listing.price_label {
            Some(price) => text.push_str(&format!("{}. {}（{}）\n", idx + 1, listing.name, price)),
            None => text.push_str(&format!("{}. {}\n", idx + 1, listing.name)),
        }
    }
    OutboundMessage::text(text.trim_end().to_string())
}

pub fn summary_text(product: &ParsedProduct, published: &PublishedListing) -> String {
    let mut text = format!(
        "商品已上架！\n{}\n價格：{}\n數量：{}",
        product.name,
        product.display_price(),
        product.quantity
    );
    if let Some(date) = product.arrival_date {
        text.push_str(&format!("\n到貨日：{date}"));
    }
    if let Some(date) = product.preorder_deadline {
        text.push_str(&format!("\n截止日：{date}"));
    }
    text.push_str(&format!("\n編號：{}", published.listing_id));
    if let Some(url) = &published.feed_url {
        text.push_str(&format!("\n貼文：{url}"));
    }
    text
}

/// Card plus plain-text summary, sent together on the reply token.
pub fn confirmation(product: &ParsedProduct, published: &PublishedListing) -> Vec<OutboundMessage> {
    vec![
        OutboundMessage::Flex {
            alt_text: alt_text("商品已上架：", &product.name),
            contents: listing_card(product, published),
        },
        OutboundMessage::text(summary_text(product, published)),
    ]
}

pub fn broadcast(product: &ParsedProduct, published: &PublishedListing) -> Vec<OutboundMessage> {
    vec![OutboundMessage::Flex {
        alt_text: alt_text("新商品開團：", &product.name),
        contents: listing_card(product, published),
    }]
}

fn alt_text(prefix: &str, name: &str) -> String {
    let room = ALT_TEXT_LIMIT - prefix.chars().count();
    if name.chars().count() <= room {
        return format!("{prefix}{name}");
    }
    let kept: String = name.chars().take(room - 1).collect();
    format!("{prefix}{kept}…")
}

fn listing_card(product: &ParsedProduct, published: &PublishedListing) -> Value {
    let mut rows = vec![
        detail_row("價格", &product.display_price()),
        detail_row("數量", &product.quantity.to_string()),
    ];
    if let Some(date) = product.arrival_date {
        rows.push(detail_row("到貨日", &date.to_string()));
    }
    if let Some(date) = product.preorder_deadline {
        rows.push(detail_row("截止日", &date.to_string()));
    }

    let mut bubble = json!({
        "type": "bubble",
        "body": {
            "type": "box",
            "layout": "vertical",
            "spacing": "sm",
            "contents": [
                { "type": "text", "text": product.name, "weight": "bold", "size": "lg", "wrap": true },
                { "type": "box", "layout": "vertical", "spacing": "xs", "contents": rows },
            ],
        },
    });
    if let Some(url) = &published.feed_url {
        bubble["footer"] = json!({
            "type": "box",
            "layout": "vertical",
            "contents": [{
                "type": "button",
                "style": "primary",
                "action": { "type": "uri", "label": "查看貼文", "uri": url },
            }],
        });
    }
    bubble
}

fn detail_row(label: &str, value: &str) -> Value {
    json!({
        "type": "box",
        "layout": "baseline",
        "contents": [
            { "type": "text", "text": label, "size": "sm", "color": "#888888", "flex": 2 },
            { "type": "text", "text": value, "size": "sm", "flex": 5, "wrap": true },
        ],
    })
}
