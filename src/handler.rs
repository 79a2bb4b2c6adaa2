use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::schema::{InsertedRow, MessageEvent, MessageRow};
use crate::supabase::StoreError;

/// Persistence seam the handler writes through. Implemented by
/// `SupabaseClient`; tests substitute a recording store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_row(&self, row: &MessageRow) -> Result<InsertedRow, StoreError>;
}

/// Filters incoming message events down to the one target user and persists
/// each qualifying message as a single row.
pub struct MessageHandler {
    target_user_id: String,
    store: Arc<dyn MessageStore>,
}

impl MessageHandler {
    pub fn new(target_user_id: String, store: Arc<dyn MessageStore>) -> Self {
        Self {
            target_user_id,
            store,
        }
    }

    /// Callback body for one delivered event. Never fails from the caller's
    /// point of view: persistence problems are logged and the event dropped,
    /// so one bad message cannot take the listener down.
    pub async fn handle_event(&self, event: &MessageEvent) {
        // Relevance: plain user message (no subtype), from the target user,
        // with non-empty text. Anything else is deliberately a silent no-op.
        if event.subtype.is_some() {
            return;
        }
        let user = match event.user.as_deref() {
            Some(user) if user == self.target_user_id => user,
            _ => return,
        };
        let text = match event.text.as_deref() {
            Some(text) if !text.is_empty() => text,
            _ => return,
        };
        let (Some(channel), Some(ts)) = (event.channel.as_deref(), event.ts.as_deref()) else {
            return;
        };

        info!(
            user_id = %user,
            channel_id = %channel,
            "Received message from target user: '{}'",
            preview(text, 70)
        );

        let row = MessageRow {
            slack_user_id: user.to_string(),
            slack_channel_id: channel.to_string(),
            message_content: text.to_string(),
            slack_message_ts: ts.to_string(),
        };

        match self.store.insert_row(&row).await {
            Ok(inserted) => {
                info!(id = inserted.id, "Message successfully stored in Supabase");
            }
            Err(StoreError::Duplicate { ts }) => {
                // Expected under transport redelivery; the table's unique
                // constraint on slack_message_ts already holds the row.
                warn!(slack_message_ts = %ts, "Duplicate message not inserted");
            }
            Err(err) => {
                error!(error = %err, slack_message_ts = %ts, "Error storing message in Supabase");
            }
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}
