use serde::{Deserialize, Serialize};

/// A message event as delivered by the Slack Events API.
///
/// Slack payloads are loosely typed; every field the filter looks at is kept
/// optional so the relevance check in the handler stays explicit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
}

/// Row shape for the Supabase table. `slack_message_ts` carries a unique
/// constraint store-side; that constraint is the only dedup this system has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub slack_user_id: String,
    pub slack_channel_id: String,
    pub message_content: String,
    pub slack_message_ts: String,
}

/// Confirmation returned by the store after a successful insert.
#[derive(Debug, Clone, Deserialize)]
pub struct InsertedRow {
    pub id: i64,
}
