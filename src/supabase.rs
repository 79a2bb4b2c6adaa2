use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::handler::MessageStore;
use crate::schema::{InsertedRow, MessageRow};

const UNIQUE_VIOLATION_CODE: &str = "23505";
const UNIQUE_VIOLATION_NEEDLE: &str = "duplicate key value violates unique constraint";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The table's unique constraint on `slack_message_ts` rejected the row.
    /// Expected under redelivery; callers treat this as a warning, not a fault.
    #[error("duplicate row for slack_message_ts {ts}")]
    Duplicate { ts: String },
    #[error("Supabase rejected insert (status {status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("Supabase request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Error body shape returned by PostgREST for failed writes.
#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Thin client for the Supabase REST interface. One table, one operation.
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    service_key: String,
    table_name: String,
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_key: &str, table_name: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            table_name: table_name.to_string(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn insert(&self, row: &MessageRow) -> Result<InsertedRow, StoreError> {
        let url = format!("{}/rest/v1/{}", self.base_url, self.table_name);

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let mut rows: Vec<InsertedRow> = response.json().await?;
            return match rows.pop() {
                Some(inserted) => Ok(inserted),
                None => Err(StoreError::Rejected {
                    status: status.as_u16(),
                    detail: "insert returned no row data".to_string(),
                }),
            };
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_rejection(status.as_u16(), &body, row))
    }
}

/// Distinguish the expected unique-constraint rejection from everything else.
/// PostgREST exposes the Postgres error code, so match on `23505` first and
/// fall back to the message text only when the code is absent.
fn classify_rejection(status: u16, body: &str, row: &MessageRow) -> StoreError {
    let parsed: Option<PostgrestError> = serde_json::from_str(body).ok();
    let is_duplicate = parsed
        .as_ref()
        .map(|err| {
            err.code.as_deref() == Some(UNIQUE_VIOLATION_CODE)
                || err
                    .message
                    .as_deref()
                    .is_some_and(|message| message.to_lowercase().contains(UNIQUE_VIOLATION_NEEDLE))
        })
        .unwrap_or(false);

    if is_duplicate {
        return StoreError::Duplicate {
            ts: row.slack_message_ts.clone(),
        };
    }

    let detail = parsed
        .and_then(|err| err.message)
        .unwrap_or_else(|| body.to_string());
    StoreError::Rejected { status, detail }
}

#[async_trait]
impl MessageStore for SupabaseClient {
    async fn insert_row(&self, row: &MessageRow) -> Result<InsertedRow, StoreError> {
        let inserted = self.insert(row).await?;
        info!(
            id = inserted.id,
            table = %self.table_name,
            "Inserted row into Supabase"
        );
        Ok(inserted)
    }
}
