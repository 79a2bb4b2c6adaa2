//! Deshi Knowledge Collector: listens for Slack messages from one designated
//! user over Socket Mode and persists them into a Supabase table.

pub mod config;
pub mod handler;
pub mod logbuf;
pub mod schema;
pub mod slack;
pub mod supabase;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::handler::MessageHandler;
use crate::slack::SocketModeListener;
use crate::supabase::SupabaseClient;

/// Construct the store client and listener from a resolved configuration and
/// block until the listener terminates. Both process hosts drive this same
/// sequence; only how they obtain the configuration differs.
pub async fn run_collector(config: RuntimeConfig) -> Result<()> {
    let bot_user_id = slack::authenticate_bot(&config.slack_bot_token).await?;
    info!(bot_user_id = %bot_user_id, "Slack bot credential verified");

    let store = Arc::new(SupabaseClient::new(
        &config.supabase_url,
        &config.supabase_service_key,
        &config.table_name,
    ));

    info!(url = %config.supabase_url, "Supabase client initialized");
    info!(user_id = %config.target_user_id, "Monitoring messages from Slack user");
    info!(table = %config.table_name, "Storing messages in Supabase table");

    let handler = MessageHandler::new(config.target_user_id.clone(), store);
    let listener = SocketModeListener::new(config.slack_app_token.clone());
    listener.run(&handler).await
}
