//! Conversation history endpoints

use anyhow::Result;
use futures::future::BoxFuture;

use super::client::ApiClient;
use crate::messaging::HistorySource;
use crate::models::{ChatMessage, GroupId, GroupMessage, UserId};

/// Messages exchanged between two users, oldest first.
pub async fn direct_history(client: &ApiClient, user: UserId, peer: UserId) -> Result<Vec<ChatMessage>> {
    tracing::debug!("Fetching history between {} and {}", user, peer);
    client
        .get_json(&format!("/chat/history?user1={}&user2={}", user, peer))
        .await
}

/// Messages posted to a group, oldest first.
pub async fn group_history(client: &ApiClient, group_id: GroupId) -> Result<Vec<GroupMessage>> {
    tracing::debug!("Fetching history for group {}", group_id);
    client
        .get_json(&format!("/group-chat/history/{}", group_id))
        .await
}

impl HistorySource for ApiClient {
    fn direct_history(&self, user: UserId, peer: UserId) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        Box::pin(direct_history(self, user, peer))
    }

    fn group_history(&self, group_id: GroupId) -> BoxFuture<'_, Result<Vec<GroupMessage>>> {
        Box::pin(group_history(self, group_id))
    }
}

/// One history line for terminal output.
pub fn format_line(timestamp: Option<&str>, sender: &str, content: &str) -> String {
    match timestamp {
        Some(ts) => format!("[{}] {}: {}", ts, sender, content),
        None => format!("{}: {}", sender, content),
    }
}
