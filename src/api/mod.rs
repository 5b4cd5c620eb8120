//! REST API client for the chat backend

mod chat;
pub mod client;
mod users;

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;

use crate::config::Config;
use crate::messaging::directory::placeholder;
use crate::models::{GroupId, UserId};

pub use chat::{direct_history, format_line, group_history};
pub use client::ApiClient;
pub use users::{get_user, get_user_by_email, my_groups};

/// Username for `id`, or the placeholder if the lookup fails.
pub async fn display_name(client: &ApiClient, id: UserId) -> String {
    match get_user(client, id).await {
        Ok(user) => user.username,
        Err(e) => {
            tracing::warn!("Could not resolve user {}: {:#}", id, e);
            placeholder(id)
        }
    }
}

/// Print the direct conversation with `peer`.
pub async fn print_history(peer: UserId) -> Result<()> {
    let config = Config::load()?;
    let me = config.identity()?;
    let client = ApiClient::new(&config);

    let messages = direct_history(&client, me.id, peer).await?;
    if messages.is_empty() {
        println!("(no messages yet)");
        return Ok(());
    }

    let peer_name = display_name(&client, peer).await;
    for msg in &messages {
        let sender = if msg.sender_id == me.id { "You" } else { peer_name.as_str() };
        println!("{}", format_line(msg.timestamp.as_deref(), sender, &msg.content));
    }
    Ok(())
}

/// Print a group's history with sender names.
pub async fn print_group_history(group_id: GroupId) -> Result<()> {
    let config = Config::load()?;
    let me = config.identity()?;
    let client = ApiClient::new(&config);

    let messages = group_history(&client, group_id).await?;
    if messages.is_empty() {
        println!("(no messages yet)");
        return Ok(());
    }

    let senders: BTreeSet<UserId> = messages
        .iter()
        .map(|m| m.sender_id)
        .filter(|&id| id != me.id)
        .collect();
    let client = &client;
    let names: HashMap<UserId, String> = futures::future::join_all(
        senders
            .into_iter()
            .map(|id| async move { (id, display_name(client, id).await) }),
    )
    .await
    .into_iter()
    .collect();

    for msg in &messages {
        let sender = if msg.sender_id == me.id {
            "You".to_string()
        } else {
            names
                .get(&msg.sender_id)
                .cloned()
                .unwrap_or_else(|| placeholder(msg.sender_id))
        };
        println!("{}", format_line(msg.timestamp.as_deref(), &sender, &msg.content));
    }
    Ok(())
}

/// List the groups the logged-in user belongs to.
pub async fn list_groups() -> Result<()> {
    let config = Config::load()?;
    let me = config.identity()?;
    let client = ApiClient::new(&config);

    let groups = my_groups(&client, me.id).await?;

    println!("\nGroups:");
    println!("{:-<60}", "");

    if groups.is_empty() {
        println!("  (no groups found)");
        return Ok(());
    }

    for group in &groups {
        println!("{:<8} {} ({} members)", group.id, group.name, group.members_id.len());
    }
    Ok(())
}

/// Show the logged-in user's profile.
pub async fn whoami() -> Result<()> {
    let config = Config::load()?;
    let me = config.identity()?;
    let client = ApiClient::new(&config);
    let user = get_user(&client, me.id).await?;

    println!();
    println!("Username: {}", user.username);
    println!("Email:    {}", user.email);
    println!("Role:     {}", user.role.as_deref().unwrap_or("(none)"));
    println!("ID:       {}", user.id);

    Ok(())
}
