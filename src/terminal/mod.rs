//! Line-oriented chat sessions on the terminal
//!
//! Reads messages from stdin and prints conversation updates as they
//! arrive. Ctrl+C, `/quit` or end of input leaves the session.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::api::{self, format_line, ApiClient};
use crate::config::Config;
use crate::messaging::{
    Channel, ChatContext, ConnectionState, DirectChatView, GroupChatView, Handler,
    MessagingError, Row, UserDirectory, ViewUpdate,
};
use crate::models::{GroupId, Inbound, UserId};

/// One open conversation.
enum Surface {
    Direct(DirectChatView),
    Group(GroupChatView),
}

impl Surface {
    fn send(&mut self, text: &str) -> Result<usize, MessagingError> {
        match self {
            Surface::Direct(view) => view.send(text),
            Surface::Group(view) => view.send(text),
        }
    }

    async fn next_update(&mut self) -> Option<ViewUpdate> {
        match self {
            Surface::Direct(view) => view.next_update().await,
            Surface::Group(view) => view.next_update().await,
        }
    }

    fn rows(&self) -> Vec<Row> {
        match self {
            Surface::Direct(view) => view.rows(),
            Surface::Group(view) => view.rows(),
        }
    }
}

fn print_row(row: &Row) {
    let marker = if row.pending { " (sending)" } else { "" };
    println!(
        "{}{}",
        format_line(row.timestamp.as_deref(), &row.sender, &row.content),
        marker
    );
}

fn context(config: &Config) -> Result<ChatContext> {
    let identity = config.identity()?;
    Ok(ChatContext::new(config.transport_settings()?, identity).with_echo_window(config.echo_window()))
}

/// Interactive direct chat with `peer`.
pub async fn run_direct(peer: UserId) -> Result<()> {
    let config = Config::load()?;
    let ctx = context(&config)?;
    let client = ApiClient::new(&config);

    let peer_name = api::display_name(&client, peer).await;
    println!("Chat with {} (id={}). Type a message and press Enter; /quit to leave.", peer_name, peer);

    let view = DirectChatView::mount(&ctx, &client, peer, peer_name).await;
    run_surface(&ctx, Surface::Direct(view)).await
}

/// Interactive group chat.
pub async fn run_group(group_id: GroupId) -> Result<()> {
    let config = Config::load()?;
    let ctx = context(&config)?;
    let client = Arc::new(ApiClient::new(&config));

    println!("Group {}. Type a message and press Enter; /quit to leave.", group_id);

    let users: Arc<dyn UserDirectory> = client.clone();
    let view = GroupChatView::mount(&ctx, client.as_ref(), users, group_id).await;
    run_surface(&ctx, Surface::Group(view)).await
}

async fn run_surface(ctx: &ChatContext, mut surface: Surface) -> Result<()> {
    let rows = surface.rows();
    if rows.is_empty() {
        println!("(no messages yet)");
    }
    for row in &rows {
        print_row(row);
    }

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut state = ctx.connector().subscribe_state();

    loop {
        tokio::select! {
            line = lines.next() => {
                let text = match line {
                    Some(Ok(text)) => text,
                    Some(Err(e)) => {
                        tracing::warn!("stdin read failed: {}", e);
                        break;
                    }
                    None => break,
                };
                if text.trim() == "/quit" {
                    break;
                }
                match surface.send(&text) {
                    Ok(idx) => {
                        if ctx.state() != ConnectionState::Connected {
                            println!("(not connected -- message not delivered)");
                        }
                        if let Some(row) = surface.rows().get(idx) {
                            print_row(row);
                        }
                    }
                    Err(MessagingError::EmptyMessage) => {}
                    Err(e) => tracing::warn!("Send failed: {}", e),
                }
            }
            update = surface.next_update() => match update {
                Some(ViewUpdate::Appended(idx)) => {
                    if let Some(row) = surface.rows().get(idx) {
                        print_row(row);
                    }
                }
                Some(ViewUpdate::EchoConfirmed(idx)) => {
                    tracing::debug!("Message {} delivered", idx);
                }
                Some(ViewUpdate::Presence(notice)) => {
                    if !notice.content.is_empty() {
                        println!("* {}", notice.content);
                    }
                }
                Some(ViewUpdate::NameResolved(n)) => {
                    println!("* User {} is {}", n.user_id, n.name);
                }
                Some(ViewUpdate::Ignored) => {}
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                report_state(&state);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    ctx.shutdown().await;
    drop(surface);
    Ok(())
}

fn report_state(state: &watch::Receiver<ConnectionState>) {
    match *state.borrow() {
        ConnectionState::Connected => println!("* connected"),
        ConnectionState::Reconnecting => println!("* connection lost, reconnecting..."),
        ConnectionState::Connecting | ConnectionState::Disconnected => {}
    }
}

/// Print everything arriving on the private inbox, the public channel and
/// the given groups until Ctrl+C.
pub async fn listen(groups: Vec<GroupId>) -> Result<()> {
    let config = Config::load()?;
    let ctx = context(&config)?;
    let me = ctx.identity().id;

    let print: Handler = Arc::new(move |m: &Inbound| match m {
        Inbound::Direct(msg) => {
            let direction = if msg.sender_id == me { "sent" } else { "received" };
            println!(
                "[direct {} {} -> {}] {}",
                direction, msg.sender_id, msg.receiver_id, msg.content
            );
        }
        Inbound::Group(msg) => {
            println!("[group {} from {}] {}", msg.group_id, msg.sender_id, msg.content);
        }
        Inbound::Presence(notice) => {
            println!("[presence {}] {}", notice.sender_id, notice.content);
        }
    });

    let forward = Arc::clone(&print);
    ctx.on_message(move |m| forward(m));
    for group_id in groups {
        ctx.subscribe(Channel::Group(group_id), Arc::clone(&print));
    }

    let _lease = ctx.lease();
    let mut state = ctx.connector().subscribe_state();
    println!("Listening as {}. Press Ctrl+C to stop.", ctx.identity().email);

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                report_state(&state);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    ctx.shutdown().await;
    Ok(())
}
