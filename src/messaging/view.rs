//! Direct and group conversation views
//!
//! A view is mounted on a [`ChatContext`]: it takes a lease, registers its
//! handlers, waits for the connection, then loads history. Live traffic that
//! arrives during the history fetch is buffered and merged afterwards.
//! Dropping the view undoes all of it.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::context::{ChatContext, Lease};
use super::directory::{DirectoryCache, NameResolved, UserDirectory};
use super::dispatcher::{Handler, HandlerId};
use super::error::{MessagingError, Result};
use super::reconcile::{Conversation, Correlate, LiveOutcome, Origin};
use super::router::{Channel, SubscriptionId};
use crate::models::{
    ChatMessage, GroupId, GroupMessage, Inbound, Outbound, PresenceNotice, UserId,
};

/// Where conversation history comes from.
pub trait HistorySource: Send + Sync {
    fn direct_history(
        &self,
        user: UserId,
        peer: UserId,
    ) -> BoxFuture<'_, anyhow::Result<Vec<ChatMessage>>>;

    fn group_history(&self, group_id: GroupId) -> BoxFuture<'_, anyhow::Result<Vec<GroupMessage>>>;
}

/// Something that changed in a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    Appended(usize),
    EchoConfirmed(usize),
    /// Already shown, or not part of this conversation.
    Ignored,
    Presence(PresenceNotice),
    NameResolved(NameResolved),
}

impl From<LiveOutcome> for ViewUpdate {
    fn from(outcome: LiveOutcome) -> Self {
        match outcome {
            LiveOutcome::Appended(idx) => ViewUpdate::Appended(idx),
            LiveOutcome::EchoConfirmed(idx) => ViewUpdate::EchoConfirmed(idx),
            LiveOutcome::Ignored => ViewUpdate::Ignored,
        }
    }
}

/// A message ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub sender_id: UserId,
    pub sender: String,
    pub content: String,
    pub timestamp: Option<String>,
    /// Sent from here and not yet echoed by the server.
    pub pending: bool,
}

fn row<M: Correlate>(message: &M, origin: Origin, sender: String) -> Row {
    Row {
        sender_id: message.sender(),
        sender,
        content: message.content().to_string(),
        timestamp: message.timestamp().map(str::to_string),
        pending: origin == (Origin::Local { confirmed: false }),
    }
}

async fn load_history<M, F>(what: &str, fetch: F) -> Vec<M>
where
    F: std::future::Future<Output = anyhow::Result<Vec<M>>>,
{
    match fetch.await {
        Ok(messages) if messages.is_empty() => {
            tracing::info!("No messages yet in {}", what);
            messages
        }
        Ok(messages) => {
            tracing::debug!("Loaded {} messages for {}", messages.len(), what);
            messages
        }
        Err(e) => {
            tracing::warn!("History unavailable for {}: {:#}", what, e);
            Vec::new()
        }
    }
}

pub struct DirectChatView {
    ctx: ChatContext,
    peer_id: UserId,
    peer_name: String,
    conversation: Conversation<ChatMessage>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    handler: HandlerId,
    _lease: Lease,
}

impl DirectChatView {
    pub async fn mount(
        ctx: &ChatContext,
        history: &dyn HistorySource,
        peer_id: UserId,
        peer_name: impl Into<String>,
    ) -> Self {
        let lease = ctx.lease();
        let me = ctx.identity().id;

        let (tx, inbox) = mpsc::unbounded_channel();
        let handler = ctx.on_message(move |m| {
            let relevant = match m {
                Inbound::Direct(msg) => msg.is_between(me, peer_id),
                Inbound::Presence(_) => true,
                Inbound::Group(_) => false,
            };
            if relevant {
                let _ = tx.send(m.clone());
            }
        });

        if !ctx.connected_within_timeout().await {
            tracing::warn!("Chat server not reachable yet, loading history anyway");
        }

        let what = format!("chat with user {}", peer_id);
        let messages = load_history(&what, history.direct_history(me, peer_id)).await;
        let mut conversation = Conversation::new(me, ctx.echo_window());
        conversation.seed_history(messages);

        Self {
            ctx: ctx.clone(),
            peer_id,
            peer_name: peer_name.into(),
            conversation,
            inbox,
            handler,
            _lease: lease,
        }
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    /// Send `text` to the peer. Shown immediately; confirmed by the echo.
    pub fn send(&mut self, text: &str) -> Result<usize> {
        if text.trim().is_empty() {
            return Err(MessagingError::EmptyMessage);
        }
        let message = ChatMessage::new(self.ctx.identity().id, self.peer_id, text);
        let idx = self.conversation.push_local(message.clone());
        self.ctx.dispatcher().send(&Outbound::Chat(message))?;
        Ok(idx)
    }

    /// Wait for and apply the next inbound event.
    pub async fn next_update(&mut self) -> Option<ViewUpdate> {
        let inbound = self.inbox.recv().await?;
        Some(self.apply(inbound))
    }

    fn apply(&mut self, inbound: Inbound) -> ViewUpdate {
        match inbound {
            Inbound::Direct(message) => self.conversation.apply_live(message).into(),
            Inbound::Presence(notice) => ViewUpdate::Presence(notice),
            Inbound::Group(_) => ViewUpdate::Ignored,
        }
    }

    pub fn rows(&self) -> Vec<Row> {
        let me = self.ctx.identity().id;
        self.conversation
            .entries()
            .iter()
            .map(|e| {
                let sender = if e.message.sender_id == me {
                    "You".to_string()
                } else {
                    self.peer_name.clone()
                };
                row(&e.message, e.origin, sender)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conversation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversation.is_empty()
    }
}

impl Drop for DirectChatView {
    fn drop(&mut self) {
        self.ctx.remove_handler(self.handler);
    }
}

pub struct GroupChatView {
    ctx: ChatContext,
    group_id: GroupId,
    conversation: Conversation<GroupMessage>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    subscription: SubscriptionId,
    directory: DirectoryCache,
    names: mpsc::UnboundedReceiver<NameResolved>,
    _lease: Lease,
}

impl GroupChatView {
    pub async fn mount(
        ctx: &ChatContext,
        history: &dyn HistorySource,
        users: Arc<dyn UserDirectory>,
        group_id: GroupId,
    ) -> Self {
        let lease = ctx.lease();

        let (tx, inbox) = mpsc::unbounded_channel();
        let forward: Handler = Arc::new(move |m: &Inbound| {
            let _ = tx.send(m.clone());
        });
        let subscription = ctx.subscribe(Channel::Group(group_id), forward);

        if !ctx.connected_within_timeout().await {
            tracing::warn!("Chat server not reachable yet, loading history anyway");
        }

        let what = format!("group {}", group_id);
        let messages = load_history(&what, history.group_history(group_id)).await;

        let (directory, names) = DirectoryCache::new(users);
        let me = ctx.identity().id;
        directory.prefetch(messages.iter().map(|m| m.sender_id).filter(|&id| id != me));

        let mut conversation = Conversation::new(me, ctx.echo_window());
        conversation.seed_history(messages);

        Self {
            ctx: ctx.clone(),
            group_id,
            conversation,
            inbox,
            subscription,
            directory,
            names,
            _lease: lease,
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn send(&mut self, text: &str) -> Result<usize> {
        if text.trim().is_empty() {
            return Err(MessagingError::EmptyMessage);
        }
        let message = GroupMessage::new(self.group_id, self.ctx.identity().id, text);
        let idx = self.conversation.push_local(message.clone());
        self.ctx.dispatcher().send(&Outbound::Group(message))?;
        Ok(idx)
    }

    pub async fn next_update(&mut self) -> Option<ViewUpdate> {
        tokio::select! {
            Some(inbound) = self.inbox.recv() => Some(self.apply(inbound)),
            Some(resolved) = self.names.recv() => Some(ViewUpdate::NameResolved(resolved)),
            else => None,
        }
    }

    fn apply(&mut self, inbound: Inbound) -> ViewUpdate {
        match inbound {
            Inbound::Group(message) if message.group_id == self.group_id => {
                self.sender_label(message.sender_id);
                self.conversation.apply_live(message).into()
            }
            Inbound::Presence(notice) => ViewUpdate::Presence(notice),
            _ => ViewUpdate::Ignored,
        }
    }

    /// Display label for a sender: "You", the cached name, or a placeholder.
    pub fn sender_label(&self, sender_id: UserId) -> String {
        if sender_id == self.ctx.identity().id {
            return "You".to_string();
        }
        self.directory.resolve(sender_id)
    }

    pub fn rows(&self) -> Vec<Row> {
        self.conversation
            .entries()
            .iter()
            .map(|e| row(&e.message, e.origin, self.sender_label(e.message.sender_id)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conversation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversation.is_empty()
    }
}

impl Drop for GroupChatView {
    fn drop(&mut self) {
        self.ctx.unsubscribe(self.subscription);
        self.directory.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::connector::{ConnectionState, TransportSettings};
    use crate::models::Identity;
    use crate::stomp::test_broker::{BrokerConn, TestBroker};
    use crate::stomp::{Command, Frame, HeartBeat};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    #[derive(Default)]
    struct FakeHistory {
        direct: Vec<ChatMessage>,
        group: Vec<GroupMessage>,
        fail: bool,
    }

    impl HistorySource for FakeHistory {
        fn direct_history(
            &self,
            _user: UserId,
            _peer: UserId,
        ) -> BoxFuture<'_, anyhow::Result<Vec<ChatMessage>>> {
            Box::pin(async move {
                if self.fail {
                    anyhow::bail!("HTTP 500");
                }
                Ok(self.direct.clone())
            })
        }

        fn group_history(&self, _group_id: GroupId) -> BoxFuture<'_, anyhow::Result<Vec<GroupMessage>>> {
            Box::pin(async move { Ok(self.group.clone()) })
        }
    }

    #[derive(Default)]
    struct FakeUsers {
        calls: AtomicUsize,
    }

    impl UserDirectory for FakeUsers {
        fn display_name(&self, id: UserId) -> BoxFuture<'_, anyhow::Result<String>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(format!("user{}", id))
            })
        }
    }

    fn context(broker: &TestBroker) -> ChatContext {
        let settings = TransportSettings {
            url: Url::parse(&broker.url).unwrap(),
            reconnect_delay: Duration::from_millis(100),
            heartbeat: HeartBeat::new(0, 0),
            heartbeat_tolerance: 2,
            connect_timeout: Duration::from_secs(2),
            trace_frames: true,
        };
        ChatContext::new(
            settings,
            Identity {
                id: 1,
                email: "alice@example.com".to_string(),
            },
        )
    }

    fn group_msg(sender: UserId, content: &str, ts: &str) -> GroupMessage {
        GroupMessage {
            group_id: 7,
            sender_id: sender,
            content: content.to_string(),
            timestamp: Some(ts.to_string()),
        }
    }

    /// Accept the connection and return it with the subscription ids by destination.
    async fn serve(broker: &mut TestBroker, subscriptions: usize) -> (BrokerConn, Vec<(String, String)>) {
        let mut conn = broker.accept().await;
        conn.handshake().await;
        let mut subs = Vec::new();
        for _ in 0..subscriptions {
            let f = conn.expect(Command::Subscribe).await;
            subs.push((
                f.get("destination").unwrap().to_string(),
                f.get("id").unwrap().to_string(),
            ));
        }
        (conn, subs)
    }

    fn sub_for<'a>(subs: &'a [(String, String)], destination: &str) -> &'a str {
        &subs.iter().find(|(d, _)| d == destination).unwrap().1
    }

    async fn expect_send(conn: &mut BrokerConn, destination: &str) -> Frame {
        loop {
            let frame = conn.expect(Command::Send).await;
            if frame.get("destination") == Some(destination) {
                return frame;
            }
        }
    }

    async fn update<F: std::future::Future<Output = Option<ViewUpdate>>>(f: F) -> ViewUpdate {
        tokio::time::timeout(Duration::from_secs(5), f)
            .await
            .expect("no view update")
            .expect("view closed")
    }

    #[tokio::test]
    async fn test_direct_send_shows_once_after_echo() {
        let mut broker = TestBroker::start().await;
        let ctx = context(&broker);
        let history = FakeHistory::default();

        let (mut view, (mut conn, subs)) = tokio::join!(
            DirectChatView::mount(&ctx, &history, 2, "bob"),
            serve(&mut broker, 2)
        );
        assert!(view.is_empty());

        view.send("hi").unwrap();
        let rows = view.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "hi");
        assert_eq!(rows[0].sender_id, 1);
        assert!(rows[0].pending);

        let sent = expect_send(&mut conn, "/app/chat.send").await;
        let inbox = sub_for(&subs, "/user/queue/messages").to_string();
        conn.send_message(&inbox, "/user/queue/messages", &sent.body).await;

        assert_eq!(update(view.next_update()).await, ViewUpdate::EchoConfirmed(0));
        let rows = view.rows();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].pending);
        assert_eq!(rows[0].sender, "You");

        drop(view);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_view_filters_other_conversations() {
        let mut broker = TestBroker::start().await;
        let ctx = context(&broker);
        let history = FakeHistory::default();

        let (mut view, (mut conn, subs)) = tokio::join!(
            DirectChatView::mount(&ctx, &history, 2, "bob"),
            serve(&mut broker, 2)
        );
        let inbox = sub_for(&subs, "/user/queue/messages").to_string();
        conn.send_message(&inbox, "/user/queue/messages", r#"{"senderId":3,"receiverId":1,"content":"not you"}"#)
            .await;
        conn.send_message(&inbox, "/user/queue/messages", r#"{"senderId":2,"receiverId":1,"content":"from bob"}"#)
            .await;

        assert_eq!(update(view.next_update()).await, ViewUpdate::Appended(0));
        assert_eq!(view.rows()[0].sender, "bob");
        assert_eq!(view.len(), 1);

        drop(view);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_failure_gives_empty_view() {
        let mut broker = TestBroker::start().await;
        let ctx = context(&broker);
        let history = FakeHistory {
            fail: true,
            ..Default::default()
        };

        let (view, _served) = tokio::join!(
            DirectChatView::mount(&ctx, &history, 2, "bob"),
            serve(&mut broker, 2)
        );
        assert!(view.is_empty());

        drop(view);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_group_history_then_live() {
        let mut broker = TestBroker::start().await;
        let ctx = context(&broker);
        let history = FakeHistory {
            group: vec![
                group_msg(2, "one", "2024-05-01T09:00:00"),
                group_msg(3, "two", "2024-05-01T09:01:00"),
                group_msg(2, "three", "2024-05-01T09:02:00"),
            ],
            ..Default::default()
        };
        let users: Arc<dyn UserDirectory> = Arc::new(FakeUsers::default());

        let (mut view, (mut conn, subs)) = tokio::join!(
            GroupChatView::mount(&ctx, &history, users, 7),
            serve(&mut broker, 3)
        );
        assert_eq!(view.len(), 3);

        let group_sub = sub_for(&subs, "/topic/group.7").to_string();
        conn.send_message(
            &group_sub,
            "/topic/group.7",
            r#"{"groupId":7,"senderId":3,"content":"four","timestamp":"2024-05-01T10:00:00"}"#,
        )
        .await;

        loop {
            match update(view.next_update()).await {
                ViewUpdate::Appended(idx) => {
                    assert_eq!(idx, 3);
                    break;
                }
                ViewUpdate::NameResolved(_) => continue,
                other => panic!("unexpected update {:?}", other),
            }
        }
        let contents: Vec<String> = view.rows().into_iter().map(|r| r.content).collect();
        assert_eq!(contents, vec!["one", "two", "three", "four"]);

        drop(view);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_group_sender_name_resolves_later() {
        let mut broker = TestBroker::start().await;
        let ctx = context(&broker);
        let history = FakeHistory {
            group: vec![group_msg(1, "mine", "2024-05-01T09:00:00")],
            ..Default::default()
        };
        let fake_users = Arc::new(FakeUsers::default());
        let users: Arc<dyn UserDirectory> = fake_users.clone();

        let (mut view, (mut conn, subs)) = tokio::join!(
            GroupChatView::mount(&ctx, &history, users, 7),
            serve(&mut broker, 3)
        );

        let group_sub = sub_for(&subs, "/topic/group.7").to_string();
        conn.send_message(&group_sub, "/topic/group.7", r#"{"groupId":7,"senderId":42,"content":"hey"}"#)
            .await;

        assert_eq!(update(view.next_update()).await, ViewUpdate::Appended(1));
        let rows = view.rows();
        assert_eq!(rows[0].sender, "You");
        assert_eq!(rows[1].sender, "User 42");

        loop {
            if let ViewUpdate::NameResolved(n) = update(view.next_update()).await {
                if n.user_id == 42 {
                    assert_eq!(n.name, "user42");
                    break;
                }
            }
        }
        let rows = view.rows();
        assert_eq!(rows[0].sender, "You");
        assert_eq!(rows[0].content, "mine");
        assert_eq!(rows[1].sender, "user42");

        let before = fake_users.calls.load(Ordering::SeqCst);
        view.rows();
        assert_eq!(fake_users.calls.load(Ordering::SeqCst), before);

        drop(view);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_group_send_reconciles_echo() {
        let mut broker = TestBroker::start().await;
        let ctx = context(&broker);
        let history = FakeHistory::default();
        let users: Arc<dyn UserDirectory> = Arc::new(FakeUsers::default());

        let (mut view, (mut conn, subs)) = tokio::join!(
            GroupChatView::mount(&ctx, &history, users, 7),
            serve(&mut broker, 3)
        );
        assert!(matches!(view.send("   "), Err(MessagingError::EmptyMessage)));

        view.send("hello group").unwrap();
        let sent = expect_send(&mut conn, "/app/group.send").await;
        let body: serde_json::Value = serde_json::from_str(&sent.body).unwrap();
        assert_eq!(body["groupId"], 7);
        assert_eq!(body["senderId"], 1);

        let group_sub = sub_for(&subs, "/topic/group.7").to_string();
        conn.send_message(&group_sub, "/topic/group.7", &sent.body).await;
        assert_eq!(update(view.next_update()).await, ViewUpdate::EchoConfirmed(0));
        assert_eq!(view.len(), 1);

        drop(view);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_unmount_removes_handlers_and_subscription() {
        let mut broker = TestBroker::start().await;
        let ctx = context(&broker);
        let history = FakeHistory::default();
        let users: Arc<dyn UserDirectory> = Arc::new(FakeUsers::default());

        // A second lease keeps the connection up across the unmount.
        let _keep = ctx.lease();
        let (group, (mut conn, subs)) = tokio::join!(
            GroupChatView::mount(&ctx, &history, users, 7),
            serve(&mut broker, 3)
        );
        let direct = DirectChatView::mount(&ctx, &history, 2, "bob").await;
        assert_eq!(ctx.handler_count(), 1);
        assert_eq!(ctx.connector().router().len(), 3);

        drop(direct);
        drop(group);
        assert_eq!(ctx.handler_count(), 0);
        assert_eq!(ctx.connector().router().len(), 2);

        let group_sub = sub_for(&subs, "/topic/group.7").to_string();
        let unsub = conn.expect(Command::Unsubscribe).await;
        assert_eq!(unsub.get("id"), Some(group_sub.as_str()));
        assert_eq!(ctx.state(), ConnectionState::Connected);

        ctx.shutdown().await;
    }
}
