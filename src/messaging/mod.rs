//! Real-time messaging over a shared STOMP connection

pub mod connector;
pub mod context;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod reconcile;
pub mod router;
pub mod view;

pub use connector::{ConnectionState, Connector, TransportSettings};
pub use context::{ChatContext, Lease};
pub use directory::{DirectoryCache, NameResolved, UserDirectory};
pub use dispatcher::{Dispatcher, Handler, HandlerId, MessageHandlers};
pub use error::MessagingError;
pub use reconcile::{Conversation, LiveOutcome};
pub use router::{Channel, SubscriptionId};
pub use view::{DirectChatView, GroupChatView, HistorySource, Row, ViewUpdate};
