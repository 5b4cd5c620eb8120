//! Data models for chat and directory entities

mod message;
mod user;

pub use message::*;
pub use user::*;
