//! User and group directory models

use serde::{Deserialize, Serialize};

use super::message::{GroupId, UserId};

/// User profile as returned by the users endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub id: UserId,
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

/// A group chat the user belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDto {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub members_id: Vec<UserId>,
}
