//! User and group lookups

use anyhow::Result;
use futures::future::BoxFuture;

use super::client::ApiClient;
use crate::messaging::UserDirectory;
use crate::models::{GroupDto, UserDto, UserId};

pub async fn get_user(client: &ApiClient, id: UserId) -> Result<UserDto> {
    client.get_json(&format!("/users/{}", id)).await
}

pub async fn get_user_by_email(client: &ApiClient, email: &str) -> Result<UserDto> {
    let encoded: String = url::form_urlencoded::byte_serialize(email.as_bytes()).collect();
    client.get_json(&format!("/users/email/{}", encoded)).await
}

/// Groups the user is a member of.
pub async fn my_groups(client: &ApiClient, user_id: UserId) -> Result<Vec<GroupDto>> {
    client
        .get_json(&format!("/groups-management/my?userId={}", user_id))
        .await
}

impl UserDirectory for ApiClient {
    fn display_name(&self, id: UserId) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Ok(get_user(self, id).await?.username) })
    }
}
