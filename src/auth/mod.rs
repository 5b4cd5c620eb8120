//! Login state for the chat backend
//!
//! Logging in resolves the email to the user's numeric id and stores both.
//! The id identifies the user in every message; the email is only used in
//! the WebSocket handshake.

use anyhow::{Context, Result};

use crate::api::{get_user_by_email, ApiClient};
use crate::config::Config;
use crate::models::Identity;

/// Resolve `email` and store it as the current identity.
pub async fn login(email: &str, token: Option<String>, force: bool) -> Result<()> {
    let mut config = Config::load()?;

    if !force {
        if let Ok(current) = config.identity() {
            if current.email == email {
                println!(
                    "Already logged in as {} (id={}). Use --force to refresh.",
                    current.email, current.id
                );
                return Ok(());
            }
        }
    }

    if token.is_some() {
        config.auth_token = token;
    }

    let client = ApiClient::new(&config);
    tracing::info!("Looking up {}...", email);
    let user = get_user_by_email(&client, email)
        .await
        .with_context(|| format!("Could not find a user with email {}", email))?;

    let identity = Identity {
        id: user.id,
        email: user.email.clone(),
    };
    config.set_identity(&identity);
    config.save()?;

    println!("Logged in as {} ({}, id={}).", user.username, identity.email, identity.id);
    Ok(())
}

/// Clear stored identity and token
pub async fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_identity();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Display current login status and endpoints
pub async fn status() -> Result<()> {
    let config = Config::load()?;

    match config.identity() {
        Ok(identity) => println!("User:      {} (id={})", identity.email, identity.id),
        Err(_) => println!("User:      not logged in"),
    }
    match config.auth_token {
        Some(_) => println!("Token:     present"),
        None => println!("Token:     none"),
    }
    println!("API:       {}", config.api_base);
    println!("WebSocket: {}", config.ws_url);
    println!("Config:    {}", Config::config_path()?.display());

    Ok(())
}
