//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result};
use serde::Deserialize;

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/api", port)
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str, token: &str) -> Result<T> {
    let mut request = reqwest::Client::new().get(url);
    if !token.is_empty() {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("failed to connect to crucibled at {} — is it running?", url))?;
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        anyhow::bail!("unauthorized — set CRUCIBLE_TOKEN");
    }
    response.json::<T>().await.context("failed to parse response")
}
