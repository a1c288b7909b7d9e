//! HTTP retrieval of static and realtime payloads.

mod basic;
mod client;
mod retry;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper, retry};

use crate::error::FetchError;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{debug, info};

/// Whether a response carries data. The provider answers 202/204 while a
/// file is still being prepared; those, like any other non-success status,
/// are worth another attempt.
fn is_ready(status: StatusCode) -> bool {
    status.is_success() && !matches!(status, StatusCode::ACCEPTED | StatusCode::NO_CONTENT)
}

/// One GET attempt.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Bytes, FetchError> {
    let url = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    let req = reqwest::Request::new(reqwest::Method::GET, url);

    let resp = client.execute(req).await?;
    let status = resp.status();
    if !is_ready(status) {
        return Err(FetchError::Unavailable(status));
    }
    Ok(resp.bytes().await?)
}

/// [`fetch_bytes`] under `policy`. `None` means every attempt failed and the
/// period should be skipped.
#[tracing::instrument(skip_all, fields(url = %url))]
pub async fn fetch_with_retry<C, S>(
    client: &C,
    url: &str,
    policy: &RetryPolicy,
    sleeper: &S,
) -> Option<Bytes>
where
    C: HttpClient + ?Sized,
    S: Sleeper + ?Sized,
{
    let started = std::time::Instant::now();
    let bytes = retry(policy, sleeper, |attempt| {
        debug!(attempt, "Fetching");
        fetch_bytes(client, url)
    })
    .await;

    match &bytes {
        Some(b) => debug!(bytes = b.len(), elapsed_ms = started.elapsed().as_millis() as u64, "Fetched"),
        None => info!(attempts = policy.max_attempts, "Fetch abandoned for this period"),
    }
    bytes
}
