#![forbid(unsafe_code)]

//! Moves bytes from a remote URL into a partial file, validates the result,
//! and promotes it to its final name.
//!
//! Within one transfer the steps are strictly sequential: HEAD probe for the
//! expected size, streamed GET into the partial file with a progress monitor
//! alongside, content validation, rename. Every failure path deletes the
//! partial file so an aborted transfer never wedges future admissions.

use crate::paths::Target;
use crate::progress::run_monitor;
use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Remotes that serve an HTML error page instead of media start with this.
pub const HTML_ERROR_MARKER: &[u8] = b"<html>";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP client for all transfers. Connection establishment is
/// bounded; the body read is not, since a multi-gigabyte fetch has no
/// sensible overall deadline.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("building HTTP client")
}

/// Runs one complete transfer. On success the final file is in place; on
/// any error the partial file has been removed.
pub async fn download(
    client: &reqwest::Client,
    remote_url: &str,
    target: &Target,
    cancel: &CancellationToken,
) -> Result<()> {
    let result = run_transfer(client, remote_url, target, cancel).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&target.partial_path).await;
    }
    result
}

async fn run_transfer(
    client: &reqwest::Client,
    remote_url: &str,
    target: &Target,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut file = File::create(&target.partial_path)
        .await
        .with_context(|| format!("creating {}", target.partial_path.display()))?;

    let probe = client
        .head(remote_url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .context("size probe failed")?
        .error_for_status()
        .context("size probe failed")?;
    let total: u64 = probe
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .context("remote did not report a parsable content length")?;

    let (done_tx, done_rx) = watch::channel(false);
    let monitor = tokio::spawn(run_monitor(
        target.title.clone(),
        target.partial_path.clone(),
        total,
        done_rx,
    ));

    let streamed = stream_body(client, remote_url, &mut file, cancel).await;
    let _ = done_tx.send(true);
    let _ = monitor.await;
    streamed?;

    file.flush().await.context("flushing partial file")?;
    drop(file);

    validate_artifact(&target.partial_path).await?;

    tokio::fs::rename(&target.partial_path, &target.final_path)
        .await
        .with_context(|| format!("promoting {}", target.final_path.display()))?;
    Ok(())
}

async fn stream_body(
    client: &reqwest::Client,
    remote_url: &str,
    file: &mut File,
    cancel: &CancellationToken,
) -> Result<()> {
    let response = client
        .get(remote_url)
        .send()
        .await
        .context("body fetch failed")?
        .error_for_status()
        .context("body fetch failed")?;

    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                bail!("transfer cancelled by shutdown");
            }
            chunk = stream.next() => {
                match chunk {
                    Some(chunk) => {
                        let chunk = chunk.context("reading response body")?;
                        file.write_all(&chunk)
                            .await
                            .context("writing partial file")?;
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

/// Re-opens the completed file and rejects it when the body is an HTML
/// error page rather than media. Only the prefix is inspected.
async fn validate_artifact(partial_path: &Path) -> Result<()> {
    let mut file = File::open(partial_path)
        .await
        .context("re-reading completed file")?;
    let mut prefix = [0u8; HTML_ERROR_MARKER.len()];
    let mut filled = 0;
    while filled < prefix.len() {
        let read = file
            .read(&mut prefix[filled..])
            .await
            .context("re-reading completed file")?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    if &prefix[..filled] == HTML_ERROR_MARKER {
        bail!("remote served an HTML error page instead of media");
    }
    Ok(())
}
