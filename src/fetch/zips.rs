// src/fetch/zips.rs
use futures_util::StreamExt;
use reqwest::Client;
use std::{error::Error as StdError, time::Duration};
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::{cancel::CancelFlag, error::IngestError};

const PROGRESS_STEP: u64 = 10 * 1024 * 1024;
/// Upper bound on the buffer reserved from `Content-Length`; the header is only a hint.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Stream the archive at `url` into memory.
///
/// `read_timeout` bounds the request and every body block. The flag is polled after each block;
/// on cancellation the partial buffer is dropped and `Cancelled` is returned.
#[instrument(level = "debug", skip(client, url, cancel), fields(url = %url))]
pub async fn download_archive(
    client: &Client,
    url: &str,
    read_timeout: Duration,
    cancel: &CancelFlag,
) -> Result<Vec<u8>, IngestError> {
    cancel.check()?;

    let response = timeout(read_timeout, client.get(url).send())
        .await
        .map_err(|_| timed_out(url, read_timeout))?
        .map_err(|e| classify(url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(IngestError::Transport {
            url: url.to_string(),
            reason: format!("HTTP error: {}", status),
        });
    }

    let total = response.content_length();
    let mut zip_data = Vec::with_capacity(total.map_or(0, |t| t.min(MAX_PREALLOC)) as usize);
    let mut stream = response.bytes_stream();
    let mut downloaded = 0u64;
    let mut next_report = PROGRESS_STEP;

    loop {
        let block = match timeout(read_timeout, stream.next()).await {
            Ok(Some(block)) => block.map_err(|e| classify(url, e))?,
            Ok(None) => break,
            Err(_) => return Err(timed_out(url, read_timeout)),
        };
        zip_data.extend_from_slice(&block);
        downloaded += block.len() as u64;

        if cancel.is_cancelled() {
            debug!(downloaded, "download cancelled, discarding partial archive");
            return Err(IngestError::Cancelled);
        }

        if downloaded >= next_report {
            match total {
                Some(t) if t > 0 => debug!(
                    "downloaded {} of {} MiB ({:.1}%)",
                    downloaded / (1024 * 1024),
                    t / (1024 * 1024),
                    downloaded as f64 * 100.0 / t as f64
                ),
                _ => debug!("downloaded {} MiB", downloaded / (1024 * 1024)),
            }
            next_report = downloaded - downloaded % PROGRESS_STEP + PROGRESS_STEP;
        }
    }

    debug!("download complete: {} bytes", zip_data.len());
    Ok(zip_data)
}

fn timed_out(url: &str, after: Duration) -> IngestError {
    IngestError::Transport {
        url: url.to_string(),
        reason: format!("timed out after {:?}", after),
    }
}

/// Map a reqwest failure onto the transport/TLS split.
fn classify(url: &str, err: reqwest::Error) -> IngestError {
    let reason = error_chain(&err);
    if is_certificate_failure(&reason) {
        IngestError::Tls {
            url: url.to_string(),
            reason,
        }
    } else {
        IngestError::Transport {
            url: url.to_string(),
            reason,
        }
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    msg
}

fn is_certificate_failure(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("certificate") || lower.contains("unknownissuer")
}
