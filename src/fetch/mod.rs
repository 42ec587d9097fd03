// src/fetch/mod.rs
use reqwest::Client;
use std::{future::Future, time::Duration};
use tracing::info;

use crate::{cancel::CancelFlag, error::IngestError, period::Period};

pub mod zips;

/// Where period archives come from.
///
/// The orchestrator only needs the raw archive bytes; tests substitute an in-memory source.
pub trait ArchiveSource: Send + Sync + 'static {
    fn fetch(
        &self,
        period: Period,
        cancel: &CancelFlag,
    ) -> impl Future<Output = Result<Vec<u8>, IngestError>> + Send;
}

/// Fetches `{base_url}_{year}_{quarter}.zip` over HTTPS with one shared client per run.
#[derive(Clone)]
pub struct HttpArchiveSource {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpArchiveSource {
    pub fn new(base_url: &str, verify_tls: bool, timeout: Duration) -> Result<Self, IngestError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| IngestError::Transport {
                url: base_url.to_string(),
                reason: format!("building HTTP client: {}", e),
            })?;
        Ok(HttpArchiveSource {
            client,
            base_url: base_url.to_string(),
            timeout,
        })
    }

    pub fn archive_url(&self, period: Period) -> String {
        period.archive_url(&self.base_url)
    }
}

impl ArchiveSource for HttpArchiveSource {
    async fn fetch(&self, period: Period, cancel: &CancelFlag) -> Result<Vec<u8>, IngestError> {
        let url = self.archive_url(period);
        info!(period = %period, url = %url, "downloading");
        zips::download_archive(&self.client, &url, self.timeout, cancel).await
    }
}
