use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::info;

use crate::api::IngestError;
use crate::source::{Fetch, RecordSource, SourceBatch};

/// readsb-hist archives publish one snapshot every 5 minutes.
const MINUTE_STEP: u32 = 5;
/// Minutes in a day; the archive holds at most one day per directory.
const END_OF_DAY: u32 = 1440;

/// Bulk source over an ADS-B Exchange readsb-hist day directory. Snapshot
/// files are named by minute-of-day (`000000Z.json.gz`, `000500Z.json.gz`,
/// ...), which doubles as the ingestion cursor. Gaps in the archive (404s)
/// are skipped; anything else is a transient error and retried upstream.
pub struct ReadsbHistSource {
    client: reqwest::Client,
    base_url: String,
}

impl ReadsbHistSource {
    pub fn new(base_url: &str, fetch_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("bdi-ingest")
            .timeout(fetch_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn file_url(&self, minute: u32) -> String {
        format!("{}/{:06}Z.json.gz", self.base_url, minute)
    }
}

#[async_trait]
impl RecordSource for ReadsbHistSource {
    async fn fetch_batch(&self, cursor: &str) -> Result<Fetch, IngestError> {
        let mut minute: u32 = cursor.parse().unwrap_or(0);

        while minute < END_OF_DAY {
            let url = self.file_url(minute);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| IngestError::TransientSource(e.to_string()))?;

            match response.status() {
                status if status.is_success() => {
                    let payload = response
                        .bytes()
                        .await
                        .map_err(|e| IngestError::TransientSource(e.to_string()))?;

                    info!(url, len = payload.len(), "fetched snapshot");
                    counter!("ingest_snapshots_fetched_total").increment(1);
                    return Ok(Fetch::Batch(SourceBatch {
                        id: format!("{:06}Z", minute),
                        payload,
                        next_cursor: (minute + MINUTE_STEP).to_string(),
                    }));
                }
                status if status == reqwest::StatusCode::NOT_FOUND => {
                    // Missing minute-file, the archive has gaps
                    counter!("ingest_snapshots_missing_total").increment(1);
                    minute += MINUTE_STEP;
                }
                status => {
                    return Err(IngestError::TransientSource(format!(
                        "{url} returned {status}"
                    )));
                }
            }
        }

        Ok(Fetch::EndOfStream)
    }
}
