//! Access to an online replication service.
//!
//! A replication service publishes numbered diffs together with a state file
//! per sequence number and a `state.txt` for the newest one:
//!
//! ```text
//! <base>/state.txt
//! <base>/000/004/567.state.txt
//! <base>/000/004/567.osc.gz
//! ```
//!
//! State files are Java properties with escaped colons:
//! `sequenceNumber=4567` and `timestamp=2024-03-01T10\:00\:00Z`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};

use crate::error::{Error, Result};

/// Position of one diff in the replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationState {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl ReplicationState {
    /// Parse the contents of a state file.
    pub fn parse(content: &str) -> Result<Self> {
        let mut sequence = None;
        let mut timestamp = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().replace("\\:", ":");
            match key.trim() {
                "sequenceNumber" => {
                    sequence = Some(
                        value
                            .parse::<u64>()
                            .map_err(|e| Error::StateParse(format!("bad sequenceNumber '{}': {}", value, e)))?,
                    );
                }
                "timestamp" => {
                    timestamp = Some(
                        DateTime::parse_from_rfc3339(&value)
                            .map_err(|e| Error::StateParse(format!("bad timestamp '{}': {}", value, e)))?
                            .with_timezone(&Utc),
                    );
                }
                _ => {}
            }
        }

        Ok(Self {
            sequence: sequence.ok_or_else(|| Error::StateParse("missing sequenceNumber".to_string()))?,
            timestamp: timestamp.ok_or_else(|| Error::StateParse("missing timestamp".to_string()))?,
        })
    }
}

/// Directory path of a sequence number: 4567 becomes `000/004/567`.
pub fn sequence_path(seq: u64) -> String {
    format!("{:03}/{:03}/{:03}", seq / 1_000_000, (seq / 1000) % 1000, seq % 1000)
}

/// Read access to a replication service.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// State of the given sequence, or of the newest diff with `None`.
    /// Returns `None` if the service has no such state.
    async fn get_state(&self, seq: Option<u64>) -> Result<Option<ReplicationState>>;

    /// Raw (compressed) diff for a sequence, `None` if it is not published.
    async fn get_diff(&self, seq: u64) -> Result<Option<Vec<u8>>>;
}

/// Replication service reached over HTTP(S).
pub struct HttpSource {
    client: Client,
    base_url: String,
}

impl HttpSource {
    /// Create a source whose requests time out after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn state_url(&self, seq: Option<u64>) -> String {
        match seq {
            Some(seq) => format!("{}/{}.state.txt", self.base_url, sequence_path(seq)),
            None => format!("{}/state.txt", self.base_url),
        }
    }

    fn diff_url(&self, seq: u64) -> String {
        format!("{}/{}.osc.gz", self.base_url, sequence_path(seq))
    }

    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>> {
        log::debug!("Fetching {}", url);
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.error_for_status()?.bytes().await?;
        Ok(Some(body.to_vec()))
    }
}

#[async_trait]
impl ReplicationSource for HttpSource {
    async fn get_state(&self, seq: Option<u64>) -> Result<Option<ReplicationState>> {
        match self.fetch(&self.state_url(seq)).await? {
            Some(body) => Ok(Some(ReplicationState::parse(&String::from_utf8_lossy(&body))?)),
            None => Ok(None),
        }
    }

    async fn get_diff(&self, seq: u64) -> Result<Option<Vec<u8>>> {
        self.fetch(&self.diff_url(seq)).await
    }
}

/// Find the newest sequence whose timestamp is not after `ts`.
///
/// Binary search over the published state files. Sequences whose state file
/// is missing are treated as older than `ts`.
pub async fn timestamp_to_sequence<S: ReplicationSource + ?Sized>(
    source: &S,
    ts: DateTime<Utc>,
) -> Result<Option<u64>> {
    let Some(newest) = source.get_state(None).await? else {
        return Ok(None);
    };
    if ts >= newest.timestamp {
        return Ok(Some(newest.sequence));
    }

    let mut lower = 0;
    let mut upper = newest.sequence;
    while upper - lower > 1 {
        let mid = lower + (upper - lower) / 2;
        match source.get_state(Some(mid)).await? {
            Some(state) if state.timestamp > ts => upper = mid,
            _ => lower = mid,
        }
    }

    Ok(Some(lower))
}
