use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Global cap on transfers running at the same time.
pub const DEFAULT_MAX_PARALLEL: usize = 4;
/// Number of byte ranges a sized transfer is split into.
pub const DEFAULT_SEGMENTS: usize = 4;
/// Read buffer used by segment workers (8 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
/// Per-segment byte boundary at which progress is republished (1 MiB).
pub const DEFAULT_PUBLISH_EVERY: u64 = 1024 * 1024;
/// Minimum wall-clock gap between two speed samples.
pub const DEFAULT_SPEED_INTERVAL: Duration = Duration::from_millis(500);

/// Tunables for a [`Downloader`](crate::Downloader).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_parallel: usize,
    pub segments: usize,
    pub chunk_size: usize,
    pub publish_every: u64,
    #[serde(with = "millis")]
    pub speed_interval: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Applied to every body read of a segment, not to the whole request.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    pub user_agent: String,
    /// Headers applied to transfers enqueued without any headers of their own.
    pub default_headers: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut default_headers = BTreeMap::new();
        default_headers.insert("User-Agent".to_string(), "Mozilla/5.0".to_string());

        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            segments: DEFAULT_SEGMENTS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            publish_every: DEFAULT_PUBLISH_EVERY,
            speed_interval: DEFAULT_SPEED_INTERVAL,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            user_agent: concat!("segdl/", env!("CARGO_PKG_VERSION")).to_string(),
            default_headers,
        }
    }
}

impl EngineConfig {
    /// Clamp values that would make the engine unusable.
    pub fn normalized(mut self) -> Self {
        self.max_parallel = self.max_parallel.max(1);
        self.segments = self.segments.max(1);
        self.chunk_size = self.chunk_size.max(1);
        self.publish_every = self.publish_every.max(1);
        self
    }

    pub(crate) fn build_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(self.connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
