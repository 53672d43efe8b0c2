// src/content.rs
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const FORTUNE_API_URL: &str = "https://api.apiverve.com/v1/fortunecookie";
const FORTUNE_TIMEOUT: Duration = Duration::from_secs(10);

pub const FORTUNE_TYPES: [&str; 6] = ["大吉", "中吉", "小吉", "吉", "末吉", "凶"];

const FALLBACK_FORTUNES: [(&str, &str); 6] = [
    ("大吉", "Great luck awaits you today!"),
    ("中吉", "Good things are coming your way."),
    ("小吉", "A peaceful day with small joys."),
    ("吉", "Steady progress leads to success."),
    ("末吉", "Better luck in the afternoon."),
    ("凶", "Be cautious today."),
];

/// What a paid play delivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fortune {
    pub fortune: String,
    pub message: String,
}

/// Priced content handed out once a payment is confirmed. Never fails.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn fetch(&self) -> Fortune;
}

pub fn fallback_fortune() -> Fortune {
    let (fortune, message) = FALLBACK_FORTUNES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FALLBACK_FORTUNES[0]);
    Fortune {
        fortune: fortune.to_string(),
        message: message.to_string(),
    }
}

fn random_fortune_type() -> &'static str {
    FORTUNE_TYPES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FORTUNE_TYPES[0])
}

#[derive(Debug, Deserialize)]
struct FortuneResponse {
    status: String,
    #[serde(default)]
    data: Option<FortuneData>,
}

#[derive(Debug, Deserialize)]
struct FortuneData {
    #[serde(default)]
    fortune: Option<String>,
}

impl FortuneResponse {
    fn into_message(self) -> Option<String> {
        if self.status != "ok" {
            return None;
        }
        self.data
            .and_then(|d| d.fortune)
            .filter(|f| !f.trim().is_empty())
    }
}

/// Fortune cookie API client, with local fortunes when the API key is
/// missing or the call fails.
pub struct FortuneClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl FortuneClient {
    pub fn new(api_key: Option<String>) -> anyhow::Result<Self> {
        Self::with_url(FORTUNE_API_URL, api_key)
    }

    pub fn with_url(url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(FORTUNE_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    async fn fetch_remote(&self, api_key: &str) -> anyhow::Result<String> {
        let response = self
            .http
            .get(&self.url)
            .header("X-API-Key", api_key)
            .send()
            .await?
            .error_for_status()?;

        response
            .json::<FortuneResponse>()
            .await?
            .into_message()
            .ok_or_else(|| anyhow::anyhow!("Invalid API response"))
    }
}

#[async_trait]
impl ContentProvider for FortuneClient {
    async fn fetch(&self) -> Fortune {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!("FORTUNE_API_KEY not set, using fallback");
            return fallback_fortune();
        };

        match self.fetch_remote(api_key).await {
            Ok(message) => Fortune {
                fortune: random_fortune_type().to_string(),
                message,
            },
            Err(e) => {
                warn!(error = %e, "Failed to fetch fortune from API");
                fallback_fortune()
            }
        }
    }
}
