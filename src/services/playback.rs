//! Playback Mode Selector
//!
//! `decide` is pure; `PlaybackSelector` adds the probe call and its cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    Direct,
    Proxy,
    Transcode,
}

impl std::str::FromStr for PlaybackMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(PlaybackMode::Direct),
            "proxy" => Ok(PlaybackMode::Proxy),
            "transcode" => Ok(PlaybackMode::Transcode),
            other => Err(format!("Unknown playback mode: {}", other)),
        }
    }
}

/// Codec probe report
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub compatible: bool,
    #[serde(default)]
    pub needs_remux: bool,
    #[serde(default)]
    pub needs_transcode: bool,
    /// `direct`, `proxy`, `remux` or `transcode`
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DecideOptions {
    pub skip_probe: bool,
    pub forced_mode: Option<PlaybackMode>,
    pub is_iptv_stream: bool,
    /// Client platform plays the common codecs natively
    pub native_codec_support: bool,
}

/// Candidate URLs for each mode
#[derive(Debug, Clone)]
pub struct PlaybackUrls {
    pub direct: String,
    pub proxy: String,
    /// `None` when no transcoder is configured
    pub transcode: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackDecision {
    pub mode: PlaybackMode,
    pub stream_url: String,
    pub reason: String,
}

/// Pick a delivery mode. Fails open toward playability.
pub fn decide(
    urls: &PlaybackUrls,
    opts: &DecideOptions,
    probe: Option<&ProbeResult>,
) -> PlaybackDecision {
    let probe = if opts.skip_probe { None } else { probe };

    let (mode, reason) = if let Some(forced) = opts.forced_mode {
        (forced, "Forced mode".to_string())
    } else if opts.native_codec_support {
        (PlaybackMode::Direct, "Platform supports codecs natively".to_string())
    } else if opts.is_iptv_stream {
        match probe {
            Some(p) if p.needs_transcode => (
                PlaybackMode::Transcode,
                p.reason
                    .clone()
                    .unwrap_or_else(|| "Probe requires transcoding".to_string()),
            ),
            Some(_) => (PlaybackMode::Proxy, "IPTV stream through proxy".to_string()),
            None => (
                PlaybackMode::Proxy,
                "Probe unavailable, IPTV defaults to proxy".to_string(),
            ),
        }
    } else {
        match probe {
            Some(p) => (
                recommended_mode(p),
                p.reason
                    .clone()
                    .unwrap_or_else(|| "Probe recommendation".to_string()),
            ),
            None => (PlaybackMode::Direct, "Probe unavailable, defaulting to direct".to_string()),
        }
    };

    let stream_url = match mode {
        PlaybackMode::Transcode => match &urls.transcode {
            Some(url) => url.clone(),
            None => {
                return PlaybackDecision {
                    mode: PlaybackMode::Proxy,
                    stream_url: urls.proxy.clone(),
                    reason: format!("{}; no transcoder configured, using proxy", reason),
                }
            }
        },
        PlaybackMode::Proxy => urls.proxy.clone(),
        // IPTV keeps credentials server-side even in direct mode
        PlaybackMode::Direct if opts.is_iptv_stream => urls.proxy.clone(),
        PlaybackMode::Direct => urls.direct.clone(),
    };

    PlaybackDecision {
        mode,
        stream_url,
        reason,
    }
}

fn recommended_mode(probe: &ProbeResult) -> PlaybackMode {
    match probe.recommendation.as_deref().map(str::to_lowercase).as_deref() {
        Some("direct") => PlaybackMode::Direct,
        Some("proxy") | Some("remux") => PlaybackMode::Proxy,
        Some("transcode") => PlaybackMode::Transcode,
        _ if probe.needs_transcode => PlaybackMode::Transcode,
        _ if probe.needs_remux => PlaybackMode::Proxy,
        _ if probe.compatible => PlaybackMode::Direct,
        _ => PlaybackMode::Proxy,
    }
}

/// Codec inspection of a stream URL
#[async_trait]
pub trait StreamProber: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeResult>;
}

/// `GET {base}/probe?url=` on the media helper service
pub struct HttpProber {
    http: Client,
    base_url: String,
}

impl HttpProber {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create probe client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Transcoded output of `source` on the media helper service
pub fn transcode_url(media_base: &str, source: &str) -> String {
    format!(
        "{}/transcode?url={}",
        media_base.trim_end_matches('/'),
        urlencoding::encode(source)
    )
}

#[async_trait]
impl StreamProber for HttpProber {
    async fn probe(&self, url: &str) -> Result<ProbeResult> {
        let endpoint = format!("{}/probe?url={}", self.base_url, urlencoding::encode(url));
        let response = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.without_url().to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "Probe returned HTTP {}",
                response.status().as_u16()
            )));
        }
        response
            .json::<ProbeResult>()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.without_url().to_string()))
    }
}

/// Probes with an LRU+TTL cache in front and applies `decide`
pub struct PlaybackSelector {
    prober: Option<Arc<dyn StreamProber>>,
    cache: Mutex<LruCache<String, (Instant, ProbeResult)>>,
    ttl: Duration,
}

impl PlaybackSelector {
    pub fn new(prober: Option<Arc<dyn StreamProber>>, ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            prober,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn has_prober(&self) -> bool {
        self.prober.is_some()
    }

    /// Cached probe; failures read as "no probe"
    pub async fn probe(&self, url: &str) -> Option<ProbeResult> {
        let prober = self.prober.as_ref()?;

        if let Ok(mut cache) = self.cache.lock() {
            if let Some((at, result)) = cache.get(url) {
                if at.elapsed() < self.ttl {
                    return Some(result.clone());
                }
            }
        }

        match prober.probe(url).await {
            Ok(result) => {
                if let Ok(mut cache) = self.cache.lock() {
                    cache.put(url.to_string(), (Instant::now(), result.clone()));
                }
                Some(result)
            }
            Err(e) => {
                warn!("Stream probe failed: {}", e);
                None
            }
        }
    }

    pub async fn select(&self, urls: &PlaybackUrls, opts: &DecideOptions) -> PlaybackDecision {
        let needs_probe =
            !opts.skip_probe && opts.forced_mode.is_none() && !opts.native_codec_support;
        let probe = if needs_probe {
            self.probe(&urls.direct).await
        } else {
            None
        };
        let decision = decide(urls, opts, probe.as_ref());
        debug!(mode = ?decision.mode, reason = %decision.reason, "Playback mode decided");
        decision
    }
}
