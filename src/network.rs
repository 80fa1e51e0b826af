// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Network health classification and upload admission

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;

pub const UNSTABLE_LOSS_PCT: f64 = 5.0;
pub const UNSTABLE_RTT_MS: f64 = 200.0;
pub const DEGRADED_LOSS_PCT: f64 = 2.0;
pub const DEGRADED_RTT_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkHealth {
    Healthy,
    Degraded,
    Unstable,
}

/// Classify transport health from packet loss (percent) and round-trip time
/// (milliseconds). A missing metric counts as unstable.
pub fn evaluate_health(packet_loss_pct: Option<f64>, rtt_ms: Option<f64>) -> NetworkHealth {
    let (Some(loss), Some(rtt)) = (packet_loss_pct, rtt_ms) else {
        return NetworkHealth::Unstable;
    };

    if loss >= UNSTABLE_LOSS_PCT || rtt >= UNSTABLE_RTT_MS {
        NetworkHealth::Unstable
    } else if loss >= DEGRADED_LOSS_PCT || rtt >= DEGRADED_RTT_MS {
        NetworkHealth::Degraded
    } else {
        NetworkHealth::Healthy
    }
}

/// One sample of a single transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub packet_loss_pct: Option<f64>,
    pub rtt_ms: Option<f64>,
    /// Estimated available outgoing bitrate, bits per second
    pub available_bitrate: Option<u64>,
}

impl TransportStats {
    /// Worse loss and RTT, more conservative bandwidth
    pub fn merge(&self, other: &TransportStats) -> TransportStats {
        TransportStats {
            packet_loss_pct: pick(self.packet_loss_pct, other.packet_loss_pct, f64::max),
            rtt_ms: pick(self.rtt_ms, other.rtt_ms, f64::max),
            available_bitrate: pick(self.available_bitrate, other.available_bitrate, u64::min),
        }
    }

    pub fn health(&self) -> NetworkHealth {
        evaluate_health(self.packet_loss_pct, self.rtt_ms)
    }
}

fn pick<T: Copy>(a: Option<T>, b: Option<T>, f: fn(T, T) -> T) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (a, b) => a.or(b),
    }
}

/// Current admission inputs shared with the upload path
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub health: NetworkHealth,
    /// Transfer allowance in bytes per second; `None` or 0 is unthrottled
    pub rate_bps: Option<u64>,
    pub streaming_active: bool,
}

impl NetworkStatus {
    /// Uploads are paused only while an unstable stream is live
    pub fn uploads_paused(&self) -> bool {
        self.streaming_active && self.health == NetworkHealth::Unstable
    }

    pub fn effective_rate(&self) -> Option<u64> {
        self.rate_bps.filter(|rate| *rate > 0)
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            health: NetworkHealth::Healthy,
            rate_bps: None,
            streaming_active: false,
        }
    }
}

/// Holds the current [`NetworkStatus`] and lets the upload path watch it
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(NetworkStatus {
            rate_bps: config.default_rate_bps,
            ..NetworkStatus::default()
        })
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    pub fn set_status(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if current.uploads_paused() != status.uploads_paused() {
                info!(
                    "Uploads {} (health={:?}, streaming={})",
                    if status.uploads_paused() { "paused" } else { "resumed" },
                    status.health,
                    status.streaming_active
                );
            }
            *current = status;
            true
        });
    }

    pub fn uploads_paused(&self) -> bool {
        self.tx.borrow().uploads_paused()
    }
}

/// Resolve once `rx` reports paused uploads
pub async fn wait_for_pause(rx: &mut watch::Receiver<NetworkStatus>) {
    if rx.wait_for(|status| status.uploads_paused()).await.is_err() {
        // Monitor gone; nothing will pause us again
        std::future::pending::<()>().await;
    }
}

/// Resolve once `rx` reports uploads allowed
pub async fn wait_for_resume(rx: &mut watch::Receiver<NetworkStatus>) {
    if rx.wait_for(|status| !status.uploads_paused()).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Snapshot of the interactive stream's transports
#[derive(Debug, Clone, Default)]
pub struct StreamSample {
    pub streaming_active: bool,
    pub transports: Vec<TransportStats>,
}

#[async_trait]
pub trait TransportStatsSource: Send + Sync {
    async fn sample(&self) -> Result<StreamSample>;
}

/// Derive the status published for one sample
pub fn status_from_sample(sample: &StreamSample, config: &NetworkConfig) -> NetworkStatus {
    let merged = sample
        .transports
        .iter()
        .copied()
        .reduce(|a, b| a.merge(&b))
        .unwrap_or_default();

    let rate_bps = if sample.streaming_active {
        merged
            .available_bitrate
            .map(|bits| ((bits as f64 / 8.0) * config.upload_bandwidth_share) as u64)
            .or(config.default_rate_bps)
    } else {
        config.default_rate_bps
    };

    NetworkStatus {
        health: merged.health(),
        rate_bps,
        streaming_active: sample.streaming_active,
    }
}

/// Periodically sample `source` and publish the result to `monitor`
pub fn spawn_sampler(
    monitor: Arc<NetworkMonitor>,
    source: Arc<dyn TransportStatsSource>,
    config: NetworkConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.sample_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match source.sample().await {
                Ok(sample) => {
                    let status = status_from_sample(&sample, &config);
                    debug!("Network sample: {:?}", status);
                    monitor.set_status(status);
                }
                Err(e) => warn!("Failed to sample transport stats: {}", e),
            }
        }

        debug!("Network sampler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_takes_worst() {
        let a = TransportStats {
            packet_loss_pct: Some(1.0),
            rtt_ms: Some(150.0),
            available_bitrate: Some(2_000_000),
        };
        let b = TransportStats {
            packet_loss_pct: Some(3.0),
            rtt_ms: None,
            available_bitrate: Some(800_000),
        };
        let merged = a.merge(&b);
        assert_eq!(merged.packet_loss_pct, Some(3.0));
        assert_eq!(merged.rtt_ms, Some(150.0));
        assert_eq!(merged.available_bitrate, Some(800_000));
        assert_eq!(merged.health(), NetworkHealth::Degraded);
    }

    #[test]
    fn test_pause_only_while_streaming() {
        let mut status = NetworkStatus {
            health: NetworkHealth::Unstable,
            rate_bps: None,
            streaming_active: true,
        };
        assert!(status.uploads_paused());
        status.streaming_active = false;
        assert!(!status.uploads_paused());
    }

    #[test]
    fn test_rate_from_sample() {
        let config = NetworkConfig {
            sample_interval_ms: 1000,
            upload_bandwidth_share: 0.25,
            default_rate_bps: None,
        };
        let sample = StreamSample {
            streaming_active: true,
            transports: vec![
                TransportStats {
                    packet_loss_pct: Some(0.0),
                    rtt_ms: Some(20.0),
                    available_bitrate: Some(8_000_000),
                },
                TransportStats {
                    packet_loss_pct: Some(0.5),
                    rtt_ms: Some(40.0),
                    available_bitrate: Some(4_000_000),
                },
            ],
        };
        let status = status_from_sample(&sample, &config);
        assert_eq!(status.health, NetworkHealth::Healthy);
        assert_eq!(status.rate_bps, Some(125_000));

        let idle = StreamSample::default();
        let status = status_from_sample(&idle, &config);
        assert_eq!(status.health, NetworkHealth::Unstable);
        assert!(!status.uploads_paused());
        assert_eq!(status.rate_bps, None);
    }
}
