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

//! Byte-rate token bucket for the transfer body.
//!
//! Capacity and refill rate both equal the allowance, so at most one second
//! of burst is ever available. A request larger than the capacity waits for
//! a full bucket and then runs the bucket into debt, which later requests
//! pay back before they proceed.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::network::NetworkStatus;

#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket for `rate_bps` bytes per second
    pub fn new(rate_bps: u64) -> Self {
        let rate = rate_bps.max(1) as f64;
        Self {
            rate,
            tokens: rate,
            last_refill: Instant::now(),
        }
    }

    /// `None` when the allowance means "unthrottled"
    pub fn for_rate(rate_bps: Option<u64>) -> Option<Self> {
        rate_bps.filter(|rate| *rate > 0).map(Self::new)
    }

    pub fn rate(&self) -> u64 {
        self.rate as u64
    }

    pub fn capacity(&self) -> f64 {
        self.rate
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Change the allowance, keeping accrued tokens up to the new capacity
    pub fn set_rate(&mut self, rate_bps: u64) {
        self.refill();
        self.rate = rate_bps.max(1) as f64;
        self.tokens = self.tokens.min(self.rate);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;
    }

    /// Take `n` tokens if they are available now
    pub fn try_consume(&mut self, n: u64) -> bool {
        self.refill();
        if self.tokens >= n as f64 {
            self.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Wait until `n` bytes may be sent, then take them.
    ///
    /// Dropping the future before it completes leaves the bucket untouched.
    pub async fn consume(&mut self, n: u64) {
        let needed = (n as f64).min(self.rate);
        self.refill();
        if self.tokens < needed {
            let wait = (needed - self.tokens) / self.rate;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            self.refill();
        }
        self.tokens -= n as f64;
    }
}

/// Split `data` into `chunk_size` pieces, each released through a token
/// bucket that follows the allowance published on `status`.
pub fn throttled_body(
    data: Bytes,
    chunk_size: usize,
    status: watch::Receiver<NetworkStatus>,
) -> BoxStream<'static, std::io::Result<Bytes>> {
    let chunk_size = chunk_size.max(1);
    let bucket = TokenBucket::for_rate(status.borrow().effective_rate());

    stream::unfold(
        (data, 0usize, bucket, status),
        move |(data, offset, mut bucket, status)| async move {
            if offset >= data.len() {
                return None;
            }
            let end = (offset + chunk_size).min(data.len());
            let chunk = data.slice(offset..end);

            let rate = status.borrow().effective_rate();
            bucket = match (rate, bucket) {
                (Some(rate), Some(mut b)) => {
                    if rate != b.rate() {
                        b.set_rate(rate);
                    }
                    Some(b)
                }
                (Some(rate), None) => Some(TokenBucket::new(rate)),
                (None, _) => None,
            };
            if let Some(b) = bucket.as_mut() {
                b.consume(chunk.len() as u64).await;
            }

            Some((Ok(chunk), (data, end, bucket, status)))
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_full_bucket_passes_immediately() {
        let mut bucket = TokenBucket::new(1000);
        let start = Instant::now();
        bucket.consume(1000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!bucket.try_consume(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_refill() {
        let mut bucket = TokenBucket::new(1000);
        bucket.consume(1000).await;

        let start = Instant::now();
        bucket.consume(500).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(499), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(510), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_runs_into_debt() {
        let mut bucket = TokenBucket::new(100);
        bucket.consume(300).await;
        assert!(bucket.available() < 0.0);

        let start = Instant::now();
        bucket.consume(100).await;
        // 200 debt plus 100 requested at 100/s
        assert!(start.elapsed() >= Duration::from_millis(2990));
    }

    #[test]
    fn test_zero_rate_is_unthrottled() {
        assert!(TokenBucket::for_rate(None).is_none());
        assert!(TokenBucket::for_rate(Some(0)).is_none());
        assert_eq!(TokenBucket::for_rate(Some(64)).map(|b| b.rate()), Some(64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_body_yields_all_chunks() {
        let (_tx, rx) = watch::channel(NetworkStatus {
            rate_bps: Some(4),
            ..NetworkStatus::default()
        });
        let start = Instant::now();
        let chunks: Vec<Bytes> = throttled_body(Bytes::from_static(b"abcdefghij"), 4, rx)
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
        // First chunk drains the bucket; the next two wait 1s and 0.5s
        assert!(start.elapsed() >= Duration::from_millis(1490));
    }
}
