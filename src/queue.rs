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

// Per-context retry scheduler
//
// Not synchronized; the owning worker wraps it in a lock.

use std::collections::{HashMap, VecDeque};

/// Backoff parameters for [`UploadQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-based)
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.saturating_sub(1).min(63);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 4000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    pub key: String,
    pub payload: T,
    pub retry_count: u32,
    pub next_attempt_at: i64,
    pub created_at: i64,
    pub in_flight: bool,
}

/// Result of [`UploadQueue::enqueue`]
#[derive(Debug, PartialEq)]
pub enum EnqueueOutcome<T> {
    Inserted,
    Merged,
    /// The item is being processed; the payload is handed back
    Busy(T),
}

pub struct UploadQueue<T> {
    policy: RetryPolicy,
    items: HashMap<String, QueueItem<T>>,
    order: VecDeque<String>,
}

impl<T> UploadQueue<T> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            items: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Insert a new item ready at `now`, or merge into a waiting one
    pub fn enqueue<F>(&mut self, key: &str, payload: T, now: i64, merge: F) -> EnqueueOutcome<T>
    where
        F: FnOnce(&mut T, T),
    {
        if let Some(item) = self.items.get_mut(key) {
            if item.in_flight {
                return EnqueueOutcome::Busy(payload);
            }
            merge(&mut item.payload, payload);
            return EnqueueOutcome::Merged;
        }

        self.items.insert(
            key.to_string(),
            QueueItem {
                key: key.to_string(),
                payload,
                retry_count: 0,
                next_attempt_at: now,
                created_at: now,
                in_flight: false,
            },
        );
        self.order.push_back(key.to_string());
        EnqueueOutcome::Inserted
    }

    /// First waiting item that is due, in insertion order
    pub fn get_next_ready(&self, now: i64) -> Option<&QueueItem<T>> {
        self.order
            .iter()
            .filter_map(|key| self.items.get(key))
            .find(|item| !item.in_flight && item.next_attempt_at <= now)
    }

    /// Earliest attempt time among waiting items
    pub fn get_next_due_time(&self) -> Option<i64> {
        self.items
            .values()
            .filter(|item| !item.in_flight)
            .map(|item| item.next_attempt_at)
            .min()
    }

    pub fn mark_in_flight(&mut self, key: &str) -> bool {
        match self.items.get_mut(key) {
            Some(item) => {
                item.in_flight = true;
                true
            }
            None => false,
        }
    }

    /// Count a failed attempt and push the item back.
    ///
    /// Returns `false` once the retry budget is exhausted; the item is left
    /// in place for the caller to remove.
    pub fn schedule_retry(&mut self, key: &str, now: i64) -> bool {
        let Some(item) = self.items.get_mut(key) else {
            return false;
        };
        item.in_flight = false;
        item.retry_count += 1;
        if item.retry_count > self.policy.max_retries {
            return false;
        }
        item.next_attempt_at = now + self.policy.delay_ms(item.retry_count) as i64;
        true
    }

    /// Push the item back without spending retry budget
    pub fn schedule_retry_without_increment(&mut self, key: &str, now: i64) -> bool {
        let Some(item) = self.items.get_mut(key) else {
            return false;
        };
        item.in_flight = false;
        item.next_attempt_at = now + self.policy.base_delay_ms as i64;
        true
    }

    /// Mutate a queued payload in place
    pub fn update<F>(&mut self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        match self.items.get_mut(key) {
            Some(item) => {
                f(&mut item.payload);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&QueueItem<T>> {
        self.items.get(key)
    }

    /// Keys whose payload matches `predicate`, in insertion order
    pub fn keys_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&T) -> bool,
    {
        self.order
            .iter()
            .filter(|key| self.items.get(*key).is_some_and(|item| predicate(&item.payload)))
            .cloned()
            .collect()
    }

    /// Remove an item
    pub fn complete(&mut self, key: &str) -> Option<QueueItem<T>> {
        let item = self.items.remove(key)?;
        self.order.retain(|k| k != key);
        Some(item)
    }

    /// Make every waiting item due at `now`
    pub fn make_all_ready(&mut self, now: i64) {
        for item in self.items.values_mut().filter(|item| !item.in_flight) {
            item.next_attempt_at = now;
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.items.values().filter(|item| item.in_flight).count()
    }
}
