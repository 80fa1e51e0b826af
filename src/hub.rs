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

// Process-wide registry of upload execution contexts
//
// Commands are routed to a worker by context tag, and every worker's events
// are re-emitted to hub subscribers tagged with their origin.

use anyhow::{bail, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::listeners::{Listeners, Subscription};
use crate::protocol::{UploadEvent, WorkerCommand};
use crate::uploader::UploadWorker;

/// A worker event tagged with the context that emitted it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEvent {
    pub context_tag: String,
    #[serde(flatten)]
    pub event: UploadEvent,
}

#[derive(Default)]
pub struct UploadHub {
    workers: DashMap<String, Arc<UploadWorker>>,
    events: Arc<Listeners<HubEvent>>,
    forwarders: Mutex<Vec<Subscription>>,
}

impl UploadHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` and start its drain loop
    pub async fn init(&self, worker: Arc<UploadWorker>) -> Result<()> {
        let tag = worker.context_tag().to_string();
        if self.workers.contains_key(&tag) {
            bail!("Upload context '{}' is already registered", tag);
        }

        let events = self.events.clone();
        let origin = tag.clone();
        let forwarder = worker.subscribe(move |event| {
            events.emit(&HubEvent {
                context_tag: origin.clone(),
                event: event.clone(),
            });
        });
        self.forwarders.lock().await.push(forwarder);

        worker.start().await;
        self.workers.insert(tag.clone(), worker);
        info!("Upload context '{}' registered", tag);
        Ok(())
    }

    pub fn worker(&self, context_tag: &str) -> Option<Arc<UploadWorker>> {
        self.workers.get(context_tag).map(|w| w.value().clone())
    }

    pub fn context_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        tags.sort();
        tags
    }

    /// Listen to events from every registered worker
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Route a command to the worker registered under `context_tag`
    pub async fn dispatch(&self, context_tag: &str, command: WorkerCommand) -> Result<()> {
        let Some(worker) = self.worker(context_tag) else {
            bail!("No upload context registered as '{}'", context_tag);
        };
        worker.handle_command(command).await;
        Ok(())
    }

    /// Stop every worker and drop all subscriptions
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<UploadWorker>> =
            self.workers.iter().map(|w| w.value().clone()).collect();
        self.workers.clear();
        for worker in workers {
            worker.shutdown().await;
        }
        self.forwarders.lock().await.clear();
        self.events.clear();
        info!("Upload hub shut down");
    }
}
