//! Adaptive issue-tracker live sync.
//!
//! Polls the injected tracker client on an interval that tightens to a
//! floor while things are changing and backs off toward a ceiling while
//! they are not. An external mutation signal (the session saw a
//! tracker-mutating tool call) snaps the interval back to the floor and
//! polls immediately.

use crate::LoopError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: String,
    pub title: String,
    pub state: String,
}

#[async_trait]
pub trait TrackerClient: Send + Sync {
    async fn list_items(&self, unit_id: &str) -> Result<Vec<TrackedItem>, LoopError>;
    async fn update_item(&self, item: &TrackedItem) -> Result<(), LoopError>;
}

#[derive(Clone, Copy, Debug)]
pub struct PollSettings {
    pub floor: Duration,
    pub ceiling: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(2),
            ceiling: Duration::from_secs(60),
        }
    }
}

pub struct TrackerPoller {
    client: Arc<dyn TrackerClient>,
    unit_id: String,
    settings: PollSettings,
    mutations: Arc<Notify>,
    cancel: Arc<Notify>,
    updates: mpsc::UnboundedSender<Vec<TrackedItem>>,
}

impl TrackerPoller {
    pub fn new(
        client: Arc<dyn TrackerClient>,
        unit_id: impl Into<String>,
        settings: PollSettings,
        mutations: Arc<Notify>,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<TrackedItem>>) {
        let (updates, updates_rx) = mpsc::unbounded_channel();
        (
            Self {
                client,
                unit_id: unit_id.into(),
                settings,
                mutations,
                cancel: Arc::new(Notify::new()),
                updates,
            },
            updates_rx,
        )
    }

    /// Stops the poller independently of any running session.
    pub fn cancel_handle(&self) -> Arc<Notify> {
        self.cancel.clone()
    }

    pub async fn run(mut self) {
        let mut interval = self.settings.floor;
        let mut last: Option<Vec<TrackedItem>> = None;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.mutations.notified() => {
                    debug!(unit = %self.unit_id, "tracker mutation signal; polling now");
                    interval = self.settings.floor;
                }
                _ = self.cancel.notified() => return,
            }
            interval = self.poll_once(&mut last, interval).await;
        }
    }

    async fn poll_once(
        &mut self,
        last: &mut Option<Vec<TrackedItem>>,
        interval: Duration,
    ) -> Duration {
        match self.client.list_items(&self.unit_id).await {
            Ok(items) => {
                if last.as_ref() == Some(&items) {
                    backoff(interval, self.settings)
                } else {
                    *last = Some(items.clone());
                    if self.updates.send(items).is_err() {
                        debug!(unit = %self.unit_id, "tracker update receiver dropped");
                    }
                    self.settings.floor
                }
            }
            Err(error) => {
                warn!(unit = %self.unit_id, %error, "tracker poll failed");
                backoff(interval, self.settings)
            }
        }
    }
}

fn backoff(interval: Duration, settings: PollSettings) -> Duration {
    (interval * 2).min(settings.ceiling).max(settings.floor)
}
