#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use fleet_state::{FleetQuery, SnapshotQuery, TrailQuery, TrailSample, VehicleProfile};
use futures::channel::mpsc::{self, UnboundedSender};
use realtime::{ChangeEvent, ChangeFeed, ChangeStream, Config, FeedFilter};
use serde_json::Value;

#[derive(Default)]
struct State {
    rows: Vec<Value>,
    vehicles: Vec<VehicleProfile>,
    history: Vec<TrailSample>,
    settings: HashMap<String, String>,
    feeds: Vec<UnboundedSender<Result<ChangeEvent>>>,
    filters: Vec<FeedFilter>,
    snapshot_queries: usize,
    fail_queries: bool,
    fail_subscribe: bool,
    subscribe_delay: Duration,
}

/// In-memory provider. Change events pushed through [`MockProvider::push`]
/// are delivered to every open subscription.
#[derive(Default, Clone)]
pub struct MockProvider {
    state: Arc<Mutex<State>>,
}

#[allow(dead_code, clippy::missing_panics_doc)]
impl MockProvider {
    #[must_use]
    pub fn new(rows: Vec<Value>, vehicles: Vec<VehicleProfile>) -> Self {
        let provider = Self::default();
        provider.set_rows(rows);
        provider.set_vehicles(vehicles);
        provider
    }

    pub fn set_rows(&self, rows: Vec<Value>) {
        self.state.lock().expect("lock").rows = rows;
    }

    pub fn set_vehicles(&self, vehicles: Vec<VehicleProfile>) {
        self.state.lock().expect("lock").vehicles = vehicles;
    }

    pub fn set_history(&self, history: Vec<TrailSample>) {
        self.state.lock().expect("lock").history = history;
    }

    pub fn set(&self, key: &str, value: &str) {
        self.state.lock().expect("lock").settings.insert(key.to_string(), value.to_string());
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().expect("lock").fail_queries = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state.lock().expect("lock").fail_subscribe = fail;
    }

    /// Makes every subscribe call take `delay` before the feed opens.
    pub fn delay_subscribe(&self, delay: Duration) {
        self.state.lock().expect("lock").subscribe_delay = delay;
    }

    /// Delivers an event to every open subscription.
    pub fn push(&self, event: ChangeEvent) {
        let mut state = self.state.lock().expect("lock");
        state.feeds.retain(|feed| !feed.is_closed());
        for feed in &state.feeds {
            feed.unbounded_send(Ok(event.clone())).expect("send");
        }
    }

    /// Delivers a transport error to every open subscription.
    pub fn push_error(&self, message: &str) {
        let state = self.state.lock().expect("lock");
        for feed in state.feeds.iter().filter(|feed| !feed.is_closed()) {
            feed.unbounded_send(Err(anyhow::anyhow!(message.to_string()))).expect("send");
        }
    }

    /// Ends every open subscription's stream.
    pub fn close_feeds(&self) {
        let mut state = self.state.lock().expect("lock");
        for feed in state.feeds.drain(..) {
            feed.close_channel();
        }
    }

    /// Subscriptions whose receiving side is still alive.
    #[must_use]
    pub fn open_feeds(&self) -> usize {
        self.state.lock().expect("lock").feeds.iter().filter(|feed| !feed.is_closed()).count()
    }

    /// Every filter ever subscribed with.
    #[must_use]
    pub fn filters(&self) -> Vec<FeedFilter> {
        self.state.lock().expect("lock").filters.clone()
    }

    #[must_use]
    pub fn snapshot_queries(&self) -> usize {
        self.state.lock().expect("lock").snapshot_queries
    }
}

impl ChangeFeed for MockProvider {
    async fn subscribe(&self, filter: &FeedFilter) -> Result<ChangeStream> {
        let delay = self.state.lock().expect("lock").subscribe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().expect("lock");
        if state.fail_subscribe {
            bail!("connection refused");
        }
        let (tx, rx) = mpsc::unbounded();
        state.feeds.push(tx);
        state.filters.push(filter.clone());
        Ok(Box::pin(rx))
    }
}

impl FleetQuery for MockProvider {
    async fn latest_snapshots(&self, query: &SnapshotQuery) -> Result<Vec<Value>> {
        let mut state = self.state.lock().expect("lock");
        state.snapshot_queries += 1;
        if state.fail_queries {
            bail!("statement timeout");
        }
        Ok(state.rows.iter().take(query.limit).cloned().collect())
    }

    async fn trail_history(&self, query: &TrailQuery) -> Result<Vec<TrailSample>> {
        let state = self.state.lock().expect("lock");
        if state.fail_queries {
            bail!("statement timeout");
        }
        Ok(state
            .history
            .iter()
            .filter(|sample| query.vehicle_ids.contains(&sample.vehicle_id))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn vehicles(&self, tenant_id: &str) -> Result<Vec<VehicleProfile>> {
        let state = self.state.lock().expect("lock");
        if state.fail_queries {
            bail!("statement timeout");
        }
        Ok(state
            .vehicles
            .iter()
            .filter(|vehicle| vehicle.tenant_id.as_deref().is_none_or(|t| t == tenant_id))
            .cloned()
            .collect())
    }
}

impl Config for MockProvider {
    async fn get(&self, key: &str) -> Result<String> {
        let state = self.state.lock().expect("lock");
        let Some(value) = state.settings.get(key) else {
            bail!("{key} is not set");
        };
        Ok(value.clone())
    }
}
