//! # Fleet engine
//!
//! Owns the live state for one tenant scope. Push events from the change feed
//! are buffered and applied in one batch once the feed goes quiet; a periodic
//! resync re-reads the latest snapshots so a silent feed cannot leave the view
//! stale. Both paths go through the same ordering guard in the store.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use realtime::{ChangeEvent, Error, FeedFilter, Result, query};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::aggregate::{self, AggregateCounts, FleetEntry, FleetFilter, VehicleStatus};
use crate::config::Config;
use crate::debounce::Debouncer;
use crate::provider::{Provider, SnapshotQuery, TrailQuery};
use crate::snapshot::Snapshot;
use crate::status::{self, Status, Thresholds};
use crate::store::{ApplyOutcome, Hydration, LatestStateStore};
use crate::subscriber::Subscriber;
use crate::trail::{TrailPoint, Trails, distance_m};
use crate::vehicle::VehicleProfile;

/// The slice of the fleet a view is interested in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub table: String,
    /// Restricts the scope to these vehicles. `None` tracks the whole fleet.
    pub vehicle_ids: Option<Vec<String>>,
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self { tenant_id: tenant_id.into(), table: table.into(), vehicle_ids: None }
    }

    /// The whole fleet of a tenant, read from the configured snapshot table.
    pub fn fleet(tenant_id: impl Into<String>, config: &Config) -> Self {
        Self::new(tenant_id, config.snapshot_table.clone())
    }

    #[must_use]
    pub fn vehicles<I, S>(mut self, vehicle_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = vehicle_ids.into_iter().map(Into::into).collect();
        ids.sort();
        ids.dedup();
        self.vehicle_ids = Some(ids);
        self
    }

    /// Identity of the subscription serving this scope. Two views over the
    /// same tenant, table and vehicles share a key.
    #[must_use]
    pub fn key(&self) -> String {
        match &self.vehicle_ids {
            None => format!("{}:{}", self.tenant_id, self.table),
            Some(ids) => format!("{}:{}:{}", self.tenant_id, self.table, ids.join(",")),
        }
    }

    #[must_use]
    pub fn includes(&self, vehicle_id: &str) -> bool {
        self.vehicle_ids.as_ref().is_none_or(|ids| ids.iter().any(|id| id == vehicle_id))
    }

    /// Whether a raw row belongs to this scope. Rows without a tenant column
    /// are accepted; the feed filter has already narrowed them.
    fn admits(&self, row: &Value) -> bool {
        let column = |name: &str| match row.get(name) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        if column("tenant_id").is_some_and(|tenant_id| tenant_id != self.tenant_id) {
            return false;
        }
        column("vehicle_id").is_none_or(|vehicle_id| self.includes(&vehicle_id))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

struct FleetState {
    store: LatestStateStore,
    trails: Trails,
    roster: HashMap<String, VehicleProfile>,
    last_error: Option<Error>,
}

impl FleetState {
    /// Every known vehicle: the roster plus anything reporting telemetry
    /// without a profile.
    fn entries(&self) -> impl Iterator<Item = FleetEntry<'_>> {
        let rostered = self.roster.values().map(|profile| FleetEntry {
            vehicle_id: &profile.id,
            profile: Some(profile),
            snapshot: self.store.get(&profile.id),
        });
        let unrostered = self
            .store
            .all()
            .filter(|snapshot| !self.roster.contains_key(&snapshot.vehicle_id))
            .map(|snapshot| FleetEntry {
                vehicle_id: &snapshot.vehicle_id,
                profile: None,
                snapshot: Some(snapshot),
            });
        rostered.chain(unrostered)
    }

    /// Extends a watched vehicle's trail with its current position.
    fn extend_trail(&mut self, vehicle_id: &str) {
        if !self.trails.is_watched(vehicle_id) {
            return;
        }
        let Some(snapshot) = self.store.get(vehicle_id) else {
            return;
        };
        let Some((latitude, longitude)) = snapshot.position() else {
            return;
        };
        let point = TrailPoint {
            latitude,
            longitude,
            timestamp: snapshot.last_communication,
            speed: snapshot.speed,
        };

        let previous = self.trails.get(vehicle_id).and_then(|buffer| buffer.last().copied());
        let stored =
            self.trails.append(vehicle_id, point).is_some_and(|outcome| outcome.is_stored());
        if stored && let Some(previous) = previous {
            debug!(vehicle_id, distance_m = distance_m(&previous, &point), "trail extended");
        }
    }
}

struct Shared {
    scope: Scope,
    config: Config,
    thresholds: Thresholds,
    state: RwLock<FleetState>,
    pending: Mutex<Vec<ChangeEvent>>,
    active: AtomicBool,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, FleetState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FleetState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Buffers an event. Returns `true` once the buffer has reached its cap
    /// and should be flushed without waiting for the quiet period.
    fn enqueue(&self, event: ChangeEvent) -> bool {
        let mut pending = lock(&self.pending);
        pending.push(event);
        pending.len() >= self.config.max_pending_events.max(1)
    }

    fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Applies every buffered event under one write lock. Returns the number
    /// of events that changed the state.
    fn reconcile(&self) -> usize {
        if !self.is_active() {
            lock(&self.pending).clear();
            return 0;
        }
        let events = std::mem::take(&mut *lock(&self.pending));
        if events.is_empty() {
            return 0;
        }

        let mut changed = 0;
        let mut outdated = 0;
        {
            let mut state = self.write();
            for event in &events {
                if event.row().is_some_and(|row| !self.scope.admits(row)) {
                    continue;
                }
                match state.store.apply(event) {
                    Ok(outcome) if outcome.is_change() => {
                        changed += 1;
                        if let Some(vehicle_id) = event.column("vehicle_id") {
                            state.extend_trail(&vehicle_id);
                        }
                    }
                    Ok(ApplyOutcome::Outdated) => outdated += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            monotonic_counter.dropped_events = 1,
                            scope = %self.scope,
                            kind = %event.kind,
                            code = e.code(),
                            error = %e,
                            "dropping change event"
                        );
                    }
                }
            }
        }

        debug!(scope = %self.scope, events = events.len(), changed, outdated, "reconciled batch");
        if changed > 0 {
            self.bump();
        }
        changed
    }

    fn clear_error(&self, resolved: impl Fn(&Error) -> bool) {
        let mut state = self.write();
        if state.last_error.as_ref().is_some_and(resolved) {
            state.last_error = None;
        }
    }

    fn record_error(&self, error: Error) {
        warn!(scope = %self.scope, code = error.code(), error = %error, "keeping last known state");
        self.write().last_error = Some(error);
    }
}

/// Re-reads the roster and latest snapshots for the scope and applies them.
/// Used for initial hydration and every poll tick.
async fn resync<P: Provider>(provider: &P, shared: &Shared) -> Result<Hydration> {
    let scope = &shared.scope;
    let query = SnapshotQuery {
        tenant_id: scope.tenant_id.clone(),
        table: scope.table.clone(),
        vehicle_ids: scope.vehicle_ids.clone(),
        limit: shared.config.hydration_limit,
    };

    let fetched = async {
        let vehicles = provider.vehicles(&scope.tenant_id).await?;
        let rows = provider.latest_snapshots(&query).await?;
        anyhow::Ok((vehicles, rows))
    }
    .await;

    let (vehicles, rows) = match fetched {
        Ok(fetched) => fetched,
        Err(e) => {
            let error = query!("resyncing {}: {:#}", scope, e);
            if shared.is_active() {
                shared.record_error(error.clone());
            }
            return Err(error);
        }
    };

    // torn down while the query was in flight
    if !shared.is_active() {
        return Ok(Hydration::default());
    }

    let summary = {
        let mut state = shared.write();
        state.roster = vehicles
            .into_iter()
            .filter(|profile| scope.includes(&profile.id))
            .filter(|profile| profile.tenant_id.as_ref().is_none_or(|t| *t == scope.tenant_id))
            .map(|profile| (profile.id.clone(), profile))
            .collect();

        let summary = state.store.hydrate(rows.iter().filter(|row| scope.admits(row)));

        let watched: Vec<String> = state
            .store
            .ids()
            .filter(|id| state.trails.is_watched(id))
            .map(str::to_string)
            .collect();
        for vehicle_id in watched {
            state.extend_trail(&vehicle_id);
        }
        if matches!(state.last_error, Some(Error::Query(_))) {
            state.last_error = None;
        }
        summary
    };

    info!(
        scope = %scope,
        applied = summary.applied,
        outdated = summary.outdated,
        rejected = summary.rejected,
        "resynced fleet state"
    );
    shared.bump();
    Ok(summary)
}

/// Live state for one scope.
///
/// Must be started from within a tokio runtime. Dropping the engine stops it.
pub struct FleetEngine<P: Provider> {
    provider: P,
    shared: Arc<Shared>,
    debouncer: Arc<Debouncer>,
    subscriber: Subscriber<P>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Provider> FleetEngine<P> {
    pub fn new(provider: P, scope: Scope, config: Config) -> Self {
        let config = config.sanitized();
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            thresholds: config.thresholds(),
            state: RwLock::new(FleetState {
                store: LatestStateStore::new(config.apply_policy, config.delete_policy),
                trails: Trails::new(config.trail_capacity, config.trail_epsilon),
                roster: HashMap::new(),
                last_error: None,
            }),
            pending: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            revision,
            scope,
            config,
        });

        let weak = Arc::downgrade(&shared);
        let debouncer = Arc::new(Debouncer::new(shared.config.debounce_quiet, move || {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    shared.reconcile();
                }
            }
        }));

        Self {
            subscriber: Subscriber::new(provider.clone()),
            provider,
            shared,
            debouncer,
            poller: Mutex::new(None),
        }
    }

    /// Subscribes to the change feed, hydrates from the store and starts the
    /// periodic resync.
    ///
    /// Subscription happens before hydration so nothing committed in between
    /// is missed. Failures are recorded in [`Self::last_error`]; the engine
    /// keeps running and the next resync retries the read.
    pub async fn start(&self) {
        self.shared.active.store(true, Ordering::SeqCst);
        info!(scope = %self.shared.scope, "starting fleet engine");

        match self.subscribe().await {
            Ok(()) => self.shared.clear_error(|e| matches!(e, Error::Transport(_))),
            Err(e) => self.shared.record_error(e),
        }
        if self.abandoned() {
            return;
        }
        if let Err(e) = resync(&self.provider, &self.shared).await {
            debug!(scope = %self.shared.scope, error = %e, "initial hydration failed");
        }
        if self.abandoned() {
            return;
        }
        self.spawn_poller();
    }

    /// Closes a subscription opened by a `start` that `stop` overtook.
    fn abandoned(&self) -> bool {
        if self.shared.is_active() {
            return false;
        }
        self.subscriber.close_all();
        debug!(scope = %self.shared.scope, "stopped while starting");
        true
    }

    async fn subscribe(&self) -> Result<()> {
        let scope = &self.shared.scope;
        let filter = FeedFilter::new(&scope.tenant_id, &scope.table);
        let shared = Arc::downgrade(&self.shared);
        let debouncer = Arc::downgrade(&self.debouncer);

        self.subscriber
            .subscribe(&scope.key(), filter, move |event| {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if !shared.is_active() {
                    return;
                }
                if shared.enqueue(event) {
                    shared.reconcile();
                } else if let Some(debouncer) = debouncer.upgrade() {
                    debouncer.trigger();
                }
            })
            .await?;
        Ok(())
    }

    fn spawn_poller(&self) {
        let period = self.shared.config.poll_interval;
        let provider = self.provider.clone();
        let shared = Arc::downgrade(&self.shared);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if !shared.is_active() {
                    break;
                }
                if let Err(e) = resync(&provider, &shared).await {
                    debug!(scope = %shared.scope, error = %e, "poll failed");
                }
            }
        });

        if let Some(previous) = lock(&self.poller).replace(task) {
            previous.abort();
        }
    }

    /// Reads the latest snapshots now, outside the poll schedule.
    ///
    /// # Errors
    ///
    /// Returns a `Query` error when the store cannot be read. The previous
    /// state is kept.
    pub async fn refetch(&self) -> Result<Hydration> {
        resync(&self.provider, &self.shared).await
    }

    /// Applies buffered events immediately instead of waiting for the quiet
    /// period. Returns the number of events that changed the state.
    pub fn reconcile(&self) -> usize {
        self.debouncer.cancel();
        self.shared.reconcile()
    }

    /// Starts tracking a vehicle's trail, seeded from stored history.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a vehicle outside the scope and `Query` when
    /// the history cannot be read. In the latter case the vehicle stays
    /// watched and collects live points.
    pub async fn watch_trail(&self, vehicle_id: &str) -> Result<usize> {
        self.watch_trails(&[vehicle_id]).await
    }

    /// Starts tracking several trails with a single history query. Returns
    /// the number of vehicles that received history.
    ///
    /// # Errors
    ///
    /// As for [`Self::watch_trail`].
    pub async fn watch_trails(&self, vehicle_ids: &[&str]) -> Result<usize> {
        let scope = &self.shared.scope;
        if let Some(outside) = vehicle_ids.iter().find(|id| !scope.includes(id)) {
            return Err(Error::NotFound(format!("{outside} is not in scope {scope}")));
        }
        if vehicle_ids.is_empty() {
            return Ok(0);
        }

        {
            let mut state = self.shared.write();
            for vehicle_id in vehicle_ids {
                if state.trails.watch(vehicle_id) {
                    state.extend_trail(vehicle_id);
                }
            }
        }

        let query = TrailQuery {
            tenant_id: scope.tenant_id.clone(),
            vehicle_ids: vehicle_ids.iter().map(ToString::to_string).collect(),
            since: None,
            limit: self.shared.config.trail_history_limit,
        };
        let samples = match self.provider.trail_history(&query).await {
            Ok(samples) => samples,
            Err(e) => {
                let error = query!("loading trails for {}: {:#}", query.vehicle_ids.join(","), e);
                self.shared.record_error(error.clone());
                return Err(error);
            }
        };

        let hydrated = {
            let mut state = self.shared.write();
            let mut history: HashMap<&str, Vec<TrailPoint>> = HashMap::new();
            for sample in &samples {
                // unwatched while the query was in flight
                if state.trails.is_watched(&sample.vehicle_id) {
                    history.entry(sample.vehicle_id.as_str()).or_default().push(sample.point);
                }
            }
            for (vehicle_id, points) in &mut history {
                // keep live points that arrived during the query
                if let Some(buffer) = state.trails.get(vehicle_id) {
                    points.extend(buffer.iter().copied());
                }
                state.trails.hydrate(vehicle_id, std::mem::take(points));
            }
            history.len()
        };

        debug!(scope = %scope, vehicles = hydrated, points = samples.len(), "hydrated trails");
        self.shared.bump();
        Ok(hydrated)
    }

    /// Stops tracking a vehicle's trail and drops its buffer.
    pub fn unwatch_trail(&self, vehicle_id: &str) -> bool {
        let removed = self.shared.write().trails.unwatch(vehicle_id);
        if removed {
            self.shared.bump();
        }
        removed
    }

    /// Empties a vehicle's trail while continuing to track it.
    pub fn clear_trail(&self, vehicle_id: &str) {
        self.shared.write().trails.clear(vehicle_id);
        self.shared.bump();
    }

    /// Drops every trail buffer and stops tracking them.
    pub fn clear_trails(&self) {
        self.shared.write().trails.clear_all();
        self.shared.bump();
    }

    #[must_use]
    pub fn snapshot(&self, vehicle_id: &str) -> Option<Snapshot> {
        self.shared.read().store.get(vehicle_id).cloned()
    }

    /// Every held snapshot, ordered by vehicle id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self.shared.read().store.all().cloned().collect();
        snapshots.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        snapshots
    }

    /// Status of one vehicle at `now`. Vehicles with no snapshot are offline.
    #[must_use]
    pub fn classify(&self, vehicle_id: &str, now: DateTime<Utc>) -> Status {
        let state = self.shared.read();
        status::classify(state.store.get(vehicle_id), now, &self.shared.thresholds)
    }

    /// The vehicle's trail, oldest point first. Empty when not watched.
    #[must_use]
    pub fn trail(&self, vehicle_id: &str) -> Vec<TrailPoint> {
        self.shared.read().trails.get(vehicle_id).map(|buffer| buffer.to_vec()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_watching(&self, vehicle_id: &str) -> bool {
        self.shared.read().trails.is_watched(vehicle_id)
    }

    #[must_use]
    pub fn aggregate(&self, filter: &FleetFilter, now: DateTime<Utc>) -> AggregateCounts {
        let state = self.shared.read();
        aggregate::aggregate(state.entries(), filter, now, &self.shared.thresholds)
    }

    /// The vehicles matching `filter`, ordered by id.
    #[must_use]
    pub fn vehicles(&self, filter: &FleetFilter, now: DateTime<Utc>) -> Vec<VehicleStatus> {
        let state = self.shared.read();
        aggregate::matching(state.entries(), filter, now, &self.shared.thresholds)
    }

    /// The most recent resync or history failure, cleared by the next
    /// successful resync.
    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        self.shared.read().last_error.clone()
    }

    /// Incremented whenever the observable state changes.
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.shared.revision.borrow()
    }

    /// Notifies on every revision change.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.shared.pending_len()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Whether the change feed subscription is still delivering.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscriber.is_subscribed(&self.shared.scope.key())
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.shared.scope
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Tears the engine down: closes the subscription, cancels the pending
    /// flush and the poller, and discards buffered events and trails. No
    /// callback fires after this returns. Idempotent.
    pub fn stop(&self) {
        let was_active = self.shared.active.swap(false, Ordering::SeqCst);

        self.subscriber.close_all();
        self.debouncer.cancel();
        if let Some(poller) = lock(&self.poller).take() {
            poller.abort();
        }
        lock(&self.shared.pending).clear();
        self.shared.write().trails.clear_all();

        if was_active {
            info!(scope = %self.shared.scope, "fleet engine stopped");
        }
    }
}

impl<P: Provider> Drop for FleetEngine<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<P: Provider> fmt::Debug for FleetEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetEngine")
            .field("scope", &self.shared.scope)
            .field("active", &self.shared.is_active())
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn scope_key() {
        let scope = Scope::new("acme", "vehicle_telemetry");
        assert_eq!(scope.key(), "acme:vehicle_telemetry");

        let scope = scope.vehicles(["v2", "v1", "v2"]);
        assert_eq!(scope.key(), "acme:vehicle_telemetry:v1,v2");
        assert_eq!(scope.to_string(), scope.key());
    }

    #[test]
    fn fleet_scope_uses_configured_table() {
        let config = Config { snapshot_table: "vessel_positions".to_string(), ..Config::default() };
        let scope = Scope::fleet("acme", &config);
        assert_eq!(scope, Scope::new("acme", "vessel_positions"));
    }

    #[test]
    fn scope_admits_rows() {
        let scope = Scope::new("acme", "vehicle_telemetry").vehicles(["v1"]);

        assert!(scope.admits(&json!({"vehicle_id": "v1", "tenant_id": "acme"})));
        assert!(scope.admits(&json!({"vehicle_id": "v1"})));
        assert!(!scope.admits(&json!({"vehicle_id": "v2", "tenant_id": "acme"})));
        assert!(!scope.admits(&json!({"vehicle_id": "v1", "tenant_id": "globex"})));

        let fleet = Scope::new("acme", "vehicle_telemetry");
        assert!(fleet.admits(&json!({"vehicle_id": 42, "tenant_id": "acme"})));
        assert!(fleet.includes("anything"));
    }
}
