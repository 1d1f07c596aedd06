//! # Console
//!
//! Screens mount a scope and get the engine serving it. Screens mounting the
//! same scope share one engine, so a burst of telemetry is reconciled once
//! however many screens are open. An engine is stopped when the last screen
//! using it unmounts or moves to a different scope.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use fleet_state::{Config, FleetEngine, Provider, Scope};
use tracing::info;

pub struct Console<P: Provider> {
    provider: P,
    config: Config,
    /// Engines by scope key.
    engines: DashMap<String, Arc<FleetEngine<P>>>,
    /// Scope key by screen.
    screens: DashMap<String, String>,
}

impl<P: Provider> Console<P> {
    pub fn new(provider: P, config: Config) -> Self {
        Self { provider, config, engines: DashMap::new(), screens: DashMap::new() }
    }

    /// Mounts `screen` on `scope` and returns the engine serving it.
    ///
    /// A screen remounted with an unchanged scope keeps its engine. A scope
    /// change releases the previous engine and subscribes afresh.
    pub async fn mount(&self, screen: &str, scope: Scope) -> Arc<FleetEngine<P>> {
        let key = scope.key();

        let current = self.screens.get(screen).map(|entry| entry.value().clone());
        if let Some(current) = current {
            if current == key
                && let Some(engine) = self.active_engine(&key)
            {
                return engine;
            }
            self.release(screen);
        }
        self.screens.insert(screen.to_string(), key.clone());

        if let Some(engine) = self.active_engine(&key) {
            info!(screen, scope = %key, "sharing fleet engine");
            return engine;
        }

        let engine = Arc::new(FleetEngine::new(self.provider.clone(), scope, self.config.clone()));
        if let Some(stale) = self.engines.insert(key.clone(), Arc::clone(&engine)) {
            stale.stop();
        }
        info!(screen, scope = %key, "mounting fleet engine");
        engine.start().await;
        engine
    }

    /// Mounts `screen` on the whole fleet of `tenant_id`, using the
    /// configured snapshot table.
    pub async fn mount_fleet(&self, screen: &str, tenant_id: &str) -> Arc<FleetEngine<P>> {
        self.mount(screen, Scope::fleet(tenant_id, &self.config)).await
    }

    /// Unmounts `screen`. Returns whether it was mounted.
    pub fn unmount(&self, screen: &str) -> bool {
        let mounted = self.screens.contains_key(screen);
        if mounted {
            self.release(screen);
        }
        mounted
    }

    /// The engine serving `screen`.
    #[must_use]
    pub fn engine(&self, screen: &str) -> Option<Arc<FleetEngine<P>>> {
        let key = self.screens.get(screen)?.value().clone();
        self.engines.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Mounted screens, sorted.
    #[must_use]
    pub fn mounted(&self) -> Vec<String> {
        let mut screens: Vec<String> =
            self.screens.iter().map(|entry| entry.key().clone()).collect();
        screens.sort();
        screens
    }

    /// Number of live engines.
    #[must_use]
    pub fn engines(&self) -> usize {
        self.engines.len()
    }

    /// Stops every engine and forgets every screen.
    pub fn shutdown(&self) {
        self.screens.clear();
        let keys: Vec<String> = self.engines.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, engine)) = self.engines.remove(&key) {
                engine.stop();
            }
        }
    }

    fn active_engine(&self, key: &str) -> Option<Arc<FleetEngine<P>>> {
        self.engines
            .get(key)
            .filter(|entry| entry.value().is_active())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Detaches `screen` and stops its engine if no other screen uses it.
    fn release(&self, screen: &str) {
        let Some((_, key)) = self.screens.remove(screen) else {
            return;
        };
        if self.screens.iter().any(|entry| *entry.value() == key) {
            return;
        }
        if let Some((_, engine)) = self.engines.remove(&key) {
            info!(screen, scope = %key, "releasing fleet engine");
            engine.stop();
        }
    }
}

impl<P: Provider> Drop for Console<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P: Provider> fmt::Debug for Console<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("screens", &self.screens.len())
            .field("engines", &self.engines.len())
            .finish_non_exhaustive()
    }
}
