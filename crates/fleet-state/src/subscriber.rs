//! Change feed subscriber.
//!
//! Holds at most one live subscription per scope key. Each subscription is a
//! task draining the provider's stream into a handler; closing it aborts the
//! task, which drops the stream and with it the transport subscription.

use std::fmt;

use dashmap::DashMap;
use futures::StreamExt;
use realtime::{ChangeEvent, ChangeFeed, ChangeStream, Error, FeedFilter, Result, transport};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Subscription {
    id: Uuid,
    filter: FeedFilter,
    task: JoinHandle<()>,
}

impl Subscription {
    fn close(self) {
        self.task.abort();
        debug!(subscription = %self.id, channel = %self.filter.channel(), "subscription closed");
    }
}

pub struct Subscriber<F: ChangeFeed> {
    feed: F,
    subscriptions: DashMap<String, Subscription>,
}

impl<F: ChangeFeed> Subscriber<F> {
    pub fn new(feed: F) -> Self {
        Self { feed, subscriptions: DashMap::new() }
    }

    /// Opens a subscription under `key`, first closing any existing one for
    /// the same key. `handler` is invoked once per delivered event.
    ///
    /// # Errors
    ///
    /// Returns a `Transport` error when the feed cannot be established. The
    /// prior subscription for `key` is closed regardless.
    pub async fn subscribe<H>(&self, key: &str, filter: FeedFilter, handler: H) -> Result<Uuid>
    where
        H: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.unsubscribe(key);

        let stream = self
            .feed
            .subscribe(&filter)
            .await
            .map_err(|e| transport!("subscribing to {}: {:#}", filter.channel(), e))?;

        let id = Uuid::new_v4();
        info!(subscription = %id, key, channel = %filter.channel(), "subscribed to change feed");

        let task = tokio::spawn(consume(id, filter.clone(), stream, handler));
        if let Some(previous) =
            self.subscriptions.insert(key.to_string(), Subscription { id, filter, task })
        {
            // a concurrent subscribe for the same key won the race
            previous.close();
        }
        Ok(id)
    }

    /// Closes the subscription for `key`. Returns whether one existed.
    pub fn unsubscribe(&self, key: &str) -> bool {
        self.subscriptions.remove(key).map(|(_, subscription)| subscription.close()).is_some()
    }

    pub fn close_all(&self) {
        let keys: Vec<String> =
            self.subscriptions.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.unsubscribe(&key);
        }
    }

    /// Whether `key` has a subscription whose stream is still being drained.
    #[must_use]
    pub fn is_subscribed(&self, key: &str) -> bool {
        self.subscriptions.get(key).is_some_and(|subscription| !subscription.task.is_finished())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

impl<F: ChangeFeed> Drop for Subscriber<F> {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl<F: ChangeFeed> fmt::Debug for Subscriber<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("subscriptions", &self.subscriptions.len()).finish()
    }
}

async fn consume<H>(id: Uuid, filter: FeedFilter, mut stream: ChangeStream, handler: H)
where
    H: Fn(ChangeEvent) + Send + Sync + 'static,
{
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    monotonic_counter.feed_errors = 1,
                    subscription = %id,
                    error = %e,
                    "change feed delivery failed"
                );
                continue;
            }
        };

        if !filter.kinds.contains(event.kind) {
            continue;
        }
        if !event.table.is_empty() && event.table != filter.table {
            debug!(subscription = %id, table = %event.table, "ignoring event for other table");
            continue;
        }
        if let Some(tenant_id) = event.column("tenant_id")
            && tenant_id != filter.tenant_id
        {
            let error = Error::CrossTenant(format!(
                "{} event for tenant {} on a {} subscription",
                event.kind, tenant_id, filter.tenant_id
            ));
            warn!(
                monotonic_counter.cross_tenant_events = 1,
                subscription = %id,
                code = error.code(),
                error = %error,
                "dropping event for another tenant"
            );
            continue;
        }

        handler(event);
    }

    // the periodic resync covers whatever this subscription misses from here
    warn!(subscription = %id, channel = %filter.channel(), "change feed ended");
}
