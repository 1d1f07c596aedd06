
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use fleet_live::{AggregateCounts, ChangeEvent, Config, Console, FleetFilter, Scope};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use self::provider::MockProvider;

const TABLE: &str = "vehicle_telemetry";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn row(tenant_id: &str, vehicle_id: &str, secs: i64, speed: f64) -> Value {
    json!({
        "vehicle_id": vehicle_id,
        "tenant_id": tenant_id,
        "latitude": -36.8,
        "longitude": 174.7,
        "speed": speed,
        "engine_on": true,
        "is_connected": true,
        "last_communication": at(secs).to_rfc3339(),
    })
}

fn console() -> (Console<MockProvider>, MockProvider) {
    let provider = MockProvider::new(vec![
        row("acme", "v1", 0, 20.0),
        row("acme", "v2", 0, 0.0),
        row("globex", "g1", 0, 5.0),
    ]);
    (Console::new(provider.clone(), Config::default()), provider)
}

async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn screens_share_engine_for_same_scope() {
    let (console, provider) = console();

    let dashboard = console.mount("dashboard", Scope::new("acme", TABLE)).await;
    let map = console.mount("map", Scope::new("acme", TABLE)).await;

    assert!(Arc::ptr_eq(&dashboard, &map));
    assert_eq!(console.engines(), 1);
    assert_eq!(provider.subscriptions(), 1);
    assert_eq!(console.mounted(), vec!["dashboard".to_string(), "map".to_string()]);

    let counts = map.aggregate(&FleetFilter::default(), at(60));
    assert_eq!(counts, AggregateCounts { total: 2, moving: 1, idle: 1, offline: 0 });
}

#[tokio::test(start_paused = true)]
async fn remount_with_same_scope_keeps_engine() {
    let (console, provider) = console();

    let first = console.mount("dashboard", Scope::new("acme", TABLE)).await;
    let again = console.mount("dashboard", Scope::new("acme", TABLE)).await;

    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(provider.subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn scope_change_resubscribes() {
    let (console, provider) = console();

    let acme = console.mount("dashboard", Scope::new("acme", TABLE)).await;
    let globex = console.mount("dashboard", Scope::new("globex", TABLE)).await;
    settle(Duration::from_millis(10)).await;

    assert!(!acme.is_active());
    assert!(globex.is_active());
    assert_eq!(console.engines(), 1);
    assert_eq!(provider.subscriptions(), 2);
    assert_eq!(provider.open_feeds(), 1);

    let ids: Vec<String> = globex.snapshots().into_iter().map(|s| s.vehicle_id).collect();
    assert_eq!(ids, vec!["g1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn shared_engine_survives_partial_unmount() {
    let (console, provider) = console();

    let engine = console.mount("dashboard", Scope::new("acme", TABLE)).await;
    console.mount("reports", Scope::new("acme", TABLE)).await;

    assert!(console.unmount("dashboard"));
    assert!(!console.unmount("dashboard"));
    assert!(engine.is_active());

    provider.push("acme", ChangeEvent::update(TABLE, row("acme", "v2", 30, 45.0)));
    settle(Duration::from_secs(1)).await;
    let speed = console.engine("reports").and_then(|e| e.snapshot("v2")).and_then(|s| s.speed);
    assert_eq!(speed, Some(45.0));

    assert!(console.unmount("reports"));
    settle(Duration::from_millis(10)).await;
    assert!(!engine.is_active());
    assert_eq!(console.engines(), 0);
    assert_eq!(provider.open_feeds(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_everything() {
    let (console, provider) = console();

    let acme = console.mount("dashboard", Scope::new("acme", TABLE)).await;
    let globex = console.mount("drivers", Scope::new("globex", TABLE)).await;
    assert_eq!(console.engines(), 2);

    console.shutdown();
    settle(Duration::from_millis(10)).await;

    assert!(!acme.is_active());
    assert!(!globex.is_active());
    assert!(console.mounted().is_empty());
    assert!(console.engine("dashboard").is_none());
    assert_eq!(provider.open_feeds(), 0);
}

#[tokio::test(start_paused = true)]
async fn vehicle_scopes_get_separate_engines() {
    let (console, provider) = console();

    let fleet = console.mount("dashboard", Scope::new("acme", TABLE)).await;
    let single = console.mount("vehicle", Scope::new("acme", TABLE).vehicles(["v1"])).await;

    assert!(!Arc::ptr_eq(&fleet, &single));
    assert_eq!(provider.subscriptions(), 2);
    assert_eq!(single.snapshots().len(), 1);
    assert_eq!(fleet.snapshots().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn fleet_mount_reads_configured_table() {
    let provider = MockProvider::new(vec![row("acme", "boat-1", 0, 8.0)]);
    let config = Config { snapshot_table: "vessel_positions".to_string(), ..Config::default() };
    let console = Console::new(provider.clone(), config);

    let map = console.mount_fleet("map", "acme").await;
    let dashboard = console.mount("dashboard", Scope::new("acme", "vessel_positions")).await;

    assert_eq!(map.scope().table, "vessel_positions");
    assert!(Arc::ptr_eq(&map, &dashboard));
    assert_eq!(provider.subscriptions(), 1);

    provider.push("acme", ChangeEvent::update("vessel_positions", row("acme", "boat-1", 30, 12.0)));
    settle(Duration::from_secs(1)).await;
    assert_eq!(map.snapshot("boat-1").and_then(|s| s.speed), Some(12.0));
}
