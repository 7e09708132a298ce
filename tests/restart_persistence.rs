//! Restart persistence tests
//!
//! The queue, cache entries and dead letters live in the on-disk store and
//! must come back after the app is closed and started again.

use offline::{ConnectivityEvent, OfflineConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use storage::SyncAction;
use tempfile::TempDir;
use tidybook::{bootstrap, BootstrapConfig};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Booking {
    id: u32,
    cleaner: String,
    hours: f32,
}

#[tokio::test]
async fn test_queue_and_cache_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = BootstrapConfig::new(temp_dir.path(), "http://127.0.0.1:9");

    let queued_ids = {
        let app = bootstrap(config.clone()).await.unwrap();
        let first = app
            .offline
            .add_to_sync_queue(SyncAction::Create, "/bookings", json!({"hours": 3}))
            .await;
        let second = app
            .offline
            .add_to_sync_queue(SyncAction::Update, "/bookings/4", json!({"hours": 2}))
            .await;
        app.offline
            .set_cached_data(
                "booking_4",
                &Booking { id: 4, cleaner: "Ana".to_string(), hours: 2.0 },
                "v2",
            )
            .await;
        app.close().await.unwrap();
        vec![first.id, second.id]
    };

    let app = bootstrap(config).await.unwrap();

    let restored: Vec<String> =
        app.offline.sync_queue().await.into_iter().map(|item| item.id).collect();
    assert_eq!(restored, queued_ids);

    let entry = app.offline.get_cached_entry::<Booking>("booking_4").await.unwrap();
    assert_eq!(entry.version, "v2");
    assert_eq!(entry.data.cleaner, "Ana");
    assert!(!app.offline.is_data_stale("booking_4", None).await);
}

#[tokio::test]
async fn test_retry_counts_and_dead_letters_survive_restart() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let config = BootstrapConfig::new(temp_dir.path(), mock_server.uri())
        .with_offline(OfflineConfig::new().max_retries(2));

    {
        let app = bootstrap(config.clone()).await.unwrap();
        app.offline.handle_connectivity(ConnectivityEvent::online()).await;
        app.offline.add_to_sync_queue(SyncAction::Create, "/a", json!({})).await;
        app.offline.sync_data().await;
        app.offline.add_to_sync_queue(SyncAction::Create, "/b", json!({})).await;
        app.offline.sync_data().await;
        app.close().await.unwrap();
    }

    let app = bootstrap(config).await.unwrap();

    let letters = app.offline.dead_letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].item.endpoint, "/a");

    let pending = app.offline.sync_queue().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].endpoint, "/b");
    assert_eq!(pending[0].retries, 1);
}
