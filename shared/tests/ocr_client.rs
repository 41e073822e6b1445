use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared::model::{ChapterKey, ChapterStatus, Credentials, OcrLanguage};
use shared::ocr_client::{ChapterOcrApi, OcrClient};
use shared::settings::Settings;

fn settings_for(server: &MockServer) -> Settings {
    Settings {
        ocr_server_url: server.uri().parse().unwrap(),
        library_server_url: "http://suwayomi.local:4567".parse().unwrap(),
        credentials: None,
        ocr_language: OcrLanguage::Japanese,
    }
}

fn chapter() -> ChapterKey {
    ChapterKey::from_parts("42".into(), 7)
}

#[tokio::test]
async fn chapter_status_builds_the_base_url_from_the_canonical_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/is-chapter-preprocessed"))
        .and(query_param(
            "base_url",
            "http://suwayomi.local:4567/manga/42/chapter/7",
        ))
        .and(query_param("language", "ja"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "idle",
            "cached": 2,
            "total": 10
        })))
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    let status = client
        .chapter_status(&chapter(), OcrLanguage::Japanese)
        .await
        .unwrap();

    assert_eq!(ChapterStatus::Idle { cached: 2, total: 10 }, status);
}

#[tokio::test]
async fn chapter_status_accepts_the_servers_legacy_count_field_names() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/is-chapter-preprocessed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "idle",
            "cached_count": 4,
            "total_expected": 20
        })))
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    let status = client
        .chapter_status(&chapter(), OcrLanguage::Japanese)
        .await
        .unwrap();

    assert_eq!(ChapterStatus::Idle { cached: 4, total: 20 }, status);
}

#[tokio::test]
async fn chapter_status_parses_processing_and_processed_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/is-chapter-preprocessed"))
        .and(query_param("base_url", "http://suwayomi.local:4567/manga/42/chapter/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "processing",
            "progress": 3,
            "total": 10
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/is-chapter-preprocessed"))
        .and(query_param("base_url", "http://suwayomi.local:4567/manga/42/chapter/8"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "processed",
            "cached_count": 10,
            "total_expected": 10
        })))
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));

    assert_eq!(
        ChapterStatus::Processing { progress: 3, total: 10 },
        client
            .chapter_status(&chapter(), OcrLanguage::Japanese)
            .await
            .unwrap()
    );
    assert_eq!(
        ChapterStatus::Processed,
        client
            .chapter_status(&ChapterKey::from_parts("42".into(), 8), OcrLanguage::Japanese)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn chapter_status_forwards_credentials_as_query_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/is-chapter-preprocessed"))
        .and(query_param("user", "reader"))
        .and(query_param("pass", "hunter2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "processed"
        })))
        .mount(&server)
        .await;

    let mut settings = settings_for(&server);
    settings.credentials = Some(Credentials {
        user: "reader".into(),
        pass: Some("hunter2".into()),
    });

    let client = OcrClient::new(&settings);
    let status = client
        .chapter_status(&chapter(), OcrLanguage::Japanese)
        .await
        .unwrap();

    assert_eq!(ChapterStatus::Processed, status);
}

#[tokio::test]
async fn chapter_status_fails_with_a_network_error_on_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/is-chapter-preprocessed"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    let result = client.chapter_status(&chapter(), OcrLanguage::Japanese).await;

    assert!(matches!(
        result,
        Err(shared::ocr_client::Error::NetworkError(_))
    ));
}

#[tokio::test]
async fn enqueue_sends_the_chapter_location_and_language() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/preprocess-chapter"))
        .and(body_partial_json(json!({
            "base_url": "http://suwayomi.local:4567/manga/42/chapter/7",
            "chapter_path": "/manga/42/chapter/7",
            "language": "ko"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "started"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    client
        .enqueue_chapter(&chapter(), OcrLanguage::Korean)
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_sends_the_purge_flag() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/delete-chapter"))
        .and(body_partial_json(json!({
            "base_url": "http://suwayomi.local:4567/manga/42/chapter/7",
            "delete_data": true,
            "language": "ja"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "deleted"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    client
        .delete_chapter(&chapter(), true, OcrLanguage::Japanese)
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_failure_surfaces_as_a_network_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/delete-chapter"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    let result = client
        .delete_chapter(&chapter(), false, OcrLanguage::Japanese)
        .await;

    assert!(matches!(
        result,
        Err(shared::ocr_client::Error::NetworkError(_))
    ));
}

#[tokio::test]
async fn batch_status_maps_responses_back_to_their_chapters() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/is-chapters-preprocessed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "http://suwayomi.local:4567/manga/42/chapter/7": {
                "status": "processed"
            },
            "http://suwayomi.local:4567/manga/42/chapter/8": {
                "status": "idle",
                "cached_count": 1,
                "total_expected": 12
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    let first = chapter();
    let second = ChapterKey::from_parts("42".into(), 8);

    let statuses = client
        .chapter_status_batch(&[first.clone(), second.clone()], OcrLanguage::Japanese)
        .await
        .unwrap();

    assert_eq!(2, statuses.len());
    assert_eq!(Some(&ChapterStatus::Processed), statuses.get(&first));
    assert_eq!(
        Some(&ChapterStatus::Idle { cached: 1, total: 12 }),
        statuses.get(&second)
    );
}

#[tokio::test]
async fn batch_status_skips_the_request_when_there_are_no_chapters() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/is-chapters-preprocessed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    let statuses = client
        .chapter_status_batch(&[], OcrLanguage::Japanese)
        .await
        .unwrap();

    assert!(statuses.is_empty());
}

#[tokio::test]
async fn server_status_reports_the_servers_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "running",
            "backend": "manatan-ocr-server",
            "requests_processed": 128,
            "items_in_cache": 42,
            "active_jobs": 1
        })))
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    let status = client.server_status().await.unwrap();

    assert_eq!("running", status.status);
    assert_eq!(128, status.requests_processed);
    assert_eq!(1, status.active_jobs);
}

#[tokio::test]
async fn purge_cache_posts_to_the_purge_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/purge-cache"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "cleared"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OcrClient::new(&settings_for(&server));
    client.purge_cache().await.unwrap();
}

// The tracker is exercised end to end against a real HTTP round-trip here;
// its timing behavior is covered by the unit tests with virtual time.
#[tokio::test]
async fn tracker_refresh_round_trips_through_the_http_client() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/is-chapter-preprocessed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "processing",
            "progress": 6,
            "total": 9
        })))
        .mount(&server)
        .await;

    let client = Arc::new(OcrClient::new(&settings_for(&server)));
    let tracker =
        shared::status_tracker::OcrStatusTracker::new(client, OcrLanguage::Japanese);
    let key = chapter();

    let status = tracker.refresh(&key).await.unwrap();

    assert_eq!(ChapterStatus::Processing { progress: 6, total: 9 }, status);
    assert_eq!(Some(status), tracker.status(&key));
}
