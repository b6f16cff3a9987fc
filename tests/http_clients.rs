use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use httptest::matchers::{all_of, request};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use rand::rngs::StdRng;
use rand::SeedableRng;
use secrecy::SecretString;
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use hub_harvest::cache::{make_request_cache_key, CachePolicy};
use hub_harvest::config::HttpSettings;
use hub_harvest::http::HttpClient;
use hub_harvest::places::{build_text_search_body, PlacesClient, PLACES_FIELD_MASK};
use hub_harvest::profile::TravelPolicy;
use hub_harvest::routes::{TravelClient, TravelTarget};
use hub_harvest::{AppError, Cache, Coordinates, HarvestPoint, RequestBudget, RequestKind};

fn http_client(retry_max: u32) -> HttpClient {
    HttpClient::with_rng(
        SecretString::from("test-key".to_string()),
        HttpSettings {
            timeout: Duration::from_secs(5),
            retry_max,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        },
        StdRng::seed_from_u64(42),
    )
    .unwrap()
}

fn places_client(url: String, cache: Arc<Cache>, budget: Arc<RequestBudget>) -> PlacesClient {
    PlacesClient::new(
        http_client(3),
        cache,
        budget,
        url,
        15_000,
        CachePolicy::default(),
    )
}

fn search_payload() -> Value {
    json!({
        "places": [{
            "id": "clinic-1",
            "displayName": {"text": "Smile Studio"},
            "rating": 4.7,
            "userRatingCount": 321,
            "location": {"latitude": 52.23, "longitude": 21.01},
            "types": ["dentist", "health"],
            "businessStatus": "OPERATIONAL"
        }]
    })
}

fn hub() -> HarvestPoint {
    HarvestPoint::new("hub_a", 52.2297, 21.0122)
}

#[tokio::test]
async fn identical_searches_hit_the_network_once() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(request::method("POST"), request::path("/search")))
            .times(1)
            .respond_with(json_encoded(search_payload())),
    );

    let budget = Arc::new(RequestBudget::new(10, 10));
    let client = places_client(
        server.url("/search").to_string(),
        Arc::new(Cache::in_memory().unwrap()),
        Arc::clone(&budget),
    );

    let first = client
        .search_all("orthodontist", &hub(), None, 3, None)
        .await
        .unwrap();
    let second = client
        .search_all("orthodontist", &hub(), None, 3, None)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first[0].name.as_deref(), Some("Smile Studio"));
    assert_eq!(first[0].user_rating_count, Some(321));
    let metrics = budget.metrics().snapshot();
    assert_eq!(metrics.search_requests, 1);
    assert_eq!(metrics.search_dedup_skips, 1);
    assert_eq!(metrics.search_cache_hits, 0);
}

#[tokio::test]
async fn cached_responses_survive_a_new_client() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(request::method("POST"), request::path("/search")))
            .times(1)
            .respond_with(json_encoded(search_payload())),
    );
    let dir = tempdir().unwrap();
    let path = dir.path().join("harvest.db");
    let url = server.url("/search").to_string();

    let first = {
        let cache = Arc::new(Cache::open(&path, 10).unwrap());
        let client = places_client(url.clone(), Arc::clone(&cache), Arc::new(RequestBudget::new(5, 5)));
        let response = client
            .search_text("orthodontist", &hub(), Some("dentist"), None, None)
            .await
            .unwrap();
        cache.flush().unwrap();
        response
    };

    let budget = Arc::new(RequestBudget::new(5, 5));
    let client = places_client(
        url,
        Arc::new(Cache::open(&path, 10).unwrap()),
        Arc::clone(&budget),
    );
    let second = client
        .search_text("orthodontist", &hub(), Some("dentist"), None, None)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(budget.used(RequestKind::Search), 0);
    assert_eq!(budget.metrics().snapshot().search_cache_hits, 1);
}

#[tokio::test]
async fn refresh_bypasses_cached_responses() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(request::method("POST"), request::path("/search")))
            .times(1)
            .respond_with(json_encoded(search_payload())),
    );
    let url = server.url("/search").to_string();
    let body = build_text_search_body("orthodontist", &hub(), None, None, 15_000);
    let key = make_request_cache_key(&url, PLACES_FIELD_MASK, &body);
    let cache = Arc::new(Cache::in_memory().unwrap());
    cache.set_search_response(&key, &json!({"places": []})).unwrap();
    let budget = Arc::new(RequestBudget::new(5, 5));
    let client = PlacesClient::new(
        http_client(1),
        Arc::clone(&cache),
        Arc::clone(&budget),
        url,
        15_000,
        CachePolicy {
            no_cache: false,
            refresh: true,
        },
    );

    let places = client
        .search_all("orthodontist", &hub(), None, 1, None)
        .await
        .unwrap();
    assert_eq!(places.len(), 1);
    assert_eq!(budget.used(RequestKind::Search), 1);
    let stored = cache.get_search_response(&key).unwrap().unwrap();
    assert_eq!(stored["places"][0]["id"], "clinic-1");
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(request::method("POST"), request::path("/search")))
            .times(1)
            .respond_with(status_code(400)),
    );
    let client = http_client(4);
    let err = client
        .post_json(&server.url("/search").to_string(), &json!({}), "places.id", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::HttpStatus { status: 400, .. }));
}

#[tokio::test]
async fn unparseable_success_bodies_fail_immediately() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(request::method("POST"), request::path("/search")))
            .times(1)
            .respond_with(status_code(200).body("<html>not json</html>")),
    );
    let client = http_client(4);
    let err = client
        .post_json(&server.url("/search").to_string(), &json!({}), "places.id", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MalformedResponse { .. }));
}

#[tokio::test]
async fn travel_lookups_share_a_departure_bucket() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(request::method("POST"), request::path("/routes")))
            .times(1)
            .respond_with(json_encoded(json!({"routes": [{"duration": "754s"}]}))),
    );
    let cache = Arc::new(Cache::in_memory().unwrap());
    let budget = Arc::new(RequestBudget::new(5, 5));
    let client = TravelClient::new(
        http_client(1),
        Arc::clone(&cache),
        Arc::clone(&budget),
        server.url("/routes").to_string(),
        &TravelPolicy::default(),
        CachePolicy::default(),
    )
    .unwrap();
    let target = TravelTarget {
        place_id: "clinic-1",
        location: Coordinates::new(52.23, 21.01),
    };
    let origin = hub();

    let early = Utc.with_ymd_and_hms(2025, 3, 4, 16, 10, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2025, 3, 4, 16, 14, 0).unwrap();
    let first = client
        .compute_duration(&origin.id, origin.coordinates(), target, early, "TRANSIT")
        .await
        .unwrap();
    let second = client
        .compute_duration(&origin.id, origin.coordinates(), target, later, "TRANSIT")
        .await
        .unwrap();

    assert_eq!(first, Some(754));
    assert_eq!(second, Some(754));
    let metrics = budget.metrics().snapshot();
    assert_eq!(metrics.travel_requests, 1);
    assert_eq!(metrics.travel_dedup_skips, 1);
}

/// Serves one scripted raw response per connection, in order.
/// `HANG_UP` closes the connection after reading the request, without a reply.
async fn scripted_server(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    tokio::spawn(async move {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            if read_request(&mut stream).await.is_err() {
                return;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            if response == HANG_UP {
                drop(stream);
                continue;
            }
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    (format!("http://{addr}/search"), served)
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + body_len {
            return Ok(());
        }
    }
}

const HANG_UP: &str = "";
const UNAVAILABLE: &str =
    "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const THROTTLED: &str =
    "HTTP/1.1 429 Too Many Requests\r\nretry-after: 0\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const OK_BODY: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"ok\":true}";

#[tokio::test]
async fn transient_statuses_are_retried_until_success() {
    let (url, served) = scripted_server(vec![UNAVAILABLE, THROTTLED, OK_BODY]).await;
    let client = http_client(5);
    let response = client
        .post_json(&url, &json!({"textQuery": "x"}), "places.id", None)
        .await
        .unwrap();
    assert_eq!(response, json!({"ok": true}));
    assert_eq!(served.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_stop_at_the_attempt_limit() {
    let (url, served) = scripted_server(vec![UNAVAILABLE, UNAVAILABLE, UNAVAILABLE, OK_BODY]).await;
    let client = http_client(3);
    let err = client
        .post_json(&url, &json!({}), "places.id", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::HttpStatus { status: 503, .. }));
    assert_eq!(served.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn dropped_connections_are_retried() {
    let (url, served) = scripted_server(vec![HANG_UP, OK_BODY]).await;
    let client = http_client(3);
    let response = client
        .post_json(&url, &json!({"textQuery": "x"}), "places.id", None)
        .await
        .unwrap();
    assert_eq!(response, json!({"ok": true}));
    assert_eq!(served.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn transport_failures_surface_after_the_attempt_limit() {
    let (url, served) = scripted_server(vec![HANG_UP, HANG_UP, HANG_UP, OK_BODY]).await;
    let client = http_client(3);
    let err = client
        .post_json(&url, &json!({}), "places.id", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Transport(_)));
    assert_eq!(served.load(Ordering::SeqCst), 3);
}
