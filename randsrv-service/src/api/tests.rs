use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use curve25519_dalek::ristretto::RistrettoPoint;
use http_body_util::BodyExt as _;
use rand::rngs::OsRng;
use randsrv_types::{
    COMPRESSED_POINT_LEN, PointEncoding,
    api::{InfoResponse, ListInstancesResponse, RandomnessRequest, RandomnessResponse},
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _;

use crate::{
    AppState,
    services::{
        epoch_driver::epoch_driver_task,
        instance_registry::InstanceRegistry,
        key_handle::SyncState,
        key_source::{KeySourceService, LocalKeySource},
        randomness::{DEFAULT_MAX_POINTS, RandomnessService},
    },
};

fn registry(instances: &[(&str, &str)]) -> InstanceRegistry {
    let now = OffsetDateTime::now_utc();
    let names = instances
        .iter()
        .map(|(name, _)| name.to_string())
        .collect::<Vec<_>>();
    let durations = instances
        .iter()
        .map(|(_, duration)| duration.parse().expect("valid duration"))
        .collect::<Vec<_>>();
    InstanceRegistry::from_config(&names, &durations, now, 0, 255, now).expect("valid config")
}

fn app(registry: &InstanceRegistry) -> Router {
    super::routes(AppState {
        registry: registry.clone(),
        randomness_service: RandomnessService::new(registry.clone(), DEFAULT_MAX_POINTS, None),
    })
}

async fn test_app(instances: &[(&str, &str)]) -> (Router, InstanceRegistry) {
    let registry = registry(instances);
    let key_source: KeySourceService = Arc::new(LocalKeySource);
    registry
        .initialize(&key_source, OffsetDateTime::now_utc())
        .await
        .expect("can initialize");
    (app(&registry), registry)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("valid request")
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .expect("valid request")
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.expect("infallible");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("can read body")
        .to_bytes()
        .to_vec();
    (status, body)
}

async fn send_json<T: serde::de::DeserializeOwned>(app: &Router, request: Request<Body>) -> T {
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    serde_json::from_slice(&body).expect("valid json")
}

async fn assert_error(app: &Router, request: Request<Body>, code: StatusCode, message: &str) {
    let (status, body) = send(app, request).await;
    assert_eq!(status, code);
    let body: Value = serde_json::from_slice(&body).expect("valid json");
    assert_eq!(body["code"], json!(code.as_u16()));
    let actual = body["message"].as_str().expect("message is a string");
    assert!(
        actual.starts_with(message),
        "expected \"{message}\", got \"{actual}\""
    );
}

fn random_points(count: usize) -> Vec<[u8; COMPRESSED_POINT_LEN]> {
    (0..count)
        .map(|_| RistrettoPoint::random(&mut OsRng).compress().to_bytes())
        .collect()
}

fn randomness_body(points: &[[u8; COMPRESSED_POINT_LEN]], encoding: PointEncoding) -> String {
    let request = RandomnessRequest::from_raw_points(points, None, encoding);
    serde_json::to_string(&request).expect("can serialize")
}

#[tokio::test]
async fn welcome() {
    let (app, _) = test_app(&[("main", "1w")]).await;
    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.is_empty());
}

#[tokio::test]
async fn info() {
    let (app, registry) = test_app(&[("main", "1w"), ("alternate", "5s")]).await;

    let default: InfoResponse = send_json(&app, get("/info")).await;
    assert_eq!(default.current_epoch, 0);
    assert_eq!(default.max_points, DEFAULT_MAX_POINTS);
    assert!(default.next_epoch_time > OffsetDateTime::now_utc());
    let public_key = PointEncoding::Base64
        .decode(&default.public_key)
        .expect("valid base64");
    ppoprf::ppoprf::ServerPublicKey::load_from_bincode(&public_key)
        .expect("can load public key");

    let main: InfoResponse = send_json(&app, get("/instances/main/info")).await;
    assert_eq!(main.public_key, default.public_key);

    let alternate: InfoResponse = send_json(&app, get("/instances/alternate/info")).await;
    assert_ne!(alternate.public_key, default.public_key);

    assert_error(
        &app,
        get("/instances/missing/info"),
        StatusCode::NOT_FOUND,
        "instance 'missing' not found",
    )
    .await;

    let instances: ListInstancesResponse = send_json(&app, get("/instances")).await;
    assert_eq!(instances.instances, registry.names());
    assert_eq!(instances.default_instance, "main");
}

#[tokio::test]
async fn info_cache_control() {
    let (app, _) = test_app(&[("main", "1w")]).await;
    let response = app.oneshot(get("/info")).await.expect("infallible");
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL),
        Some(&header::HeaderValue::from_static("no-cache"))
    );
}

#[tokio::test]
async fn randomness() {
    let (app, _) = test_app(&[("main", "1w"), ("alternate", "1w")]).await;
    let points = random_points(3);

    let response: RandomnessResponse = send_json(
        &app,
        post("/randomness", randomness_body(&points, PointEncoding::Base64)),
    )
    .await;
    assert_eq!(response.epoch, 0);
    assert_eq!(response.points.len(), 3);
    for point in &response.points {
        let bytes = PointEncoding::Base64.decode(point).expect("valid base64");
        assert_eq!(bytes.len(), COMPRESSED_POINT_LEN);
    }

    // same key, same points
    let again: RandomnessResponse = send_json(
        &app,
        post(
            "/instances/main/randomness",
            randomness_body(&points, PointEncoding::Base64),
        ),
    )
    .await;
    assert_eq!(again, response);

    let alternate: RandomnessResponse = send_json(
        &app,
        post(
            "/instances/alternate/randomness",
            randomness_body(&points, PointEncoding::Base64),
        ),
    )
    .await;
    assert_ne!(alternate.points, response.points);

    assert_error(
        &app,
        post(
            "/instances/missing/randomness",
            randomness_body(&points, PointEncoding::Base64),
        ),
        StatusCode::NOT_FOUND,
        "instance 'missing' not found",
    )
    .await;
}

#[tokio::test]
async fn randomness_hex_encoding() {
    let (app, _) = test_app(&[("main", "1w")]).await;
    let points = random_points(2);
    let base64: RandomnessResponse = send_json(
        &app,
        post("/randomness", randomness_body(&points, PointEncoding::Base64)),
    )
    .await;
    let hex: RandomnessResponse = send_json(
        &app,
        post(
            "/randomness?encoding=hex",
            randomness_body(&points, PointEncoding::Hex),
        ),
    )
    .await;
    for (base64, hex) in base64.points.iter().zip(&hex.points) {
        assert_eq!(
            PointEncoding::Base64.decode(base64).expect("valid base64"),
            PointEncoding::Hex.decode(hex).expect("valid hex")
        );
    }

    // base64 points are not valid hex
    assert_error(
        &app,
        post(
            "/randomness?encoding=hex",
            randomness_body(&points, PointEncoding::Base64),
        ),
        StatusCode::BAD_REQUEST,
        "failed to decode EC point",
    )
    .await;
}

#[tokio::test]
async fn randomness_unknown_encoding() {
    let (app, _) = test_app(&[("main", "1w")]).await;
    let body = randomness_body(&random_points(1), PointEncoding::Base64);
    for uri in ["/randomness?encoding=base32", "/instances/main/randomness?encoding=base32"] {
        assert_error(
            &app,
            post(uri, body.clone()),
            StatusCode::BAD_REQUEST,
            "Failed to deserialize query string",
        )
        .await;
    }
}

#[tokio::test]
async fn randomness_bad_requests() {
    let (app, _) = test_app(&[("main", "1w")]).await;

    assert_error(
        &app,
        post("/randomness", Body::empty()),
        StatusCode::BAD_REQUEST,
        "no request body",
    )
    .await;
    assert_error(
        &app,
        post("/randomness", "{\"points\": "),
        StatusCode::BAD_REQUEST,
        "failed to decode JSON",
    )
    .await;
    assert_error(
        &app,
        post("/randomness", json!({ "points": [] }).to_string()),
        StatusCode::BAD_REQUEST,
        "no EC points in request body",
    )
    .await;
    assert_error(
        &app,
        post("/randomness", json!({ "points": ["foo"] }).to_string()),
        StatusCode::BAD_REQUEST,
        "failed to decode EC point",
    )
    .await;
    assert_error(
        &app,
        post(
            "/randomness",
            json!({ "points": [PointEncoding::Base64.encode([0x11u8; COMPRESSED_POINT_LEN])] })
                .to_string(),
        ),
        StatusCode::BAD_REQUEST,
        "failed to parse EC point",
    )
    .await;
    assert_error(
        &app,
        post(
            "/randomness",
            json!({ "points": [PointEncoding::Base64.encode([0u8; 16])] }).to_string(),
        ),
        StatusCode::BAD_REQUEST,
        "failed to parse EC point",
    )
    .await;
    assert_error(
        &app,
        post(
            "/randomness",
            json!({ "points": vec!["foo"; DEFAULT_MAX_POINTS + 1] }).to_string(),
        ),
        StatusCode::BAD_REQUEST,
        "too many points",
    )
    .await;
}

#[tokio::test]
async fn randomness_explicit_current_epoch() {
    let (app, _) = test_app(&[("main", "1w")]).await;
    let request =
        RandomnessRequest::from_raw_points(random_points(1), Some(0), PointEncoding::Base64);
    let response: RandomnessResponse = send_json(
        &app,
        post("/randomness", serde_json::to_string(&request).expect("can serialize")),
    )
    .await;
    assert_eq!(response.epoch, 0);
}

#[tokio::test]
async fn randomness_bad_epoch() {
    let (app, registry) = test_app(&[("main", "1w")]).await;
    let instance = registry.get("main").expect("exists");
    let position = instance
        .schedule()
        .position_at(OffsetDateTime::now_utc() + time::Duration::weeks(3))
        .expect("after base");
    instance.advance(&position).expect("can advance");

    let points = random_points(1);
    let body = |epoch| {
        let request =
            RandomnessRequest::from_raw_points(&points, Some(epoch), PointEncoding::Base64);
        serde_json::to_string(&request).expect("can serialize")
    };
    assert_error(
        &app,
        post("/randomness", body(2)),
        StatusCode::BAD_REQUEST,
        "invalid epoch 2",
    )
    .await;
    let response: RandomnessResponse = send_json(&app, post("/randomness", body(3))).await;
    assert_eq!(response.epoch, 3);
    let response: RandomnessResponse = send_json(&app, post("/randomness", body(200))).await;
    assert_eq!(response.epoch, 200);
}

#[tokio::test]
async fn not_ready() {
    let registry = registry(&[("main", "1w")]);
    let app = app(&registry);

    let (status, _) = send(&app, get("/health/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _) = send(&app, get("/health/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_error(
        &app,
        get("/info"),
        StatusCode::SERVICE_UNAVAILABLE,
        "instance 'main' is not ready",
    )
    .await;
    assert_error(
        &app,
        post("/randomness", randomness_body(&random_points(1), PointEncoding::Base64)),
        StatusCode::SERVICE_UNAVAILABLE,
        "instance 'main' is not ready",
    )
    .await;

    let key_source: KeySourceService = Arc::new(LocalKeySource);
    registry
        .initialize(&key_source, OffsetDateTime::now_utc())
        .await
        .expect("can initialize");
    let (status, _) = send(&app, get("/health/ready")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn epoch_advances() {
    let (app, registry) = test_app(&[("main", "1ms")]).await;
    let cancellation_token = CancellationToken::new();
    let key_source: KeySourceService = Arc::new(LocalKeySource);
    let drivers = registry
        .instances()
        .map(|instance| {
            tokio::spawn(epoch_driver_task(
                Arc::clone(instance),
                Arc::clone(&key_source),
                cancellation_token.clone(),
            ))
        })
        .collect::<Vec<_>>();

    let before: InfoResponse = send_json(&app, get("/info")).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let after: InfoResponse = send_json(&app, get("/info")).await;
    assert_ne!(before.current_epoch, after.current_epoch);
    assert!(after.next_epoch_time > before.next_epoch_time);

    cancellation_token.cancel();
    for driver in drivers {
        driver
            .await
            .expect("driver does not panic")
            .expect("driver stops cleanly");
    }
}

#[tokio::test]
async fn sync_endpoint() {
    let (_, registry) = test_app(&[("main", "1w")]).await;
    let internal = super::internal_routes(registry.clone());

    let response = internal
        .clone()
        .oneshot(get("/sync/instances/main/state"))
        .await
        .expect("infallible");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE),
        Some(&header::HeaderValue::from_static("application/octet-stream"))
    );
    let body = response
        .into_body()
        .collect()
        .await
        .expect("can read body")
        .to_bytes();
    let state: SyncState = bincode::deserialize(&body).expect("valid key state");
    assert_eq!(state.epoch, 0);
    assert_eq!(state.elapsed, 0);

    let (status, _) = send(&internal, get("/sync/instances/missing/state")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // the public router never exposes key material
    let (status, _) = send(&app(&registry), get("/sync/instances/main/state")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
