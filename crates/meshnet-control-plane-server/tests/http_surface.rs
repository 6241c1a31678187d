//! Integration tests for the Control Plane Server's HTTP surface (spec.md
//! §6.1, §8 scenario E), exercised against the `axum::Router` directly with
//! `tower::ServiceExt::oneshot` rather than a real socket, the idiom the
//! teacher's `bin-shared::http_health_check` tests use.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt as _;
use meshnet_control_plane_server::{connect, router, AppState, DEFAULT_TOKEN_TTL};
use serde_json::{json, Value};
use tower::ServiceExt as _;

async fn test_app() -> axum::Router {
    let pool = connect("sqlite::memory:", 1).await.unwrap();
    router(AppState::new(pool, DEFAULT_TOKEN_TTL))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn peer_info(peer_id: &str, public_key: &str) -> Value {
    json!({
        "peer_id": peer_id,
        "name": "peer",
        "public_key": public_key,
        "nat_type": "open",
        "public_ip": "203.0.113.1",
        "public_port": 4000,
        "local_ip": null,
        "local_port": null,
        "last_seen": chrono::Utc::now().to_rfc3339(),
    })
}

fn base64_key(byte: u8) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode([byte; 32])
}

async fn register_token(app: &axum::Router, peer_id: &str) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::post(format!("/auth/register?peer_id={peer_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_requires_no_token() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_endpoint_without_token_is_unauthorized() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::get("/parties/deadbeef").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_party_then_join_then_list_peers() {
    let app = test_app().await;
    let host_token = register_token(&app, "H").await;

    let create_response = app
        .clone()
        .oneshot(
            Request::post("/parties")
                .header("Authorization", format!("Bearer {host_token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(
                    json!({
                        "name": "game night",
                        "host_peer_info": peer_info("H", &base64_key(1)),
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::OK);
    let created = body_json(create_response).await;
    let party_id = created["party_id"].as_str().unwrap().to_string();

    let guest_token = register_token(&app, "G").await;
    let join_response = app
        .clone()
        .oneshot(
            Request::post(format!("/parties/{party_id}/join"))
                .header("Authorization", format!("Bearer {guest_token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(
                    json!({ "peer_info": peer_info("G", &base64_key(2)) }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(join_response.status(), StatusCode::OK);

    let list_response = app
        .clone()
        .oneshot(
            Request::get(format!("/parties/{party_id}/peers"))
                .header("Authorization", format!("Bearer {host_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(list_response.status(), StatusCode::OK);
    let peers = body_json(list_response).await;
    assert_eq!(peers["peers"].as_array().unwrap().len(), 2);
}

/// spec.md §8 Scenario E: a token bound to peer `G` must not be usable for
/// an operation on a different peer's path segment.
#[tokio::test]
async fn heartbeat_with_mismatched_token_is_forbidden() {
    let app = test_app().await;
    let host_token = register_token(&app, "H").await;

    let create_response = app
        .clone()
        .oneshot(
            Request::post("/parties")
                .header("Authorization", format!("Bearer {host_token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(
                    json!({
                        "name": "game night",
                        "host_peer_info": peer_info("H", &base64_key(1)),
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let party_id = body_json(create_response).await["party_id"]
        .as_str()
        .unwrap()
        .to_string();

    let guest_token = register_token(&app, "G").await;

    // G's token used against H's heartbeat path -> 403, per spec.md
    // "token does not match path's peer id".
    let response = app
        .oneshot(
            Request::post(format!("/parties/{party_id}/peers/H/heartbeat"))
                .header("Authorization", format!("Bearer {guest_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn delete_last_peer_removes_the_party() {
    let app = test_app().await;
    let host_token = register_token(&app, "solo").await;

    let create_response = app
        .clone()
        .oneshot(
            Request::post("/parties")
                .header("Authorization", format!("Bearer {host_token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(
                    json!({
                        "name": "solo party",
                        "host_peer_info": peer_info("solo", &base64_key(9)),
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let party_id = body_json(create_response).await["party_id"]
        .as_str()
        .unwrap()
        .to_string();

    let delete_response = app
        .clone()
        .oneshot(
            Request::delete(format!("/parties/{party_id}/peers/solo"))
                .header("Authorization", format!("Bearer {host_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(delete_response.status(), StatusCode::OK);

    let get_response = app
        .oneshot(
            Request::get(format!("/parties/{party_id}"))
                .header("Authorization", format!("Bearer {host_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::NOT_FOUND);
}

/// spec.md §7 "Conflict — duplicate party/peer id on creation": joining
/// with a `peer_id` already registered must be rejected, not silently
/// overwrite the existing peer's key/endpoint.
#[tokio::test]
async fn join_with_duplicate_peer_id_is_conflict() {
    let app = test_app().await;
    let host_token = register_token(&app, "H").await;

    let create_response = app
        .clone()
        .oneshot(
            Request::post("/parties")
                .header("Authorization", format!("Bearer {host_token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(
                    json!({
                        "name": "game night",
                        "host_peer_info": peer_info("H", &base64_key(1)),
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let party_id = body_json(create_response).await["party_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Attempting to join with the host's own peer_id (and a different key)
    // must not hijack the existing registration.
    let rejoin_response = app
        .clone()
        .oneshot(
            Request::post(format!("/parties/{party_id}/join"))
                .header("Authorization", format!("Bearer {host_token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(
                    json!({ "peer_info": peer_info("H", &base64_key(99)) }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rejoin_response.status(), StatusCode::CONFLICT);

    let get_response = app
        .oneshot(
            Request::get(format!("/parties/{party_id}/peers/H"))
                .header("Authorization", format!("Bearer {host_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);
    let peer = body_json(get_response).await;
    assert_eq!(peer["peer"]["public_key"].as_str().unwrap(), base64_key(1));
}
