//! # Integration Tests for the Proposal Gateway
//!
//! Drive the full request pipeline in-process through `ProposalServer::route`
//! with `Full<Bytes>` bodies; no sockets are opened.
//!
//! ## Test Categories
//!
//! - **Calculation**: plaintext and encrypted round trips
//! - **Admission**: method, content type, bearer, size and rate checks
//! - **Authorization**: tier and endpoint-for-mode denials
//! - **Failure mapping**: deadline, decryption and persistence failures
//! - **Telemetry**: health and metrics endpoints

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use proposal_gate::{
    crypto::{Claims, Envelope, PayloadCipher, SymmetricKey, TokenSigner},
    engine::ProposalResult,
    error::{ProposalError, Result},
    server::{config::SecretValue, ProposalServer, ServerConfig},
    store::{InMemoryProposalStore, ProposalRecord, ProposalStore},
};
use rust_decimal::Decimal;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

const SECRET: &str = "integration-test-secret";
const CLIENT_ID: &str = "3f0c2a4e-9a51-4d8e-8a39-0f6c1b2d7e11";

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        jwt_secret: Some(SecretValue::new(SECRET)),
        compute_threads: Some(2),
        ..ServerConfig::default()
    }
}

fn secure_config(key: &SymmetricKey) -> ServerConfig {
    ServerConfig {
        secure_mode: true,
        aes_key: Some(SecretValue::new(key.to_base64())),
        ..test_config()
    }
}

fn token_for(plan: &str) -> String {
    TokenSigner::new(SECRET)
        .sign(&Claims::for_plan(plan).expiring_in(3600))
        .unwrap()
}

fn proposal_body(gross: &str, plan: &str) -> String {
    format!(r#"{{"idCliente":"{CLIENT_ID}","valorBruto":"{gross}","plano":"{plan}"}}"#)
}

fn peer(last_octet: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), 51000)
}

fn post(path: &str, token: Option<&str>, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Full::new(body.into())).unwrap()
}

async fn body_bytes(response: Response<Full<Bytes>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Store whose every save fails
struct FailingStore;

impl ProposalStore for FailingStore {
    fn save(&self, _record: &ProposalRecord) -> Result<()> {
        Err(ProposalError::persistence_error("disk full", None))
    }
}

#[tokio::test]
async fn test_plain_calculation_pro_tier() {
    let store = Arc::new(InMemoryProposalStore::new());
    let server = ProposalServer::with_store(test_config(), store.clone()).unwrap();

    let token = token_for("PRO");
    let request = post(
        "/api/calcular",
        Some(&token),
        proposal_body("1000.00", "pro"),
    );
    let response = server.route(request, peer(1)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let result: ProposalResult = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(result.fee_amount, Decimal::new(15000, 2));
    assert_eq!(result.net_amount, Decimal::new(85000, 2));
    assert_eq!(result.status, "processed");

    assert_eq!(store.len(), 1);
    let record = store.get(&result.proposal_id).unwrap();
    assert_eq!(record.gross_amount, Decimal::new(100000, 2));
    assert_eq!(record.client_id.to_string(), CLIENT_ID);

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.total, 1);
    assert_eq!(snapshot.success, 1);
}

#[tokio::test]
async fn test_wire_field_names() {
    let server = ProposalServer::new(test_config()).unwrap();
    let token = token_for("PRO");

    // body sent by the command-line test client
    let original = r#"{"idCliente":"e7f6b1c6-9cb0-4c1a-9c76-2a9bf3b2a1c1","valorBruto":1000.00,"plano":"PRO"}"#;
    let response = server
        .route(post("/api/calcular", Some(&token), original), peer(1))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["taxaAplicada"].to_string(), "150.00");
    assert_eq!(json["valorLiquido"].to_string(), "850.00");
    assert_eq!(json["status"], "processed");
    assert!(json["idProposta"].is_string());
    assert!(json.get("feeAmount").is_none());

    let aliased = format!(r#"{{"clientId":"{CLIENT_ID}","grossAmount":1000.00,"plan":"pro"}}"#);
    let response = server
        .route(post("/api/calcular", Some(&token), aliased), peer(1))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["taxaAplicada"].to_string(), "150.00");
}

#[tokio::test]
async fn test_unrepresentable_amount_is_rejected() {
    let store = Arc::new(InMemoryProposalStore::new());
    let server = ProposalServer::with_store(test_config(), store.clone()).unwrap();
    let token = token_for("PRO");

    for gross in ["0.000000000000000000000000000049", "98765432109.876543210987654321"] {
        let response = server
            .route(
                post("/api/calcular", Some(&token), proposal_body(gross, "PRO")),
                peer(1),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{gross}");
        assert_eq!(body_json(response).await["message"], "invalid value for valorBruto");
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_missing_bearer_prefix_is_unauthorized() {
    let server = ProposalServer::new(test_config()).unwrap();
    let token = token_for("PRO");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/calcular")
        .header("content-type", "application/json")
        .header("authorization", token)
        .header("x-request-id", "trace-401")
        .body(Full::new(Bytes::from(proposal_body("10", "PRO"))))
        .unwrap();
    let response = server.route(request, peer(1)).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["status"], 401);
    assert_eq!(json["error"], "Unauthorized");
    assert_eq!(json["message"], "authorization required");
    assert_eq!(json["requestId"], "trace-401");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_insufficient_tier_is_forbidden() {
    let server = ProposalServer::new(test_config()).unwrap();
    let token = token_for("STARTER");

    let response = server
        .route(
            post("/api/calcular", Some(&token), proposal_body("10", "VIP")),
            peer(1),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // tampered signature is the same client-visible outcome
    let mut forged = token_for("VIP");
    let last = forged.pop().unwrap();
    forged.push(if last == 'A' { 'B' } else { 'A' });
    let response = server
        .route(
            post("/api/calcular", Some(&forged), proposal_body("10", "VIP")),
            peer(1),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["message"], "access denied");
}

#[tokio::test]
async fn test_oversized_body_rejected_before_parsing() {
    let config = ServerConfig {
        max_body_bytes: 256,
        ..test_config()
    };
    let server = ProposalServer::new(config).unwrap();
    let token = token_for("PRO");

    // declared length
    let mut request = post("/api/calcular", Some(&token), "{}");
    request
        .headers_mut()
        .insert("content-length", "100000".parse().unwrap());
    let response = server.route(request, peer(1)).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // streamed length, not valid JSON either
    let response = server
        .route(post("/api/calcular", Some(&token), "x".repeat(1024)), peer(1))
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_body_cap_boundary() {
    let body = proposal_body("10", "PRO");
    let cap = body.len() + 16;
    let config = ServerConfig {
        max_body_bytes: cap,
        ..test_config()
    };
    let server = ProposalServer::new(config).unwrap();
    let token = token_for("PRO");

    // trailing whitespace is trimmed after the size check
    let at_cap = format!("{body}{}", " ".repeat(16));
    assert_eq!(at_cap.len(), cap);
    let mut request = post("/api/calcular", Some(&token), at_cap.clone());
    request
        .headers_mut()
        .insert("content-length", cap.to_string().parse().unwrap());
    let response = server.route(request, peer(1)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let over = format!("{at_cap} ");
    let response = server
        .route(post("/api/calcular", Some(&token), over.clone()), peer(1))
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let mut request = post("/api/calcular", Some(&token), over);
    request
        .headers_mut()
        .insert("content-length", (cap + 1).to_string().parse().unwrap());
    let response = server.route(request, peer(1)).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_non_numeric_content_length_is_bad_request() {
    let server = ProposalServer::new(test_config()).unwrap();
    let token = token_for("PRO");

    for declared in ["abc", "-1", "12abc"] {
        let mut request = post("/api/calcular", Some(&token), proposal_body("10", "PRO"));
        request
            .headers_mut()
            .insert("content-length", declared.parse().unwrap());
        let response = server.route(request, peer(1)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{declared}");
        assert_eq!(body_json(response).await["message"], "invalid Content-Length");
    }
}

#[tokio::test]
async fn test_non_utf8_bodies_are_bad_requests() {
    let token = token_for("PRO");
    let invalid = vec![b'{', 0xff, 0xfe, b'}'];

    let server = ProposalServer::new(test_config()).unwrap();
    let response = server
        .route(post("/api/calcular", Some(&token), invalid.clone()), peer(8))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["message"], "body must be UTF-8");

    let key = SymmetricKey::generate(32).unwrap();
    let server = ProposalServer::new(secure_config(&key)).unwrap();
    let envelope = PayloadCipher::new(key).encrypt(&invalid).unwrap();
    let response = server
        .route(
            post("/api/calcular-secure", Some(&token), envelope.to_json().unwrap()),
            peer(8),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["message"], "invalid encrypted payload");
}

#[tokio::test]
async fn test_admission_failures() {
    let server = ProposalServer::new(test_config()).unwrap();
    let token = token_for("PRO");

    let wrong_type = Request::builder()
        .method(Method::POST)
        .uri("/api/calcular")
        .header("content-type", "text/plain")
        .header("authorization", format!("Bearer {token}"))
        .body(Full::new(Bytes::from(proposal_body("10", "PRO"))))
        .unwrap();
    let response = server.route(wrong_type, peer(1)).await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = server
        .route(post("/api/calcular", Some(&token), "   "), peer(1))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server
        .route(
            post("/api/calcular", Some(&token), proposal_body("-5", "PRO")),
            peer(1),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server
        .route(
            post("/api/calcular", Some(&token), r#"{"valorBruto":"10","plano":"PRO"}"#),
            peer(1),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server
        .route(post("/api/calcular", Some(""), proposal_body("10", "PRO")), peer(1))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.total, 5);
    assert_eq!(snapshot.failure, 5);
}

#[tokio::test]
async fn test_secure_round_trip() {
    let key = SymmetricKey::generate(32).unwrap();
    let server = ProposalServer::new(secure_config(&key)).unwrap();
    let cipher = PayloadCipher::new(key.clone());
    let token = token_for("VIP");

    let envelope = cipher
        .encrypt(proposal_body("250.50", "VIP").as_bytes())
        .unwrap();
    let response = server
        .route(
            post(
                "/api/calcular-secure",
                Some(&token),
                envelope.to_json().unwrap(),
            ),
            peer(2),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    let reply = Envelope::from_json(&body).unwrap();
    let plaintext = cipher.decrypt(&reply).unwrap();
    let result: ProposalResult = serde_json::from_slice(&plaintext).unwrap();

    // 250.50 * 0.02 = 5.01
    assert_eq!(result.fee_amount, Decimal::new(501, 2));
    assert_eq!(result.net_amount, Decimal::new(24549, 2));
}

#[tokio::test]
async fn test_secure_decryption_failures_are_bad_requests() {
    let key = SymmetricKey::generate(16).unwrap();
    let server = ProposalServer::new(secure_config(&key)).unwrap();
    let token = token_for("PRO");

    let other = PayloadCipher::new(SymmetricKey::generate(16).unwrap());
    let foreign = other
        .encrypt(proposal_body("10", "PRO").as_bytes())
        .unwrap()
        .to_json()
        .unwrap();

    let mut messages = Vec::new();
    for body in [foreign, r#"{"iv":"!!","data":"??"}"#.to_string(), "{}".to_string()] {
        let response = server
            .route(post("/api/calcular-secure", Some(&token), body), peer(3))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        messages.push(body_json(response).await["message"].clone());
    }

    // no hint about which check failed
    assert!(messages.iter().all(|m| m == &messages[0]));
}

#[tokio::test]
async fn test_endpoint_for_mode_policy() {
    let token = token_for("PRO");

    let plain_server = ProposalServer::new(test_config()).unwrap();
    let response = plain_server
        .route(
            post("/api/calcular-secure", Some(&token), "{}"),
            peer(4),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let key = SymmetricKey::generate(24).unwrap();
    let secure_server = ProposalServer::new(secure_config(&key)).unwrap();
    let response = secure_server
        .route(
            post("/api/calcular", Some(&token), proposal_body("10", "PRO")),
            peer(4),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let permissive = ServerConfig {
        allow_plain: true,
        ..secure_config(&key)
    };
    let server = ProposalServer::new(permissive).unwrap();
    let response = server
        .route(
            post("/api/calcular", Some(&token), proposal_body("10", "PRO")),
            peer(4),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_deadline_exceeded_is_gateway_timeout() {
    let config = ServerConfig {
        simulated_delay_ms: 500,
        request_timeout_ms: 50,
        ..test_config()
    };
    let store = Arc::new(InMemoryProposalStore::new());
    let server = ProposalServer::with_store(config, store.clone()).unwrap();
    let token = token_for("PRO");

    let response = server
        .route(
            post("/api/calcular", Some(&token), proposal_body("10", "PRO")),
            peer(5),
        )
        .await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(store.is_empty());
    assert_eq!(server.metrics().snapshot().failure, 1);
}

#[tokio::test]
async fn test_persistence_failure_is_internal_error() {
    let server = ProposalServer::with_store(test_config(), Arc::new(FailingStore)).unwrap();
    let token = token_for("PRO");

    let response = server
        .route(
            post("/api/calcular", Some(&token), proposal_body("10", "PRO")),
            peer(6),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["message"], "failed to persist proposal");
    assert!(!json.to_string().contains("disk full"));
}

#[tokio::test]
async fn test_rate_limit_is_per_client() {
    let config = ServerConfig {
        rate_limit_max: 20,
        ..test_config()
    };
    let server = Arc::new(ProposalServer::new(config).unwrap());
    let token = token_for("STARTER");

    let handles: Vec<_> = (0..50u8)
        .map(|i| {
            let server = Arc::clone(&server);
            let token = token.clone();
            let client = peer(10 + i % 2);
            tokio::spawn(async move {
                let request = post(
                    "/api/calcular",
                    Some(&token),
                    proposal_body("100", "STARTER"),
                );
                (client, server.route(request, client).await.status())
            })
        })
        .collect();

    let mut admitted = [0u32; 2];
    let mut limited = [0u32; 2];
    for handle in handles {
        let (client, status) = handle.await.unwrap();
        let slot = usize::from(client.ip() == peer(11).ip());
        match status {
            StatusCode::OK => admitted[slot] += 1,
            StatusCode::TOO_MANY_REQUESTS => limited[slot] += 1,
            other => panic!("unexpected status {other}"),
        }
    }

    assert_eq!(admitted, [20, 20]);
    assert_eq!(limited, [5, 5]);

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.total, 50);
    assert_eq!(snapshot.success, 40);
    assert_eq!(snapshot.failure, 10);
}

#[tokio::test]
async fn test_health_metrics_and_unknown_routes() {
    let server = ProposalServer::new(test_config()).unwrap();
    let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000);
    let get = |path: &str| {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    };

    let response = server.route(get("/health"), peer(7)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "UP");

    let token = token_for("PRO");
    let response = server
        .route(
            post("/api/calcular", Some(&token), proposal_body("10", "PRO")),
            peer(7),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server.route(get("/metrics"), loopback).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["totalRequests"], 1);
    assert_eq!(json["successRequests"], 1);
    assert_eq!(json["failureRequests"], 0);
    assert!(!json["lastRequestAt"].as_str().unwrap().is_empty());

    let response = server.route(get("/metrics"), peer(7)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = server.route(get("/decrypt"), peer(7)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["status"], 404);
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let missing_secret = ServerConfig {
        jwt_secret: None,
        ..test_config()
    };
    assert!(matches!(
        ProposalServer::new(missing_secret),
        Err(ProposalError::ConfigError { .. })
    ));

    let bad_key = ServerConfig {
        secure_mode: true,
        aes_key: Some(SecretValue::new("c2hvcnQ=")),
        ..test_config()
    };
    assert!(ProposalServer::new(bad_key).is_err());

    let keyless = ServerConfig {
        secure_mode: true,
        ..test_config()
    };
    assert!(ProposalServer::new(keyless).is_err());
}
