use std::collections::HashSet;

use anyhow::Result;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use chrono::Utc;
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

use super::build_router;
use crate::{
    EscrowStores,
    auth::AccountTokenClaims,
    build_app_state,
    config::{Config, NotificationConfig},
    contracts::types::CONTRACT_OFFER_ACCEPTED_REQUEST_SCHEMA_V1,
    ledger::WalletPolicyConfig,
};

const TEST_SIGNING_KEY: &str = "escrow-router-test-key";
const TEST_ISSUER: &str = "https://marketplace.test";
const TEST_AUDIENCE: &str = "marketplace-escrow";
const TEST_INTERNAL_TOKEN: &str = "chat-internal-token";
const CLIENT: &str = "acct_client";
const PROVIDER: &str = "acct_provider";

fn test_config(internal_token: Option<&str>) -> Config {
    Config {
        service_name: "escrow-test".to_string(),
        bind_addr: std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
        db_url: None,
        auth_signing_key: TEST_SIGNING_KEY.to_string(),
        auth_issuer: TEST_ISSUER.to_string(),
        auth_audience: TEST_AUDIENCE.to_string(),
        auth_max_token_age_seconds: 300,
        auth_revoked_jtis: HashSet::from([String::from("revoked-jti")]),
        internal_token: internal_token.map(str::to_string),
        wallet_policy: WalletPolicyConfig::default(),
        notifications: NotificationConfig::default(),
    }
}

fn test_router() -> axum::Router {
    test_router_with_internal_token(Some(TEST_INTERNAL_TOKEN))
}

fn test_router_with_internal_token(internal_token: Option<&str>) -> axum::Router {
    build_router(build_app_state(
        test_config(internal_token),
        EscrowStores::memory(),
    ))
}

fn issue_token(account_id: &str, jti: &str) -> String {
    let now = Utc::now().timestamp();
    let claims = AccountTokenClaims {
        iss: TEST_ISSUER.to_string(),
        aud: TEST_AUDIENCE.to_string(),
        sub: account_id.to_string(),
        exp: (now + 60) as usize,
        nbf: now as usize,
        iat: now as usize,
        jti: jti.to_string(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_SIGNING_KEY.as_bytes()),
    )
    .expect("account token should encode")
}

fn get(uri: &str, account_id: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(account_id) = account_id {
        builder = builder.header(
            "authorization",
            format!("Bearer {}", issue_token(account_id, "jti-get")),
        );
    }
    Ok(builder.body(Body::empty())?)
}

fn post_json(uri: &str, bearer: Option<&str>, body: &Value) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(bearer) = bearer {
        builder = builder.header("authorization", format!("Bearer {bearer}"));
    }
    Ok(builder.body(Body::from(body.to_string()))?)
}

fn post_as(uri: &str, account_id: &str, body: &Value) -> Result<Request<Body>> {
    post_json(uri, Some(&issue_token(account_id, "jti-post")), body)
}

async fn response_json(response: axum::response::Response) -> Result<Value> {
    let collected = response.into_body().collect().await?;
    let bytes = collected.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn offer_body(title: &str, price: u64, offer_ref: Option<&str>) -> Value {
    json!({
        "schema": CONTRACT_OFFER_ACCEPTED_REQUEST_SCHEMA_V1,
        "title": title,
        "description": "record a product demo",
        "price": price,
        "provider_id": PROVIDER,
        "client_id": CLIENT,
        "brief_id": "brief_1",
        "offer_ref": offer_ref,
    })
}

async fn fund_client(app: &axum::Router, amount: u64) -> Result<()> {
    let response = app
        .clone()
        .oneshot(post_as(
            "/v1/wallet/deposits",
            CLIENT,
            &json!({ "amount": amount, "description": "top up" }),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    Ok(())
}

async fn accept_offer(app: &axum::Router, body: &Value) -> Result<axum::response::Response> {
    Ok(app
        .clone()
        .oneshot(post_json(
            "/internal/v1/offers/accepted",
            Some(TEST_INTERNAL_TOKEN),
            body,
        )?)
        .await?)
}

async fn wallet(app: &axum::Router, account_id: &str) -> Result<Value> {
    let response = app
        .clone()
        .oneshot(get("/v1/wallet", Some(account_id))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await?;
    Ok(body["account"].clone())
}

#[tokio::test]
async fn health_and_readiness_endpoints_are_available() -> Result<()> {
    let app = test_router();

    let health = app.clone().oneshot(get("/healthz", None)?).await?;
    let readiness = app.oneshot(get("/readyz", None)?).await?;

    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(readiness.status(), StatusCode::OK);
    let health = response_json(health).await?;
    assert_eq!(health["service"], json!("escrow-test"));
    assert_eq!(health["store_driver"], json!("memory"));
    Ok(())
}

#[tokio::test]
async fn wallet_routes_require_account_token() -> Result<()> {
    let app = test_router();

    let missing = app.clone().oneshot(get("/v1/wallet", None)?).await?;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let missing = response_json(missing).await?;
    assert_eq!(missing["reason_code"], json!("missing_authorization"));

    let garbage = app
        .clone()
        .oneshot(post_json(
            "/v1/wallet/deposits",
            Some("not-a-jwt"),
            &json!({ "amount": 10 }),
        )?)
        .await?;
    assert_eq!(garbage.status(), StatusCode::UNAUTHORIZED);

    let revoked = app
        .oneshot(post_json(
            "/v1/wallet/deposits",
            Some(&issue_token(CLIENT, "revoked-jti")),
            &json!({ "amount": 10 }),
        )?)
        .await?;
    assert_eq!(revoked.status(), StatusCode::UNAUTHORIZED);
    let revoked = response_json(revoked).await?;
    assert_eq!(revoked["reason_code"], json!("token_revoked"));
    Ok(())
}

#[tokio::test]
async fn deposit_replay_and_withdrawal_flow() -> Result<()> {
    let app = test_router();
    let deposit = json!({
        "amount": 1_000,
        "description": "card top up",
        "external_payment_ref": "pi_123",
    });

    let first = app
        .clone()
        .oneshot(post_as("/v1/wallet/deposits", CLIENT, &deposit)?)
        .await?;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first = response_json(first).await?;
    assert_eq!(first["replayed"], json!(false));
    assert_eq!(first["account"]["balance"], json!(1_000));

    let replay = app
        .clone()
        .oneshot(post_as("/v1/wallet/deposits", CLIENT, &deposit)?)
        .await?;
    assert_eq!(replay.status(), StatusCode::OK);
    let replay = response_json(replay).await?;
    assert_eq!(replay["replayed"], json!(true));
    assert_eq!(replay["posting"]["posting_id"], first["posting"]["posting_id"]);
    assert_eq!(replay["account"]["balance"], json!(1_000));

    let mismatched = app
        .clone()
        .oneshot(post_as(
            "/v1/wallet/deposits",
            CLIENT,
            &json!({ "amount": 5, "external_payment_ref": "pi_123" }),
        )?)
        .await?;
    assert_eq!(mismatched.status(), StatusCode::CONFLICT);

    let overdraw = app
        .clone()
        .oneshot(post_as(
            "/v1/wallet/withdrawals",
            CLIENT,
            &json!({ "amount": 1_001 }),
        )?)
        .await?;
    assert_eq!(overdraw.status(), StatusCode::PAYMENT_REQUIRED);
    let overdraw = response_json(overdraw).await?;
    assert_eq!(overdraw["error"], json!("insufficient_funds"));

    let withdrawal = app
        .clone()
        .oneshot(post_as(
            "/v1/wallet/withdrawals",
            CLIENT,
            &json!({ "amount": 400 }),
        )?)
        .await?;
    assert_eq!(withdrawal.status(), StatusCode::CREATED);

    let zero = app
        .clone()
        .oneshot(post_as(
            "/v1/wallet/withdrawals",
            CLIENT,
            &json!({ "amount": 0 }),
        )?)
        .await?;
    assert_eq!(zero.status(), StatusCode::BAD_REQUEST);

    let entries = app
        .clone()
        .oneshot(get("/v1/wallet/entries", Some(CLIENT))?)
        .await?;
    assert_eq!(entries.status(), StatusCode::OK);
    let entries = response_json(entries).await?;
    let kinds = entries["entries"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row["kind"].as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    assert_eq!(kinds, vec!["deposit".to_string(), "withdrawal".to_string()]);

    let reconcile = app
        .oneshot(get("/v1/wallet/reconcile", Some(CLIENT))?)
        .await?;
    assert_eq!(reconcile.status(), StatusCode::OK);
    let reconcile = response_json(reconcile).await?;
    assert_eq!(reconcile["matches"], json!(true));
    assert_eq!(reconcile["balance"], json!(600));
    Ok(())
}

#[tokio::test]
async fn offer_intake_requires_internal_token() -> Result<()> {
    let app = test_router();
    fund_client(&app, 500).await?;
    let body = offer_body("Demo video", 300, Some("offer_1"));

    let missing = app
        .clone()
        .oneshot(post_json("/internal/v1/offers/accepted", None, &body)?)
        .await?;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .clone()
        .oneshot(post_json(
            "/internal/v1/offers/accepted",
            Some("wrong-token"),
            &body,
        )?)
        .await?;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let account_token = app
        .clone()
        .oneshot(post_as("/internal/v1/offers/accepted", CLIENT, &body)?)
        .await?;
    assert_eq!(account_token.status(), StatusCode::UNAUTHORIZED);

    let client = wallet(&app, CLIENT).await?;
    assert_eq!(client["balance"], json!(500));
    assert_eq!(client["escrow"], json!(0));

    let unconfigured = test_router_with_internal_token(None)
        .oneshot(post_json(
            "/internal/v1/offers/accepted",
            Some(TEST_INTERNAL_TOKEN),
            &body,
        )?)
        .await?;
    assert_eq!(unconfigured.status(), StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}

#[tokio::test]
async fn offer_intake_rejects_duplicates_and_unfunded_clients() -> Result<()> {
    let app = test_router();

    let unfunded = accept_offer(&app, &offer_body("Demo video", 300, Some("offer_1"))).await?;
    assert_eq!(unfunded.status(), StatusCode::PAYMENT_REQUIRED);

    fund_client(&app, 1_000).await?;
    let created = accept_offer(&app, &offer_body("Demo video", 300, Some("offer_1"))).await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let created = response_json(created).await?;
    assert_eq!(created["contract"]["status"], json!("active"));
    assert_eq!(created["contract"]["price"], json!(300));

    let duplicate = accept_offer(&app, &offer_body("Demo video", 300, Some("offer_1"))).await?;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let duplicate = response_json(duplicate).await?;
    assert_eq!(duplicate["error"], json!("duplicate_active_contract"));

    let client = wallet(&app, CLIENT).await?;
    assert_eq!(client["balance"], json!(700));
    assert_eq!(client["escrow"], json!(300));

    let mut invalid = offer_body("Self dealing", 100, Some("offer_2"));
    invalid["provider_id"] = json!(CLIENT);
    let invalid = accept_offer(&app, &invalid).await?;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn contract_lifecycle_over_http() -> Result<()> {
    let app = test_router();
    fund_client(&app, 1_000).await?;
    let created = accept_offer(&app, &offer_body("Landing page copy", 300, None)).await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let created = response_json(created).await?;
    let contract_id = created["contract"]["contract_id"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_default();
    assert!(!contract_id.is_empty());

    let early_review = app
        .clone()
        .oneshot(post_as(
            &format!("/v1/contracts/{contract_id}/reviews"),
            CLIENT,
            &json!({ "reviewee_id": PROVIDER, "rating": 5 }),
        )?)
        .await?;
    assert_eq!(early_review.status(), StatusCode::BAD_REQUEST);

    let wrong_party = app
        .clone()
        .oneshot(post_as(
            &format!("/v1/contracts/{contract_id}/deliver"),
            CLIENT,
            &json!({}),
        )?)
        .await?;
    assert_eq!(wrong_party.status(), StatusCode::FORBIDDEN);
    let wrong_party = response_json(wrong_party).await?;
    assert_eq!(wrong_party["error"], json!("unauthorized"));

    let delivered = app
        .clone()
        .oneshot(post_as(
            &format!("/v1/contracts/{contract_id}/deliver"),
            PROVIDER,
            &json!({}),
        )?)
        .await?;
    assert_eq!(delivered.status(), StatusCode::OK);
    let delivered = response_json(delivered).await?;
    assert_eq!(delivered["contract"]["completed_by_provider"], json!(true));

    let provider_confirm = app
        .clone()
        .oneshot(post_as(
            &format!("/v1/contracts/{contract_id}/confirm"),
            PROVIDER,
            &json!({}),
        )?)
        .await?;
    assert_eq!(provider_confirm.status(), StatusCode::FORBIDDEN);

    let confirmed = app
        .clone()
        .oneshot(post_as(
            &format!("/v1/contracts/{contract_id}/confirm"),
            CLIENT,
            &json!({}),
        )?)
        .await?;
    assert_eq!(confirmed.status(), StatusCode::OK);
    let confirmed = response_json(confirmed).await?;
    assert_eq!(confirmed["contract"]["status"], json!("completed"));

    let again = app
        .clone()
        .oneshot(post_as(
            &format!("/v1/contracts/{contract_id}/confirm"),
            CLIENT,
            &json!({}),
        )?)
        .await?;
    assert_eq!(again.status(), StatusCode::CONFLICT);
    let again = response_json(again).await?;
    assert_eq!(again["error"], json!("already_completed"));

    let client = wallet(&app, CLIENT).await?;
    assert_eq!(client["balance"], json!(700));
    assert_eq!(client["escrow"], json!(0));
    let provider = wallet(&app, PROVIDER).await?;
    assert_eq!(provider["balance"], json!(300));

    let review = app
        .clone()
        .oneshot(post_as(
            &format!("/v1/contracts/{contract_id}/reviews"),
            CLIENT,
            &json!({ "reviewee_id": PROVIDER, "rating": 5, "comment": "sharp copy" }),
        )?)
        .await?;
    assert_eq!(review.status(), StatusCode::CREATED);

    let repeat = app
        .clone()
        .oneshot(post_as(
            &format!("/v1/contracts/{contract_id}/reviews"),
            CLIENT,
            &json!({ "reviewee_id": PROVIDER, "rating": 4 }),
        )?)
        .await?;
    assert_eq!(repeat.status(), StatusCode::CONFLICT);
    let repeat = response_json(repeat).await?;
    assert_eq!(repeat["error"], json!("review_already_exists"));

    let reviews = app
        .clone()
        .oneshot(get(
            &format!("/v1/contracts/{contract_id}/reviews"),
            Some(PROVIDER),
        )?)
        .await?;
    assert_eq!(reviews.status(), StatusCode::OK);
    let reviews = response_json(reviews).await?;
    assert_eq!(reviews["reviews"].as_array().map(Vec::len), Some(1));

    let listed = app
        .oneshot(get("/v1/contracts", Some(PROVIDER))?)
        .await?;
    assert_eq!(listed.status(), StatusCode::OK);
    let listed = response_json(listed).await?;
    assert_eq!(listed["contracts"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn contract_reads_are_limited_to_parties() -> Result<()> {
    let app = test_router();
    fund_client(&app, 1_000).await?;
    let created = accept_offer(&app, &offer_body("Logo refresh", 200, Some("offer_9"))).await?;
    let created = response_json(created).await?;
    let contract_id = created["contract"]["contract_id"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_default();

    let party = app
        .clone()
        .oneshot(get(&format!("/v1/contracts/{contract_id}"), Some(CLIENT))?)
        .await?;
    assert_eq!(party.status(), StatusCode::OK);

    let outsider = app
        .clone()
        .oneshot(get(
            &format!("/v1/contracts/{contract_id}"),
            Some("acct_outsider"),
        )?)
        .await?;
    assert_eq!(outsider.status(), StatusCode::FORBIDDEN);
    let outsider = response_json(outsider).await?;
    assert_eq!(outsider["error"], json!("unauthorized"));

    let missing = app
        .oneshot(get("/v1/contracts/ctr_missing", Some(CLIENT))?)
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    Ok(())
}
