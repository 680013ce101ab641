use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};

use crate::contracts::ContractLifecycleManager;
use crate::contracts::store::{self as contract_store, ContractStore};
use crate::contracts::types::{CONTRACT_OFFER_ACCEPTED_REQUEST_SCHEMA_V1, OfferAcceptedRequestV1};
use crate::ledger::WalletLedgerService;
use crate::ledger::store as ledger_store;
use crate::notifications::sink::{HttpNotificationSink, NotificationSink, NotificationSinkError};
use crate::notifications::types::{NotificationPayloadV1, NotificationStatusV1};
use crate::notifications::{NotificationDispatcher, NotificationDispatcherConfig};

#[derive(Default)]
struct ScriptedSink {
    script: Mutex<VecDeque<Result<(), NotificationSinkError>>>,
    delivered: Mutex<Vec<NotificationPayloadV1>>,
}

impl ScriptedSink {
    fn with_script(script: Vec<Result<(), NotificationSinkError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            delivered: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl NotificationSink for ScriptedSink {
    async fn deliver(
        &self,
        notification: &NotificationPayloadV1,
    ) -> Result<(), NotificationSinkError> {
        let next = self.script.lock().await.pop_front().unwrap_or(Ok(()));
        if next.is_ok() {
            self.delivered.lock().await.push(notification.clone());
        }
        next
    }
}

async fn store_with_one_notification() -> Result<Arc<dyn ContractStore>> {
    let store = contract_store::memory();
    let ledger = Arc::new(WalletLedgerService::new(ledger_store::memory()));
    ledger.deposit("acct_client", 100, "", None).await?;
    ContractLifecycleManager::new(store.clone(), ledger)
        .propose_contract(OfferAcceptedRequestV1 {
            schema: CONTRACT_OFFER_ACCEPTED_REQUEST_SCHEMA_V1.to_string(),
            title: "Transcription".to_string(),
            description: String::new(),
            price: 50,
            provider_id: "acct_provider".to_string(),
            client_id: "acct_client".to_string(),
            brief_id: None,
            offer_ref: Some("offer_n1".to_string()),
        })
        .await
        .context("propose")?;
    Ok(store)
}

fn config(max_attempts: i32) -> NotificationDispatcherConfig {
    NotificationDispatcherConfig {
        interval_seconds: 1,
        batch_size: 10,
        max_attempts,
        retry_backoff_seconds: 10,
    }
}

#[tokio::test]
async fn dispatch_delivers_pending_notifications_once() -> Result<()> {
    let store = store_with_one_notification().await?;
    let sink = ScriptedSink::with_script(Vec::new());
    let dispatcher = NotificationDispatcher::new(store.clone(), sink.clone(), config(3));

    let now = Utc::now();
    let first = dispatcher.dispatch_due(now).await.context("first pass")?;
    assert_eq!((first.attempted, first.delivered), (1, 1));

    let second = dispatcher.dispatch_due(now).await.context("second pass")?;
    assert_eq!(second.attempted, 0);

    let delivered = sink.delivered.lock().await.clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].user_id, "acct_provider");

    let rows = store.list_notifications_for_user("acct_provider").await?;
    assert_eq!(rows[0].status, NotificationStatusV1::Delivered.as_str());
    assert_eq!(rows[0].attempts, 1);
    assert!(rows[0].delivered_at.is_some());
    Ok(())
}

#[tokio::test]
async fn retryable_failure_backs_off_then_delivers() -> Result<()> {
    let store = store_with_one_notification().await?;
    let sink = ScriptedSink::with_script(vec![Err(NotificationSinkError::Unavailable(
        "connection refused".to_string(),
    ))]);
    let dispatcher = NotificationDispatcher::new(store.clone(), sink.clone(), config(3));

    let now = Utc::now();
    let first = dispatcher.dispatch_due(now).await?;
    assert_eq!((first.attempted, first.retried), (1, 1));

    let rows = store.list_notifications_for_user("acct_provider").await?;
    assert_eq!(rows[0].status, NotificationStatusV1::Pending.as_str());
    assert_eq!(rows[0].attempts, 1);
    assert!(rows[0].last_error.is_some());
    assert!(rows[0].next_attempt_at > now);

    let too_early = dispatcher.dispatch_due(now + Duration::seconds(5)).await?;
    assert_eq!(too_early.attempted, 0);

    let later = dispatcher.dispatch_due(now + Duration::seconds(11)).await?;
    assert_eq!((later.attempted, later.delivered), (1, 1));
    assert_eq!(sink.delivered.lock().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_attempts_park_the_notification_as_failed() -> Result<()> {
    let store = store_with_one_notification().await?;
    let sink = ScriptedSink::with_script(vec![
        Err(NotificationSinkError::Unavailable("timeout".to_string())),
        Err(NotificationSinkError::Unavailable("timeout".to_string())),
    ]);
    let dispatcher = NotificationDispatcher::new(store.clone(), sink, config(2));

    let now = Utc::now();
    dispatcher.dispatch_due(now).await?;
    let last = dispatcher.dispatch_due(now + Duration::seconds(60)).await?;
    assert_eq!((last.attempted, last.failed), (1, 1));

    let failed = store
        .list_notifications_by_status(NotificationStatusV1::Failed, 10)
        .await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 2);

    let idle = dispatcher.dispatch_due(now + Duration::hours(2)).await?;
    assert_eq!(idle.attempted, 0);
    Ok(())
}

#[tokio::test]
async fn rejected_delivery_is_not_retried() -> Result<()> {
    let store = store_with_one_notification().await?;
    let sink = ScriptedSink::with_script(vec![Err(NotificationSinkError::Rejected(
        "unknown user".to_string(),
    ))]);
    let dispatcher = NotificationDispatcher::new(store.clone(), sink, config(5));

    let outcome = dispatcher.dispatch_due(Utc::now()).await?;
    assert_eq!((outcome.attempted, outcome.failed, outcome.retried), (1, 1, 0));
    let failed = store
        .list_notifications_by_status(NotificationStatusV1::Failed, 10)
        .await?;
    assert_eq!(failed.len(), 1);
    Ok(())
}

#[derive(Clone)]
struct WebhookState {
    status: StatusCode,
    received: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn spawn_webhook_stub(
    status: StatusCode,
) -> Result<(String, WebhookState, oneshot::Sender<()>)> {
    async fn receive(
        State(state): State<WebhookState>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let authorization = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        state.received.lock().await.push((authorization, body));
        if state.status.is_success() {
            (state.status, Json(json!({"ok": true})))
        } else {
            (
                state.status,
                Json(json!({"error": {"code": "stub_refused", "message": "refused"}})),
            )
        }
    }

    let state = WebhookState {
        status,
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/notify", post(receive))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });
    Ok((format!("http://{addr}/notify"), state, shutdown_tx))
}

fn payload() -> NotificationPayloadV1 {
    NotificationPayloadV1 {
        notification_id: "ntf_test".to_string(),
        user_id: "acct_provider".to_string(),
        title: "New contract".to_string(),
        description: "A client started the contract".to_string(),
    }
}

#[tokio::test]
async fn http_sink_posts_payload_with_bearer_token() -> Result<()> {
    let (url, state, shutdown) = spawn_webhook_stub(StatusCode::OK).await?;
    let sink = HttpNotificationSink::new(Some(url), Some("notify-token".to_string()), 2_000)
        .context("build sink")?;

    sink.deliver(&payload()).await.context("deliver")?;

    let received = state.received.lock().await.clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0.as_deref(), Some("Bearer notify-token"));
    assert_eq!(
        received[0].1.get("user_id").and_then(Value::as_str),
        Some("acct_provider")
    );
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn http_sink_classifies_failures() -> Result<()> {
    let (rejecting_url, _, rejecting_shutdown) = spawn_webhook_stub(StatusCode::BAD_REQUEST).await?;
    let rejecting = HttpNotificationSink::new(Some(rejecting_url), None, 2_000)?;
    let rejected = rejecting.deliver(&payload()).await;
    assert!(matches!(rejected, Err(NotificationSinkError::Rejected(_))));

    let (flaky_url, _, flaky_shutdown) =
        spawn_webhook_stub(StatusCode::SERVICE_UNAVAILABLE).await?;
    let flaky = HttpNotificationSink::new(Some(flaky_url), None, 2_000)?;
    let unavailable = flaky.deliver(&payload()).await;
    assert!(matches!(
        unavailable,
        Err(NotificationSinkError::Unavailable(_))
    ));

    assert!(HttpNotificationSink::new(Some("  ".to_string()), None, 2_000).is_err());

    let _ = rejecting_shutdown.send(());
    let _ = flaky_shutdown.send(());
    Ok(())
}
