//! End-to-end scenarios through the real router over the in-memory store.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};
use server::{
    app_state::{AppState, Stores},
    auth::session::SessionVerifier,
    db::{OrderStore, memory::MemoryStore},
    server::{create_app_router, metrics_handle},
    services::payment::{
        GatewayError, PaymentGateway,
        gateway::{CheckoutRequest, CheckoutSession, PaymentReport},
    },
};
use shared::{
    config::server::Config,
    models::{Order, OrderItem, OrderStatus, PaymentStatus, User, UserRole},
};
use uuid::Uuid;

/// Stands in for bKash: every checkout gets `PAY-<invoice>` and every
/// execute completes.
#[derive(Default)]
struct FakeGateway {
    executions: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_payment(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        Ok(CheckoutSession {
            payment_id: format!("PAY-{}", request.invoice_number),
            bkash_url: "https://sandbox.bka.sh/checkout".to_string(),
        })
    }

    async fn execute_payment(&self, payment_id: String) -> Result<PaymentReport, GatewayError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentReport {
            payment_id,
            transaction_status: Some("Completed".to_string()),
            trx_id: Some("TRX-9001".to_string()),
            status_message: None,
        })
    }

    async fn query_payment(&self, payment_id: String) -> Result<PaymentReport, GatewayError> {
        Err(GatewayError::Rejected {
            code: "2056".to_string(),
            message: format!("no status for {payment_id}"),
        })
    }
}

struct Harness {
    server: TestServer,
    store: Arc<MemoryStore>,
    gateway: Arc<FakeGateway>,
    sessions: SessionVerifier,
}

impl Harness {
    fn new() -> Self {
        let mut config = Config::default();
        config.db.url = "memory://".to_string();
        let config = Arc::new(config);

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let state = Arc::new(AppState::new(
            config.clone(),
            None,
            Stores::memory(store.clone()),
            gateway.clone(),
        ));

        Self {
            server: TestServer::new(create_app_router(state, metrics_handle())).unwrap(),
            store,
            gateway,
            sessions: SessionVerifier::new(&config.auth.session_secret),
        }
    }

    async fn user(&self, name: &str, role: UserRole) -> (Uuid, String) {
        let id = Uuid::new_v4();
        self.store
            .insert_user(User {
                id,
                name: Some(name.to_string()),
                username: Some(name.to_lowercase()),
                image: None,
                role,
            })
            .await;
        let token = self
            .sessions
            .issue(id, role, chrono::Duration::hours(1))
            .unwrap();
        (id, token)
    }

    async fn conversation(&self, token: &str, recipient: Uuid) -> Value {
        self.server
            .post("/api/conversations")
            .authorization_bearer(token)
            .json(&json!({ "recipientId": recipient }))
            .await
            .json()
    }

    async fn unread_count(&self, token: &str) -> i64 {
        let body: Value = self
            .server
            .get("/api/unread-count")
            .authorization_bearer(token)
            .await
            .json();
        body["unreadCount"].as_i64().unwrap()
    }
}

#[tokio::test]
async fn happy_path_chat() {
    let harness = Harness::new();
    let (buyer, buyer_token) = harness.user("Buyer", UserRole::Customer).await;
    let (vendor, vendor_token) = harness.user("Vendor", UserRole::Vendor).await;

    let created = harness
        .server
        .post("/api/conversations")
        .authorization_bearer(&buyer_token)
        .json(&json!({ "recipientId": vendor }))
        .await;
    created.assert_status(StatusCode::CREATED);
    let conversation: Value = created.json();
    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    // The reverse pair resolves to the same conversation.
    let reopened = harness
        .server
        .post("/api/conversations")
        .authorization_bearer(&vendor_token)
        .json(&json!({ "recipientId": buyer }))
        .await;
    reopened.assert_status_ok();
    assert_eq!(reopened.json::<Value>()["id"], conversation["id"]);

    let sent = harness
        .server
        .post("/api/messages/send")
        .authorization_bearer(&buyer_token)
        .json(&json!({ "conversationId": conversation_id, "content": "Is this still available?" }))
        .await;
    sent.assert_status_ok();
    let message: Value = sent.json();
    assert_eq!(message["senderId"], buyer.to_string());

    assert_eq!(harness.unread_count(&vendor_token).await, 1);
    assert_eq!(harness.unread_count(&buyer_token).await, 0);

    let marked = harness
        .server
        .post("/api/messages/mark-read")
        .authorization_bearer(&vendor_token)
        .json(&json!({ "conversationId": conversation_id, "messageIds": [message["id"]] }))
        .await;
    marked.assert_status_ok();
    assert_eq!(marked.json::<Value>()["success"], true);

    let history: Value = harness
        .server
        .get(&format!("/api/conversations/{conversation_id}/messages"))
        .authorization_bearer(&vendor_token)
        .await
        .json();
    let read_by = history[0]["readBy"].as_array().unwrap();
    assert!(read_by.contains(&json!(vendor.to_string())));

    assert_eq!(harness.unread_count(&vendor_token).await, 0);
    assert_eq!(harness.unread_count(&buyer_token).await, 0);

    let inbox: Value = harness
        .server
        .get("/api/conversations")
        .authorization_bearer(&vendor_token)
        .await
        .json();
    assert_eq!(inbox.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn outsiders_are_forbidden() {
    let harness = Harness::new();
    let (_, buyer_token) = harness.user("Buyer", UserRole::Customer).await;
    let (vendor, _) = harness.user("Vendor", UserRole::Vendor).await;
    let (_, outsider_token) = harness.user("Outsider", UserRole::Customer).await;

    let conversation = harness.conversation(&buyer_token, vendor).await;
    let conversation_id = conversation["id"].as_str().unwrap();

    harness
        .server
        .get(&format!("/api/conversations/{conversation_id}/messages"))
        .authorization_bearer(&outsider_token)
        .await
        .assert_status(StatusCode::FORBIDDEN);

    harness
        .server
        .post("/api/messages/send")
        .authorization_bearer(&outsider_token)
        .json(&json!({ "conversationId": conversation_id, "content": "hi" }))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    harness
        .server
        .get("/api/chat-token")
        .add_query_param("conversationId", conversation_id)
        .authorization_bearer(&outsider_token)
        .await
        .assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn request_validation() {
    let harness = Harness::new();
    let (buyer, buyer_token) = harness.user("Buyer", UserRole::Customer).await;

    harness
        .server
        .get("/api/conversations")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    harness
        .server
        .post("/api/conversations")
        .authorization_bearer(&buyer_token)
        .json(&json!({ "recipientId": buyer }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    harness
        .server
        .post("/api/conversations")
        .authorization_bearer(&buyer_token)
        .json(&json!({ "recipientId": Uuid::new_v4() }))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    harness
        .server
        .get("/api/chat-token")
        .authorization_bearer(&buyer_token)
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let problem: Value = harness
        .server
        .get("/api/chat-token")
        .add_query_param("conversationId", "nope")
        .authorization_bearer(&buyer_token)
        .await
        .json();
    assert_eq!(problem["code"], "invalid_argument");
}

fn assert_invalid_argument(response: &axum_test::TestResponse) {
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(
        response.header("content-type").to_str().unwrap(),
        "application/problem+json"
    );
    assert_eq!(response.json::<Value>()["code"], "invalid_argument");
}

#[tokio::test]
async fn malformed_bodies_are_invalid_arguments() {
    let harness = Harness::new();
    let (_, buyer_token) = harness.user("Buyer", UserRole::Customer).await;
    let (vendor, _) = harness.user("Vendor", UserRole::Vendor).await;
    let conversation = harness.conversation(&buyer_token, vendor).await;
    let conversation_id = conversation["id"].clone();

    let cases = [
        (
            "/api/messages/send",
            json!({ "conversationId": conversation_id, "content": 42 }),
        ),
        (
            "/api/messages/send",
            json!({ "conversationId": conversation_id, "content": " \n\t " }),
        ),
        (
            "/api/messages/mark-read",
            json!({ "conversationId": conversation_id, "messageIds": ["x"] }),
        ),
        (
            "/api/messages/mark-read",
            json!({ "conversationId": conversation_id, "messageIds": [] }),
        ),
        ("/api/conversations", json!({ "recipientId": "vendor" })),
        ("/api/payments/bkash/create", json!({})),
    ];
    for (path, body) in cases {
        let response = harness
            .server
            .post(path)
            .authorization_bearer(&buyer_token)
            .json(&body)
            .await;
        assert_invalid_argument(&response);
    }

    let history: Value = harness
        .server
        .get(&format!(
            "/api/conversations/{}/messages",
            conversation_id.as_str().unwrap()
        ))
        .authorization_bearer(&buyer_token)
        .await
        .json();
    assert!(history.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_realtime_bodies_are_invalid_arguments() {
    let harness = Harness::new();
    let (_, buyer_token) = harness.user("Buyer", UserRole::Customer).await;
    let (vendor, _) = harness.user("Vendor", UserRole::Vendor).await;
    let conversation = harness.conversation(&buyer_token, vendor).await;
    let conversation_id = conversation["id"].as_str().unwrap();

    let issued: Value = harness
        .server
        .get("/api/chat-token")
        .add_query_param("conversationId", conversation_id)
        .authorization_bearer(&buyer_token)
        .await
        .json();
    let chat_token = issued["token"].as_str().unwrap();
    let channel = format!("conversation:{conversation_id}");

    let response = harness
        .server
        .post(&format!("/api/realtime/{channel}/presence"))
        .authorization_bearer(chat_token)
        .json(&json!({ "action": "wave" }))
        .await;
    assert_invalid_argument(&response);

    let response = harness
        .server
        .post(&format!("/api/realtime/{channel}/publish"))
        .authorization_bearer(chat_token)
        .json(&json!({ "event": 7 }))
        .await;
    assert_invalid_argument(&response);
}

#[tokio::test]
async fn channel_tokens_gate_realtime_endpoints() {
    let harness = Harness::new();
    let (buyer, buyer_token) = harness.user("Buyer", UserRole::Customer).await;
    let (vendor, _) = harness.user("Vendor", UserRole::Vendor).await;

    let conversation = harness.conversation(&buyer_token, vendor).await;
    let channel = format!("conversation:{}", conversation["id"].as_str().unwrap());

    let issued: Value = harness
        .server
        .get("/api/chat-token")
        .add_query_param("conversationId", conversation["id"].as_str().unwrap())
        .authorization_bearer(&buyer_token)
        .await
        .json();
    let chat_token = issued["token"].as_str().unwrap().to_string();
    assert!(issued["capabilities"][&channel].is_array());

    let personal: Value = harness
        .server
        .get("/api/notification-token")
        .authorization_bearer(&buyer_token)
        .await
        .json();
    let personal_token = personal["token"].as_str().unwrap().to_string();

    // No token, a session token, and a token for other channels.
    harness
        .server
        .get(&format!("/api/realtime/{channel}/presence"))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    harness
        .server
        .get(&format!("/api/realtime/{channel}/presence"))
        .authorization_bearer(&buyer_token)
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    harness
        .server
        .get(&format!("/api/realtime/{channel}/stream"))
        .add_query_param("token", &personal_token)
        .await
        .assert_status(StatusCode::FORBIDDEN);

    harness
        .server
        .post(&format!("/api/realtime/{channel}/presence"))
        .add_query_param("token", &chat_token)
        .json(&json!({ "action": "enter" }))
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let members: Value = harness
        .server
        .get(&format!("/api/realtime/{channel}/presence"))
        .authorization_bearer(&chat_token)
        .await
        .json();
    assert_eq!(members["members"], json!([buyer.to_string()]));

    harness
        .server
        .post(&format!("/api/realtime/{channel}/publish"))
        .authorization_bearer(&chat_token)
        .json(&json!({ "event": "typing", "data": { "typing": true } }))
        .await
        .assert_status(StatusCode::ACCEPTED);

    harness
        .server
        .post(&format!("/api/realtime/{channel}/publish"))
        .authorization_bearer(&chat_token)
        .json(&json!({ "event": "message", "data": {} }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    harness
        .server
        .post(&format!("/api/realtime/user:{buyer}:inbox/publish"))
        .authorization_bearer(&personal_token)
        .json(&json!({ "event": "typing" }))
        .await
        .assert_status(StatusCode::FORBIDDEN);
}

fn pending_order(user_id: Uuid, product_id: Uuid, order_number: &str) -> Order {
    Order {
        id: Uuid::new_v4(),
        order_number: order_number.to_string(),
        user_id,
        status: OrderStatus::Pending,
        payment_status: PaymentStatus::Pending,
        total_amount: 120_000,
        metadata: json!({}),
        items: vec![OrderItem {
            product_id,
            quantity: 2,
        }],
    }
}

fn location(response: &axum_test::TestResponse) -> String {
    response
        .header("location")
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn redelivered_success_callback_settles_once() {
    let harness = Harness::new();
    let (buyer, buyer_token) = harness.user("Buyer", UserRole::Customer).await;
    let product = Uuid::new_v4();
    harness.store.set_stock(product, 10).await;
    harness.store.add_to_cart(buyer, product, 2).await;
    let order = pending_order(buyer, product, "ORD-2001");
    harness.store.insert_order(order.clone()).await;

    let checkout: Value = harness
        .server
        .post("/api/payments/bkash/create")
        .authorization_bearer(&buyer_token)
        .json(&json!({ "orderId": order.id }))
        .await
        .json();
    assert_eq!(checkout["paymentId"], "PAY-ORD-2001");

    for _ in 0..2 {
        let redirect = harness
            .server
            .get("/api/payments/bkash/callback")
            .add_query_param("paymentID", "PAY-ORD-2001")
            .add_query_param("status", "success")
            .await;
        redirect.assert_status(StatusCode::SEE_OTHER);
        let target = location(&redirect);
        assert!(target.starts_with("http://localhost:3000/checkout/success"));
        assert!(target.contains("orderNumber=ORD-2001"));
    }

    assert_eq!(harness.store.stock(product).await, Some(8));
    assert_eq!(harness.store.cart_len(buyer).await, 0);
    assert_eq!(harness.gateway.executions.load(Ordering::SeqCst), 2);

    let stored = harness.store.find_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Paid);

    let notifications: Value = harness
        .server
        .get("/api/notifications")
        .authorization_bearer(&buyer_token)
        .await
        .json();
    assert_eq!(notifications.as_array().unwrap().len(), 1);

    harness
        .server
        .post("/api/payments/bkash/create")
        .authorization_bearer(&buyer_token)
        .json(&json!({ "orderId": order.id }))
        .await
        .assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn failure_callback_retry_keeps_the_failure() {
    let harness = Harness::new();
    let (buyer, buyer_token) = harness.user("Buyer", UserRole::Customer).await;
    let order = pending_order(buyer, Uuid::new_v4(), "ORD-3001");
    harness.store.insert_order(order.clone()).await;

    harness
        .server
        .post("/api/payments/bkash/create")
        .authorization_bearer(&buyer_token)
        .json(&json!({ "orderId": order.id }))
        .await
        .assert_status_ok();

    let mut targets = Vec::new();
    for _ in 0..2 {
        let redirect = harness
            .server
            .get("/api/payments/bkash/callback")
            .add_query_param("paymentID", "PAY-ORD-3001")
            .add_query_param("status", "failure")
            .add_query_param("statusMessage", "Insufficient balance")
            .await;
        redirect.assert_status(StatusCode::SEE_OTHER);
        targets.push(location(&redirect));
    }

    assert_eq!(targets[0], targets[1]);
    assert!(targets[0].starts_with("http://localhost:3000/checkout/cancel"));
    assert!(targets[0].contains("reason=Insufficient+balance"));
    assert!(targets[0].contains("orderNumber=ORD-3001"));

    let stored = harness.store.find_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Failed);
    assert_eq!(stored.metadata["failureReason"], "Insufficient balance");
    assert_eq!(harness.gateway.executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn callback_without_reference_still_redirects() {
    let harness = Harness::new();

    let redirect = harness.server.get("/api/payments/bkash/callback").await;

    redirect.assert_status(StatusCode::SEE_OTHER);
    assert!(location(&redirect).contains("reason=Missing+payment+reference"));
}

#[tokio::test]
async fn notifications_are_scoped_to_their_recipient() {
    let harness = Harness::new();
    let (_, buyer_token) = harness.user("Buyer", UserRole::Customer).await;

    let read_all: Value = harness
        .server
        .post("/api/notifications/read-all")
        .authorization_bearer(&buyer_token)
        .await
        .json();
    assert_eq!(read_all["updated"], 0);

    harness
        .server
        .post(&format!("/api/notifications/{}/read", Uuid::new_v4()))
        .authorization_bearer(&buyer_token)
        .await
        .assert_status(StatusCode::NOT_FOUND);

    harness
        .server
        .delete(&format!("/api/notifications/{}", Uuid::new_v4()))
        .authorization_bearer(&buyer_token)
        .await
        .assert_status(StatusCode::NOT_FOUND);
}
