//! Fixtures shared by the unit tests.

use std::sync::Arc;

use serde_json::json;
use shared::{
    config::server::Config,
    models::{Order, OrderItem, OrderStatus, PaymentStatus, User, UserRole},
};
use uuid::Uuid;

use crate::{
    app_state::{AppState, Stores},
    db::memory::MemoryStore,
    services::payment::gateway::MockPaymentGateway,
};

pub fn user(name: &str, role: UserRole) -> User {
    User {
        id: Uuid::new_v4(),
        name: Some(name.to_string()),
        username: Some(name.to_lowercase()),
        image: None,
        role,
    }
}

pub async fn seed_user(store: &MemoryStore, name: &str, role: UserRole) -> Uuid {
    let user = user(name, role);
    let id = user.id;
    store.insert_user(user).await;
    id
}

/// A buyer and a vendor in a fresh store.
pub async fn buyer_and_vendor() -> (Arc<MemoryStore>, Uuid, Uuid) {
    let store = Arc::new(MemoryStore::new());
    let buyer = seed_user(&store, "Buyer", UserRole::Customer).await;
    let vendor = seed_user(&store, "Vendor", UserRole::Vendor).await;
    (store, buyer, vendor)
}

/// A pending order for two units of `product_id`.
pub fn pending_order(user_id: Uuid, product_id: Uuid) -> Order {
    Order {
        id: Uuid::new_v4(),
        order_number: "ORD-1001".into(),
        user_id,
        status: OrderStatus::Pending,
        payment_status: PaymentStatus::Pending,
        total_amount: 50_000,
        metadata: json!({}),
        items: vec![OrderItem {
            product_id,
            quantity: 2,
        }],
    }
}

/// Application state over `store` with a gateway that must not be called.
pub fn memory_state(store: Arc<MemoryStore>) -> Arc<AppState> {
    let mut config = Config::default();
    config.db.url = "memory://".to_string();
    Arc::new(AppState::new(
        Arc::new(config),
        None,
        Stores::memory(store),
        Arc::new(MockPaymentGateway::new()),
    ))
}
