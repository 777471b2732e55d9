use std::{sync::Arc, time::Duration};

use shared::config::server::Config;

use crate::{
    auth::channel_token::TokenIssuer,
    db::{ChatStore, NotificationStore, OrderStore, memory::MemoryStore, postgres::PgStore},
    realtime::{ChannelHub, SharedHub, Transport},
    services::{
        ConversationService, MessageService, NotificationService, PaymentService,
        ReadStateService, TokenService, payment::PaymentGateway,
    },
};

/// The three persistence seams, backed by one implementation.
#[derive(Clone)]
pub struct Stores {
    pub chat: Arc<dyn ChatStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub orders: Arc<dyn OrderStore>,
}

impl Stores {
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            chat: store.clone(),
            notifications: store.clone(),
            orders: store,
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            chat: store.clone(),
            notifications: store.clone(),
            orders: store,
        }
    }
}

/// Services, stores and the realtime hub handed to every handler.
///
/// Services publish through the same hub the stream endpoints subscribe to.
#[derive(Clone)]
pub struct AppState {
    pub(crate) pool: Option<sqlx::PgPool>,
    pub(crate) config: Arc<Config>,
    pub(crate) hub: SharedHub,
    pub(crate) conversations: ConversationService,
    pub(crate) messages: MessageService,
    pub(crate) read_state: ReadStateService,
    pub(crate) tokens: TokenService,
    pub(crate) notifications: NotificationService,
    pub(crate) payments: PaymentService,
}

impl AppState {
    /// Wires every service onto the given stores, hub and payment gateway.
    pub fn new(
        config: Arc<Config>,
        pool: Option<sqlx::PgPool>,
        stores: Stores,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let realtime = &config.realtime;
        let hub: SharedHub = Arc::new(ChannelHub::new(
            realtime.channel_capacity,
            realtime.history_limit,
            Duration::from_secs(realtime.presence_ttl_seconds),
        ));
        let transport: Arc<dyn Transport> = hub.clone();
        let issuer = Arc::new(TokenIssuer::new(
            &realtime.token_secret,
            Duration::from_secs(realtime.token_ttl_seconds),
        ));

        let notifications = NotificationService::new(stores.notifications, transport.clone());
        let payments = PaymentService::new(
            stores.orders,
            gateway,
            notifications.clone(),
            &config.payments,
        );

        Self {
            pool,
            conversations: ConversationService::new(stores.chat.clone()),
            messages: MessageService::new(
                stores.chat.clone(),
                transport.clone(),
                config.chat.max_message_chars,
            ),
            read_state: ReadStateService::new(stores.chat.clone(), transport),
            tokens: TokenService::new(issuer, stores.chat),
            notifications,
            payments,
            hub,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &SharedHub {
        &self.hub
    }
}
