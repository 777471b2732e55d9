use std::{fmt, sync::Arc};

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use shared::{
    config::server::PaymentsConfig,
    models::{
        CreatePaymentResponse, NewNotification, NotificationKind, Order, PaymentCallbackQuery,
        PaymentStatus, order::format_amount,
    },
};

use crate::{
    db::{OrderStore, PaymentConfirmation, PaymentFailure, PaymentTransition},
    services::{
        error::{ServiceError, ServiceResult},
        notification_service::NotificationService,
    },
};

use super::gateway::{CheckoutRequest, GatewayError, PaymentGateway};

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}

/// Where a provider callback ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Paid {
        order_number: String,
    },
    Failed {
        reason: String,
        order_number: Option<String>,
    },
}

#[derive(Clone)]
pub struct PaymentService {
    orders: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: NotificationService,
    success_url: String,
    cancel_url: String,
}

impl fmt::Debug for PaymentService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentService")
            .field("success_url", &self.success_url)
            .field("cancel_url", &self.cancel_url)
            .finish_non_exhaustive()
    }
}

impl PaymentService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifications: NotificationService,
        config: &PaymentsConfig,
    ) -> Self {
        Self {
            orders,
            gateway,
            notifications,
            success_url: config.success_url.clone(),
            cancel_url: config.cancel_url.clone(),
        }
    }

    /// Opens a checkout session for an unpaid order owned by `user_id`.
    #[instrument(name = "payments.create", skip(self), err)]
    pub async fn create_payment(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> ServiceResult<CreatePaymentResponse> {
        let order = self
            .orders
            .find_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("order"))?;

        if order.user_id != user_id {
            return Err(ServiceError::forbidden("order belongs to another user"));
        }
        if !order.payment_status.can_transition_to_paid() {
            return Err(ServiceError::Conflict(format!(
                "order {} is already {}",
                order.order_number,
                order.payment_status.as_str()
            )));
        }

        let session = self
            .gateway
            .create_payment(CheckoutRequest {
                payer_reference: user_id.to_string(),
                amount: format_amount(order.total_amount),
                invoice_number: order.order_number.clone(),
            })
            .await
            .inspect_err(|_| {
                metrics::counter!("bazaar_payments_total", "outcome" => "create_failed")
                    .increment(1);
            })?;

        self.orders
            .record_payment_created(order.id, session.payment_id.clone(), Utc::now())
            .await?;
        metrics::counter!("bazaar_payments_total", "outcome" => "created").increment(1);
        info!(order_number = %order.order_number, payment_id = %session.payment_id, "payment created");

        Ok(CreatePaymentResponse {
            payment_id: session.payment_id,
            bkash_url: session.bkash_url,
        })
    }

    /// Reconciles a provider redirect. Never fails: every problem becomes a
    /// [`CallbackOutcome::Failed`] with a reason for the customer.
    #[instrument(name = "payments.callback", skip(self))]
    pub async fn handle_callback(&self, query: PaymentCallbackQuery) -> CallbackOutcome {
        let Some(payment_id) = query.payment_id.filter(|id| !id.trim().is_empty()) else {
            return self.record(CallbackOutcome::Failed {
                reason: "Missing payment reference".to_string(),
                order_number: None,
            });
        };
        let status = query.status.unwrap_or_default();

        if status != "success" {
            let reason = query
                .status_message
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| match status.as_str() {
                    "" => "Payment failed".to_string(),
                    other => format!("Payment {other}"),
                });
            let outcome = self.fail(&payment_id, &status, reason).await;
            return self.record(outcome);
        }

        let outcome = match self.confirm_with_provider(&payment_id).await {
            Ok((trx_id, executed_via)) => self.settle(&payment_id, trx_id, executed_via).await,
            Err(reason) => self.fail(&payment_id, &status, reason).await,
        };
        self.record(outcome)
    }

    /// Redirect target for an outcome.
    #[must_use]
    pub fn redirect_for(&self, outcome: &CallbackOutcome) -> String {
        let (base, pairs): (&str, Vec<(&str, &str)>) = match outcome {
            CallbackOutcome::Paid { order_number } => {
                (self.success_url.as_str(), vec![("orderNumber", order_number.as_str())])
            }
            CallbackOutcome::Failed {
                reason,
                order_number,
            } => {
                let mut pairs = vec![("reason", reason.as_str())];
                if let Some(number) = order_number {
                    pairs.push(("orderNumber", number.as_str()));
                }
                (self.cancel_url.as_str(), pairs)
            }
        };

        match Url::parse(base) {
            Ok(mut url) => {
                url.query_pairs_mut().extend_pairs(pairs);
                url.into()
            }
            Err(err) => {
                warn!(%base, error = %err, "invalid redirect base url");
                base.to_string()
            }
        }
    }

    fn record(&self, outcome: CallbackOutcome) -> CallbackOutcome {
        let label = match &outcome {
            CallbackOutcome::Paid { .. } => "paid",
            CallbackOutcome::Failed { .. } => "failed",
        };
        metrics::counter!("bazaar_payments_total", "outcome" => label).increment(1);
        outcome
    }

    /// Executes the payment, falling back to a status query when execute is
    /// inconclusive. Returns the transaction id and which call confirmed it.
    async fn confirm_with_provider(
        &self,
        payment_id: &str,
    ) -> Result<(String, &'static str), String> {
        match self.gateway.execute_payment(payment_id.to_string()).await {
            Ok(report) => {
                if let Some(trx_id) = report.completed_trx_id() {
                    return Ok((trx_id.to_string(), "execute"));
                }
                info!(payment_id, status = ?report.transaction_status, "execute inconclusive, querying");
            }
            Err(err) => warn!(payment_id, error = %err, "execute failed, querying"),
        }

        match self.gateway.query_payment(payment_id.to_string()).await {
            Ok(report) => match report.completed_trx_id() {
                Some(trx_id) => Ok((trx_id.to_string(), "query")),
                None => Err(report
                    .status_message
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| "Payment was not completed".to_string())),
            },
            Err(err) => {
                warn!(payment_id, error = %err, "payment status query failed");
                Err("Payment could not be verified".to_string())
            }
        }
    }

    async fn order_for(&self, payment_id: &str) -> Option<Order> {
        match self.orders.find_order_by_payment_id(payment_id.to_string()).await {
            Ok(order) => order,
            Err(err) => {
                warn!(payment_id, error = %err, "order lookup failed");
                None
            }
        }
    }

    async fn settle(&self, payment_id: &str, trx_id: String, executed_via: &'static str) -> CallbackOutcome {
        let order = match self
            .orders
            .find_order_by_payment_id(payment_id.to_string())
            .await
        {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(payment_id, %trx_id, "confirmed payment has no matching order");
                return CallbackOutcome::Failed {
                    reason: "Order not found for payment".to_string(),
                    order_number: None,
                };
            }
            Err(err) => {
                metrics::counter!("bazaar_payments_unreconciled_total").increment(1);
                error!(
                    payment_id,
                    %trx_id,
                    error = %err,
                    "order lookup failed for a confirmed payment; needs manual reconciliation"
                );
                return CallbackOutcome::Failed {
                    reason: "Payment could not be matched to an order".to_string(),
                    order_number: None,
                };
            }
        };

        let confirmation = PaymentConfirmation {
            trx_id: trx_id.clone(),
            executed_via,
            paid_at: Utc::now(),
        };
        match self.orders.mark_payment_succeeded(order.id, confirmation).await {
            Ok(PaymentTransition::Applied(paid)) => {
                info!(order_number = %paid.order_number, %trx_id, "order paid");
                let notification = NewNotification {
                    recipient_id: paid.user_id,
                    kind: NotificationKind::Payment,
                    title: "Payment received".to_string(),
                    body: format!(
                        "We received {} BDT for order {}.",
                        format_amount(paid.total_amount),
                        paid.order_number
                    ),
                    payload: json!({
                        "orderId": paid.id,
                        "orderNumber": paid.order_number,
                        "trxID": trx_id,
                    }),
                };
                if let Err(err) = self.notifications.create(notification).await {
                    warn!(order_number = %paid.order_number, error = %err, "payment notification failed");
                }
                CallbackOutcome::Paid {
                    order_number: paid.order_number,
                }
            }
            Ok(PaymentTransition::AlreadyPaid(paid)) => {
                info!(order_number = %paid.order_number, "duplicate success callback ignored");
                CallbackOutcome::Paid {
                    order_number: paid.order_number,
                }
            }
            Err(err) => {
                metrics::counter!("bazaar_payments_unreconciled_total").increment(1);
                error!(
                    payment_id,
                    %trx_id,
                    order_number = %order.order_number,
                    error = %err,
                    "failed to apply a confirmed payment; needs manual reconciliation"
                );
                CallbackOutcome::Failed {
                    reason: "Payment could not be applied".to_string(),
                    order_number: Some(order.order_number),
                }
            }
        }
    }

    async fn fail(&self, payment_id: &str, callback_status: &str, reason: String) -> CallbackOutcome {
        let Some(order) = self.order_for(payment_id).await else {
            return CallbackOutcome::Failed {
                reason,
                order_number: None,
            };
        };

        if order.payment_status == PaymentStatus::Paid {
            info!(order_number = %order.order_number, "late failure callback for a paid order");
            return CallbackOutcome::Paid {
                order_number: order.order_number,
            };
        }

        let failure = PaymentFailure {
            reason: reason.clone(),
            callback_status: callback_status.to_string(),
            failed_at: Utc::now(),
        };
        match self.orders.mark_payment_failed(order.id, failure).await {
            Ok(true) => info!(order_number = %order.order_number, %reason, "payment failed"),
            Ok(false) => {
                return CallbackOutcome::Paid {
                    order_number: order.order_number,
                };
            }
            Err(err) => warn!(order_number = %order.order_number, error = %err, "failed to record payment failure"),
        }

        CallbackOutcome::Failed {
            reason,
            order_number: Some(order.order_number),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{MockOrderStore, NotificationStore, StoreError, memory::MemoryStore},
        realtime::ChannelHub,
        services::payment::gateway::{CheckoutSession, MockPaymentGateway, PaymentReport},
        test_support::pending_order,
    };
    use mockall::predicate::eq;
    use shared::models::{
        OrderStatus,
        order::{FAILURE_REASON_KEY, PAYMENT_ID_KEY, TRX_ID_KEY},
    };
    use std::time::Duration;

    fn completed(payment_id: &str) -> PaymentReport {
        PaymentReport {
            payment_id: payment_id.into(),
            transaction_status: Some("Completed".into()),
            trx_id: Some("TRX42".into()),
            status_message: None,
        }
    }

    fn service(store: Arc<MemoryStore>, gateway: MockPaymentGateway) -> PaymentService {
        let hub = Arc::new(ChannelHub::new(8, 8, Duration::from_secs(60)));
        PaymentService::new(
            store.clone(),
            Arc::new(gateway),
            NotificationService::new(store, hub),
            &PaymentsConfig::default(),
        )
    }

    async fn order_with_payment(store: &MemoryStore, payment_id: &str) -> (Order, Uuid) {
        let product = Uuid::new_v4();
        let buyer = Uuid::new_v4();
        let order = pending_order(buyer, product);
        store.insert_order(order.clone()).await;
        store.set_stock(product, 10).await;
        store.add_to_cart(buyer, product, 2).await;
        store
            .record_payment_created(order.id, payment_id.into(), Utc::now())
            .await
            .unwrap();
        (order, product)
    }

    fn callback(payment_id: &str, status: &str) -> PaymentCallbackQuery {
        PaymentCallbackQuery {
            payment_id: Some(payment_id.into()),
            status: Some(status.into()),
            status_message: None,
        }
    }

    #[tokio::test]
    async fn redelivered_success_applies_once() {
        let store = Arc::new(MemoryStore::new());
        let (order, product) = order_with_payment(&store, "PAY-1").await;
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_execute_payment()
            .with(eq("PAY-1".to_string()))
            .times(2)
            .returning(|id| Ok(completed(&id)));
        let payments = service(store.clone(), gateway);

        for _ in 0..2 {
            let outcome = payments.handle_callback(callback("PAY-1", "success")).await;
            assert_eq!(
                outcome,
                CallbackOutcome::Paid {
                    order_number: order.order_number.clone()
                }
            );
        }

        let paid = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Paid);
        assert_eq!(paid.status, OrderStatus::Processing);
        assert_eq!(paid.metadata[TRX_ID_KEY], "TRX42");
        assert_eq!(store.stock(product).await, Some(8));
        assert_eq!(store.cart_len(order.user_id).await, 0);
        assert_eq!(store.list_notifications(order.user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inconclusive_execute_falls_back_to_query() {
        let store = Arc::new(MemoryStore::new());
        let (order, _) = order_with_payment(&store, "PAY-2").await;
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_execute_payment()
            .returning(|_| Err(GatewayError::MissingField("trxID")));
        gateway
            .expect_query_payment()
            .times(1)
            .returning(|id| Ok(completed(&id)));
        let payments = service(store.clone(), gateway);

        payments.handle_callback(callback("PAY-2", "success")).await;

        let paid = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(paid.metadata["executedVia"], "query");
    }

    #[tokio::test]
    async fn unconfirmed_success_is_treated_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let (order, product) = order_with_payment(&store, "PAY-3").await;
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_execute_payment().returning(|id| {
            Ok(PaymentReport {
                payment_id: id,
                transaction_status: Some("Initiated".into()),
                ..PaymentReport::default()
            })
        });
        gateway.expect_query_payment().returning(|id| {
            Ok(PaymentReport {
                payment_id: id,
                transaction_status: Some("Initiated".into()),
                status_message: Some("Insufficient balance".into()),
                ..PaymentReport::default()
            })
        });
        let payments = service(store.clone(), gateway);

        let outcome = payments.handle_callback(callback("PAY-3", "success")).await;
        assert!(matches!(outcome, CallbackOutcome::Failed { ref reason, .. } if reason == "Insufficient balance"));

        let failed = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(failed.payment_status, PaymentStatus::Failed);
        assert_eq!(store.stock(product).await, Some(10));
    }

    #[tokio::test]
    async fn repeated_failure_callbacks_keep_the_same_terminal_state() {
        let store = Arc::new(MemoryStore::new());
        let (order, _) = order_with_payment(&store, "PAY-4").await;
        let payments = service(store.clone(), MockPaymentGateway::new());
        let query = PaymentCallbackQuery {
            status_message: Some("Cancelled by customer".into()),
            ..callback("PAY-4", "cancel")
        };

        for _ in 0..2 {
            let outcome = payments.handle_callback(query.clone()).await;
            assert_eq!(
                outcome,
                CallbackOutcome::Failed {
                    reason: "Cancelled by customer".into(),
                    order_number: Some(order.order_number.clone()),
                }
            );
        }

        let failed = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(failed.payment_status, PaymentStatus::Failed);
        assert_eq!(failed.metadata[FAILURE_REASON_KEY], "Cancelled by customer");
        assert_eq!(failed.metadata["callbackStatus"], "cancel");
    }

    #[tokio::test]
    async fn late_failure_never_downgrades_a_paid_order() {
        let store = Arc::new(MemoryStore::new());
        let (order, _) = order_with_payment(&store, "PAY-5").await;
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_execute_payment()
            .returning(|id| Ok(completed(&id)));
        let payments = service(store.clone(), gateway);

        payments.handle_callback(callback("PAY-5", "success")).await;
        let outcome = payments.handle_callback(callback("PAY-5", "failure")).await;

        assert!(matches!(outcome, CallbackOutcome::Paid { .. }));
        let paid = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn missing_payment_id_redirects_to_cancel_with_reason() {
        let payments = service(Arc::new(MemoryStore::new()), MockPaymentGateway::new());
        let outcome = payments
            .handle_callback(PaymentCallbackQuery::default())
            .await;

        let redirect = payments.redirect_for(&outcome);
        assert!(redirect.starts_with(&PaymentsConfig::default().cancel_url));
        assert!(redirect.contains("reason=Missing+payment+reference"));
    }

    #[tokio::test]
    async fn success_redirect_carries_the_order_number() {
        let payments = service(Arc::new(MemoryStore::new()), MockPaymentGateway::new());
        let redirect = payments.redirect_for(&CallbackOutcome::Paid {
            order_number: "ORD-7".into(),
        });
        assert_eq!(
            redirect,
            format!("{}?orderNumber=ORD-7", PaymentsConfig::default().success_url)
        );
    }

    #[tokio::test]
    async fn create_payment_checks_ownership_and_state() {
        let store = Arc::new(MemoryStore::new());
        let buyer = Uuid::new_v4();
        let order = pending_order(buyer, Uuid::new_v4());
        store.insert_order(order.clone()).await;
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_payment()
            .withf(|request| request.amount == "500.00" && request.invoice_number == "ORD-1001")
            .times(1)
            .returning(|_| {
                Ok(CheckoutSession {
                    payment_id: "PAY-9".into(),
                    bkash_url: "https://sandbox.bka.sh/pay".into(),
                })
            });
        let payments = service(store.clone(), gateway);

        let err = payments
            .create_payment(Uuid::new_v4(), order.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let created = payments.create_payment(buyer, order.id).await.unwrap();
        assert_eq!(created.payment_id, "PAY-9");
        let stored = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.metadata[PAYMENT_ID_KEY], "PAY-9");

        let err = payments
            .create_payment(buyer, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn paid_orders_cannot_be_paid_again() {
        let store = Arc::new(MemoryStore::new());
        let buyer = Uuid::new_v4();
        let mut order = pending_order(buyer, Uuid::new_v4());
        order.payment_status = PaymentStatus::Paid;
        store.insert_order(order.clone()).await;
        let payments = service(store, MockPaymentGateway::new());

        let err = payments.create_payment(buyer, order.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn provider_outage_is_upstream_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let buyer = Uuid::new_v4();
        let order = pending_order(buyer, Uuid::new_v4());
        store.insert_order(order.clone()).await;
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_payment()
            .returning(|_| Err(GatewayError::NotConfigured));
        let payments = service(store, gateway);

        let err = payments.create_payment(buyer, order.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::UpstreamUnavailable(_)));
    }

    fn service_over(orders: MockOrderStore, gateway: MockPaymentGateway) -> PaymentService {
        let hub = Arc::new(ChannelHub::new(8, 8, Duration::from_secs(60)));
        PaymentService::new(
            Arc::new(orders),
            Arc::new(gateway),
            NotificationService::new(Arc::new(MemoryStore::new()), hub),
            &PaymentsConfig::default(),
        )
    }

    fn executes_once() -> MockPaymentGateway {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_execute_payment()
            .times(1)
            .returning(|id| Ok(completed(&id)));
        gateway
    }

    #[tokio::test]
    async fn lookup_failure_after_confirmation_is_not_a_missing_order() {
        let mut orders = MockOrderStore::new();
        orders
            .expect_find_order_by_payment_id()
            .with(eq("PAY-9".to_string()))
            .times(1)
            .returning(|_| Err(StoreError::Database(sqlx::Error::PoolTimedOut)));
        orders.expect_mark_payment_succeeded().never();
        let payments = service_over(orders, executes_once());

        let outcome = payments.handle_callback(callback("PAY-9", "success")).await;

        assert_eq!(
            outcome,
            CallbackOutcome::Failed {
                reason: "Payment could not be matched to an order".into(),
                order_number: None,
            }
        );
    }

    #[tokio::test]
    async fn confirmed_payment_without_order_reports_not_found() {
        let mut orders = MockOrderStore::new();
        orders
            .expect_find_order_by_payment_id()
            .times(1)
            .returning(|_| Ok(None));
        let payments = service_over(orders, executes_once());

        let outcome = payments.handle_callback(callback("PAY-10", "success")).await;

        assert_eq!(
            outcome,
            CallbackOutcome::Failed {
                reason: "Order not found for payment".into(),
                order_number: None,
            }
        );
    }

    #[tokio::test]
    async fn transition_errors_keep_the_order_number() {
        let order = pending_order(Uuid::new_v4(), Uuid::new_v4());
        let found = order.clone();
        let mut orders = MockOrderStore::new();
        orders
            .expect_find_order_by_payment_id()
            .returning(move |_| Ok(Some(found.clone())));
        orders
            .expect_mark_payment_succeeded()
            .withf(move |order_id, confirmation| {
                *order_id == order.id && confirmation.trx_id == "TRX42"
            })
            .times(1)
            .returning(|_, _| Err(StoreError::Database(sqlx::Error::PoolTimedOut)));
        let payments = service_over(orders, executes_once());

        let outcome = payments.handle_callback(callback("PAY-11", "success")).await;

        assert_eq!(
            outcome,
            CallbackOutcome::Failed {
                reason: "Payment could not be applied".into(),
                order_number: Some("ORD-1001".into()),
            }
        );
    }
}
