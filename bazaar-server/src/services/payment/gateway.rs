//! bKash tokenized checkout client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, instrument};

use shared::config::server::PaymentsConfig;

const SUCCESS_CODE: &str = "0000";
const COMPLETED: &str = "Completed";
/// Renew the grant token this long before bKash would expire it.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway is not configured")]
    NotConfigured,
    #[error("payment gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("payment gateway rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("payment gateway response is missing {0}")]
    MissingField(&'static str),
}

/// Input for a checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub payer_reference: String,
    /// Decimal amount in BDT, e.g. `"500.00"`.
    pub amount: String,
    pub invoice_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub payment_id: String,
    pub bkash_url: String,
}

/// Transaction state as reported by `execute` or `payment/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentReport {
    pub payment_id: String,
    pub transaction_status: Option<String>,
    pub trx_id: Option<String>,
    pub status_message: Option<String>,
}

impl PaymentReport {
    /// The provider's transaction id when the payment is completed.
    #[must_use]
    pub fn completed_trx_id(&self) -> Option<&str> {
        if self.transaction_status.as_deref() == Some(COMPLETED) {
            self.trx_id.as_deref().filter(|id| !id.is_empty())
        } else {
            None
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, request: CheckoutRequest)
    -> Result<CheckoutSession, GatewayError>;

    async fn execute_payment(&self, payment_id: String) -> Result<PaymentReport, GatewayError>;

    async fn query_payment(&self, payment_id: String) -> Result<PaymentReport, GatewayError>;
}

#[derive(Debug)]
struct GrantToken {
    id_token: String,
    renew_at: Instant,
}

/// HTTP client for the tokenized checkout API. The grant token is shared
/// across requests and renewed shortly before it expires.
#[derive(Debug)]
pub struct BkashGateway {
    http: reqwest::Client,
    config: PaymentsConfig,
    token: Mutex<Option<GrantToken>>,
}

#[derive(Serialize)]
struct GrantBody<'a> {
    app_key: &'a str,
    app_secret: &'a str,
}

#[derive(Deserialize)]
struct GrantResponse {
    id_token: Option<String>,
    expires_in: Option<u64>,
    #[serde(rename = "statusCode")]
    status_code: Option<String>,
    #[serde(rename = "statusMessage")]
    status_message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    mode: &'static str,
    payer_reference: &'a str,
    #[serde(rename = "callbackURL")]
    callback_url: &'a str,
    amount: &'a str,
    currency: &'static str,
    intent: &'static str,
    merchant_invoice_number: &'a str,
}

#[derive(Serialize)]
struct PaymentIdBody<'a> {
    #[serde(rename = "paymentID")]
    payment_id: &'a str,
}

#[derive(Deserialize)]
struct ProviderResponse {
    #[serde(rename = "paymentID")]
    payment_id: Option<String>,
    #[serde(rename = "bkashURL")]
    bkash_url: Option<String>,
    #[serde(rename = "transactionStatus")]
    transaction_status: Option<String>,
    #[serde(rename = "trxID")]
    trx_id: Option<String>,
    #[serde(rename = "statusCode")]
    status_code: Option<String>,
    #[serde(rename = "statusMessage")]
    status_message: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

impl ProviderResponse {
    fn check(self) -> Result<Self, GatewayError> {
        if let Some(code) = self.error_code.clone() {
            return Err(GatewayError::Rejected {
                code,
                message: self.error_message.clone().unwrap_or_default(),
            });
        }
        match self.status_code.as_deref() {
            None | Some(SUCCESS_CODE) => Ok(self),
            Some(code) => Err(GatewayError::Rejected {
                code: code.to_string(),
                message: self.status_message.clone().unwrap_or_default(),
            }),
        }
    }

    fn into_report(self, payment_id: &str) -> PaymentReport {
        PaymentReport {
            payment_id: self.payment_id.unwrap_or_else(|| payment_id.to_string()),
            transaction_status: self.transaction_status,
            trx_id: self.trx_id,
            status_message: self.status_message,
        }
    }
}

impl BkashGateway {
    pub fn new(config: PaymentsConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.bkash_base_url.trim_end_matches('/'))
    }

    fn is_configured(&self) -> bool {
        !self.config.app_key.is_empty() && !self.config.app_secret.is_empty()
    }

    /// Returns a valid grant token, requesting a new one when needed.
    async fn id_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| Instant::now() < token.renew_at) {
            return Ok(token.id_token.clone());
        }

        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        debug!("requesting bKash grant token");
        let response: GrantResponse = self
            .http
            .post(self.url("token/grant"))
            .header("username", &self.config.username)
            .header("password", &self.config.password)
            .json(&GrantBody {
                app_key: &self.config.app_key,
                app_secret: &self.config.app_secret,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(code) = response.status_code.filter(|code| code != SUCCESS_CODE) {
            return Err(GatewayError::Rejected {
                code,
                message: response.status_message.unwrap_or_default(),
            });
        }
        let id_token = response.id_token.ok_or(GatewayError::MissingField("id_token"))?;
        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(3600));

        *cached = Some(GrantToken {
            id_token: id_token.clone(),
            renew_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        info!(expires_in = lifetime.as_secs(), "bKash grant token refreshed");
        Ok(id_token)
    }

    async fn call<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        let id_token = self.id_token().await?;
        let response = self
            .http
            .post(self.url(path))
            .header(reqwest::header::AUTHORIZATION, id_token)
            .header("X-APP-Key", &self.config.app_key)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl PaymentGateway for BkashGateway {
    #[instrument(name = "bkash.create", skip(self), err)]
    async fn create_payment(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let response: ProviderResponse = self
            .call(
                "create",
                &CreateBody {
                    mode: "0011",
                    payer_reference: &request.payer_reference,
                    callback_url: &self.config.callback_url,
                    amount: &request.amount,
                    currency: "BDT",
                    intent: "sale",
                    merchant_invoice_number: &request.invoice_number,
                },
            )
            .await?;
        let response = response.check()?;

        Ok(CheckoutSession {
            payment_id: response
                .payment_id
                .ok_or(GatewayError::MissingField("paymentID"))?,
            bkash_url: response
                .bkash_url
                .ok_or(GatewayError::MissingField("bkashURL"))?,
        })
    }

    #[instrument(name = "bkash.execute", skip(self), err)]
    async fn execute_payment(&self, payment_id: String) -> Result<PaymentReport, GatewayError> {
        let response: ProviderResponse = self
            .call("execute", &PaymentIdBody { payment_id: &payment_id })
            .await?;
        Ok(response.check()?.into_report(&payment_id))
    }

    #[instrument(name = "bkash.query", skip(self), err)]
    async fn query_payment(&self, payment_id: String) -> Result<PaymentReport, GatewayError> {
        let response: ProviderResponse = self
            .call("payment/status", &PaymentIdBody { payment_id: &payment_id })
            .await?;
        Ok(response.check()?.into_report(&payment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::State, http::HeaderMap, routing::post};
    use serde_json::{Value, json};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Clone, Default)]
    struct Fake {
        grants: Arc<AtomicUsize>,
    }

    async fn grant(State(fake): State<Fake>, headers: HeaderMap) -> Json<Value> {
        assert_eq!(headers["username"], "merchant");
        fake.grants.fetch_add(1, Ordering::SeqCst);
        Json(json!({ "id_token": "grant-token", "expires_in": 3600, "statusCode": "0000" }))
    }

    async fn create(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(headers["authorization"], "grant-token");
        assert_eq!(headers["x-app-key"], "app-key");
        assert_eq!(body["mode"], "0011");
        assert_eq!(body["currency"], "BDT");
        Json(json!({
            "paymentID": format!("PAY-{}", body["merchantInvoiceNumber"].as_str().unwrap()),
            "bkashURL": "https://sandbox.bka.sh/checkout",
            "statusCode": "0000"
        }))
    }

    async fn execute(Json(body): Json<Value>) -> Json<Value> {
        if body["paymentID"] == "PAY-bad" {
            Json(json!({ "statusCode": "2056", "statusMessage": "Invalid Payment State" }))
        } else {
            Json(json!({
                "paymentID": body["paymentID"],
                "transactionStatus": "Completed",
                "trxID": "TRX123",
                "statusCode": "0000"
            }))
        }
    }

    async fn gateway() -> (BkashGateway, Fake) {
        let fake = Fake::default();
        let app = Router::new()
            .route("/token/grant", post(grant))
            .route("/create", post(create))
            .route("/execute", post(execute))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = PaymentsConfig {
            bkash_base_url: format!("http://{address}/"),
            app_key: "app-key".into(),
            app_secret: "app-secret".into(),
            username: "merchant".into(),
            password: "secret".into(),
            ..PaymentsConfig::default()
        };
        (BkashGateway::new(config).unwrap(), fake)
    }

    fn checkout(invoice: &str) -> CheckoutRequest {
        CheckoutRequest {
            payer_reference: "buyer".into(),
            amount: "500.00".into(),
            invoice_number: invoice.into(),
        }
    }

    #[tokio::test]
    async fn grant_token_is_reused_across_calls() {
        let (gateway, fake) = gateway().await;

        let first = gateway.create_payment(checkout("ORD-1")).await.unwrap();
        let second = gateway.create_payment(checkout("ORD-2")).await.unwrap();

        assert_eq!(first.payment_id, "PAY-ORD-1");
        assert_eq!(second.payment_id, "PAY-ORD-2");
        assert_eq!(fake.grants.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execute_reports_completed_transactions() {
        let (gateway, _) = gateway().await;
        let report = gateway.execute_payment("PAY-1".into()).await.unwrap();
        assert_eq!(report.completed_trx_id(), Some("TRX123"));
    }

    #[tokio::test]
    async fn provider_status_codes_become_rejections() {
        let (gateway, _) = gateway().await;
        let err = gateway.execute_payment("PAY-bad".into()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { code, .. } if code == "2056"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_any_request() {
        let gateway = BkashGateway::new(PaymentsConfig::default()).unwrap();
        let err = gateway.create_payment(checkout("ORD-1")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConfigured));
    }

    #[test]
    fn only_completed_reports_carry_a_transaction() {
        let pending = PaymentReport {
            payment_id: "PAY".into(),
            transaction_status: Some("Initiated".into()),
            trx_id: Some("TRX".into()),
            status_message: None,
        };
        assert_eq!(pending.completed_trx_id(), None);
    }
}
