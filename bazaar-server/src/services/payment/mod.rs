//! bKash checkout and callback reconciliation.

pub mod gateway;
pub mod reconciler;

pub use gateway::{BkashGateway, GatewayError, PaymentGateway};
pub use reconciler::{CallbackOutcome, PaymentService};
