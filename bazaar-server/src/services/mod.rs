pub mod conversation_service;
pub mod error;
pub mod message_service;
pub mod notification_service;
pub mod payment;
pub mod read_state;
pub mod token_service;

pub use conversation_service::ConversationService;
pub use error::{ServiceError, ServiceResult};
pub use message_service::MessageService;
pub use notification_service::NotificationService;
pub use payment::PaymentService;
pub use read_state::ReadStateService;
pub use token_service::TokenService;
