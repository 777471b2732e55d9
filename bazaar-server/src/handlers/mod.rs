pub mod conversations;
pub mod messages;
pub mod notifications;
pub mod payments;
pub mod realtime;
pub mod tokens;
