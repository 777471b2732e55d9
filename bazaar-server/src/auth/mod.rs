pub mod channel_token;
pub mod session;
