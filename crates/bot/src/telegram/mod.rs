pub mod api;
pub mod transport;
pub mod types;

pub use api::{TelegramApi, TelegramError};
pub use transport::TelegramTransport;
