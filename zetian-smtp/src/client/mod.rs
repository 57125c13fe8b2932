//! Outbound SMTP client used by the relay dispatcher.

mod error;
mod response;

#[allow(clippy::module_inception)]
mod client;

pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::Response;
