pub mod cache;
pub mod config;
pub mod error;
pub mod mail;
pub mod query;

pub use error::{MailError, Result};
