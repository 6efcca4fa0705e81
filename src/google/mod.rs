//! Clients for the Google services the dashboard leans on: OAuth sign-in,
//! service credentials, and Secret Manager. Cloud Storage lives in
//! `crate::storage::gcs` next to the local backend.

pub mod auth;
pub mod oauth;
pub mod secrets;

pub use auth::{ServiceAccountKey, TokenProvider};
pub use oauth::{GoogleOAuth, GoogleProfile, LoginAttempt};
pub use secrets::SecretManager;
