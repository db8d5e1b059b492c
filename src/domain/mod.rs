//! Usage: Domain modules (provider registry and the credential store).

pub mod oauth_credentials;
pub mod oauth_providers;
