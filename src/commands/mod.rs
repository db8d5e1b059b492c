//! Usage: Command handlers invoked by the CLI front end.

pub mod oauth_credentials;
