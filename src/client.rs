//! HTTP client construction.
//!
//! Every [`VirtualUser`](../user/struct.VirtualUser.html) gets a
//! [`reqwest::Client`] of its own, so users share no connection pool.

use reqwest::Client;

use crate::config::StampedeConfiguration;
use crate::StampedeError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build a client honoring `--timeout`, `--no-gzip` and `--accept-invalid-certs`.
pub(crate) fn build_client(configuration: &StampedeConfiguration) -> Result<Client, StampedeError> {
    let builder = Client::builder()
        .user_agent(APP_USER_AGENT)
        .timeout(configuration.request_timeout())
        .gzip(!configuration.no_gzip)
        .danger_accept_invalid_certs(configuration.accept_invalid_certs);

    Ok(builder.build()?)
}
