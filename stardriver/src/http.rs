//! This module provides various HTTP(S) request utilities, everything is based on
//! async reqwest with tokio.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, PRAGMA};
use reqwest::{Client, ClientBuilder};


/// The user agent to be used on each HTTP request, the patch servers expect this
/// exact string from the official launcher.
pub const USER_AGENT: &str = "AQUA_HTTP";

/// Maximum number of kept-alive connections per host, matching the worker pool so
/// that every worker can keep its own connection warm.
const POOL_MAX_IDLE_PER_HOST: usize = 28;

/// How long an idle connection is kept in the pool before being released.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Get a new client builder for async HTTP(S) requests, preconfigured with the
/// headers and connection pool parameters the patch servers are served best with.
/// Note that the Host header is implied by reqwest from each request's URL.
pub fn builder() -> ClientBuilder {

    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

    Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .gzip(true)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)

}
