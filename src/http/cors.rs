//! Cross-origin resource sharing.
//!
//! Only origins from the configured list are ever echoed back in
//! `Access-Control-Allow-Origin`. Requests from other origins are still
//! answered, but without that header, so browsers will block them.

use hyper::{Method, header::HeaderValue};
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use crate::prelude::*;


#[derive(Debug, Clone, confique::Config)]
pub(crate) struct CorsConfig {
    /// Origins that are allowed to make cross-origin requests, e.g.
    /// `["http://localhost:3000"]`. Duplicates are ignored. Required.
    pub(crate) allowed_origins: Option<Vec<String>>,
}

/// Preflight results may be cached by browsers for 12 hours.
const MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// Builds the CORS middleware for the given allowed origins.
pub(crate) fn layer(origins: &[String]) -> Result<CorsLayer> {
    let mut allowed: Vec<HeaderValue> = Vec::with_capacity(origins.len());
    for origin in origins {
        let origin = origin.trim();
        if origin == "*" {
            bail!("'*' is not allowed in `http.cors.allowed_origins`, list the origins explicitly");
        }
        let value = HeaderValue::from_str(origin)
            .with_context(|| format!("invalid origin '{origin}' in `http.cors.allowed_origins`"))?;
        if !allowed.contains(&value) {
            allowed.push(value);
        }
    }

    debug!("Allowing cross-origin requests from {} origins", allowed.len());
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::PUT, Method::POST, Method::GET, Method::DELETE])
        .allow_headers(AllowHeaders::mirror_request())
        .max_age(MAX_AGE))
}
