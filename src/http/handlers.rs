use http_body_util::{BodyExt as _, Full};
use hyper::{Method, StatusCode, body::Body, header};
use juniper::http::{GraphQLBatchRequest, graphiql::graphiql_source};
use std::{fmt, sync::Arc, time::Instant};

use crate::{api, apperr::LangKey, prelude::*};
use super::{Context, Request, Response, log, response};


/// This is the main HTTP entry point, called for each incoming request. CORS
/// is handled by the middleware wrapping this.
pub(super) async fn handle<B>(req: Request<B>, ctx: Arc<Context>) -> Response
where
    B: Body + Send,
    B::Data: Send,
    B::Error: fmt::Display,
{
    log::req::log(&req);
    log::headers::log(&req);

    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_owned();

    let mut response = match path.as_str() {
        // The GraphQL endpoint. This is the only path for which POST is
        // allowed. `/query` is accepted as alias.
        "/graphql" | "/query" if method == Method::POST => handle_api(req, &ctx).await,

        // From this point on, we only support GET and HEAD requests.
        _ if method != Method::GET && method != Method::HEAD => response::method_not_allowed(),

        // The interactive GraphQL API explorer/IDE.
        "" | "/graphiql" => response::html(graphiql_source("/graphql", None)),

        _ => {
            debug!("Responding with 404 to {:?} '{}'", method, path);
            response::not_found()
        }
    };

    if method == Method::HEAD {
        *response.body_mut() = Full::default();
    }
    response
}

/// Handles a request to `/graphql`.
async fn handle_api<B>(req: Request<B>, ctx: &Context) -> Response
where
    B: Body,
    B::Error: fmt::Display,
{
    let before = Instant::now();

    let lang = req.headers()
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .map_or(LangKey::Default, LangKey::from_accept_language);

    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            warn!("Failed to read body of API request: {e}");
            return response::bad_request(None);
        }
    };

    let gql_request = match serde_json::from_slice::<GraphQLBatchRequest>(&body) {
        Ok(r) => r,
        Err(e) => {
            debug!("Received invalid GraphQL request: {e}");
            return response::bad_request(Some(format!("invalid GraphQL request: {e}")));
        }
    };

    let api_context = api::Context::new(Arc::clone(&ctx.services), lang);
    let out = gql_request.execute(&ctx.api_root, &api_context).await;
    let status = if out.is_ok() { StatusCode::OK } else { StatusCode::BAD_REQUEST };

    let response = match serde_json::to_vec(&out) {
        Ok(body) => response::json(status, body),
        Err(e) => {
            error!("Failed to serialize GraphQL response: {e}");
            response::internal_server_error()
        }
    };

    debug!("Finished /graphql query in {:.2?}", before.elapsed());
    response
}
