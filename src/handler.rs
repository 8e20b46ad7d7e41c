//! HTTP routes
//!
//! `GET /` and `GET /tcpinfo` answer with the `tcp_info` of the connection
//! that carried the request. `?format=text` selects the plain renderer and
//! `?pretty` indents the JSON.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::context::{RequestContext, lookup_request};
use crate::output::{output_json, output_plain};
use crate::tcp_info::{self, QueryError};

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Format {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, Default)]
struct Params {
    format: Format,
    pretty: bool,
}

impl Params {
    fn parse(query: Option<&str>, pretty_default: bool) -> Self {
        let mut params = Self {
            pretty: pretty_default,
            ..Default::default()
        };
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "format" => {
                    params.format = match value {
                        "text" | "plain" => Format::Text,
                        _ => Format::Json,
                    }
                }
                "pretty" => params.pretty = !matches!(value, "0" | "false"),
                _ => {}
            }
        }
        params
    }
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: String,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    respond(status, JSON, body)
}

/// Route one request. `pretty_default` is the server-wide JSON indentation.
pub fn route<B>(req: &Request<B>, pretty_default: bool) -> Response<Full<Bytes>> {
    if let Some(ctx) = req.extensions().get::<RequestContext>() {
        debug!(
            "conn {} request #{}: {} {}",
            ctx.conn().id(),
            ctx.seq(),
            req.method(),
            req.uri()
        );
    }

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/" | "/tcpinfo") => {
            let params = Params::parse(req.uri().query(), pretty_default);
            tcp_info_response(req, params)
        }
        (&Method::GET, "/health") => respond(StatusCode::OK, TEXT, "OK".to_string()),
        (_, "/" | "/tcpinfo" | "/health") => {
            let mut response =
                error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            response
                .headers_mut()
                .insert(hyper::header::ALLOW, HeaderValue::from_static("GET"));
            response
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn tcp_info_response<B>(req: &Request<B>, params: Params) -> Response<Full<Bytes>> {
    let Some(handle) = lookup_request(req) else {
        debug!("no TCP handle for this request");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "tcp info unavailable for this connection",
        );
    };

    match tcp_info::query(handle) {
        Ok(info) => match params.format {
            Format::Json => {
                let mut body = output_json(&info, params.pretty);
                body.push('\n');
                respond(StatusCode::OK, JSON, body)
            }
            Format::Text => respond(StatusCode::OK, TEXT, output_plain(&info)),
        },
        Err(e @ QueryError::Unsupported) => {
            error_response(StatusCode::NOT_IMPLEMENTED, &e.to_string())
        }
        Err(e) => {
            warn!("can't get tcp info for {}: {}", handle, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}
