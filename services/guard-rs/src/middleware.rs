//! axum middleware that runs the pipeline in front of the storefront.

use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT},
        HeaderMap, HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use futures::stream;
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    admin::AuthIdentity,
    pipeline::{Defense, RequestFacts, Verdict},
    tarpit::TarpitStream,
};

pub async fn guard(State(defense): State<Arc<Defense>>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = defense.resolve_identity(req.headers(), peer);
    let is_admin = req
        .extensions()
        .get::<AuthIdentity>()
        .is_some_and(AuthIdentity::is_admin);

    let (parts, body) = req.into_parts();
    let limit = defense.max_inspect_body();
    // Banned identities go straight to the tarpit; their bodies are never read.
    let inspect_body = !defense.is_blacklisted(&ip) && is_inspectable(&parts.headers, limit);
    let (body, captured) = if inspect_body {
        match to_bytes(body, limit).await {
            Ok(bytes) => (Body::from(bytes.clone()), Some(bytes)),
            Err(e) => {
                debug!(ip = %ip, "request body unreadable: {}", e);
                return reject(StatusCode::BAD_REQUEST, "Malformed request body");
            }
        }
    } else {
        (body, None)
    };

    let user_agent = header_str(&parts.headers, USER_AGENT.as_str()).unwrap_or("");
    let content_type = header_str(&parts.headers, CONTENT_TYPE.as_str());
    let text = captured.as_ref().map(|bytes| String::from_utf8_lossy(bytes));
    let facts = RequestFacts {
        ip: &ip,
        method: &parts.method,
        path: parts.uri.path(),
        query: parts.uri.query(),
        user_agent,
        content_type,
        body: text.as_deref(),
    };

    match defense.inspect(&facts, Instant::now()) {
        Verdict::Pass => {
            let path = facts.path.to_string();
            let method = facts.method.clone();
            let user_agent = user_agent.to_string();
            let res = next.run(Request::from_parts(parts, body)).await;
            if !is_admin {
                defense.record_traffic(
                    &RequestFacts {
                        ip: &ip,
                        method: &method,
                        path: &path,
                        query: None,
                        user_agent: &user_agent,
                        content_type: None,
                        body: None,
                    },
                    res.status(),
                );
            }
            res
        }
        Verdict::Tarpit => tarpit_response(defense.tarpit.engage(&ip)),
        Verdict::Reject { status, reason } => reject(status, reason),
        Verdict::Deceive(deception) => (
            deception.status,
            [(CONTENT_TYPE, deception.content_type)],
            deception.body,
        )
            .into_response(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Only small, declared-length form/json/text bodies are buffered; uploads and
/// chunked streams go through untouched.
fn is_inspectable(headers: &HeaderMap, limit: usize) -> bool {
    let length = header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse::<usize>().ok());
    let Some(length) = length else {
        return false;
    };
    if length == 0 || length > limit {
        return false;
    }
    match header_str(headers, CONTENT_TYPE.as_str()) {
        None => true,
        Some(ct) => {
            ct.contains("application/x-www-form-urlencoded")
                || ct.contains("json")
                || ct.starts_with("text/")
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> Response {
    (status, Json(json!({ "error": reason }))).into_response()
}

/// Streams the tarpit, or aborts the connection when no slot is free.
fn tarpit_response(drip: Option<TarpitStream>) -> Response {
    let Some(drip) = drip else {
        debug!("tarpit full, aborting connection");
        let abort = stream::once(async {
            Err::<Bytes, io::Error>(io::Error::new(io::ErrorKind::ConnectionAborted, "tarpit full"))
        });
        return Response::new(Body::from_stream(abort));
    };
    let mut res = Response::new(Body::from_stream(drip));
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    res.headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn only_small_declared_text_bodies_are_buffered() {
        let limit = 1024;
        assert!(is_inspectable(
            &headers(&[("content-length", "20"), ("content-type", "application/x-www-form-urlencoded")]),
            limit
        ));
        assert!(is_inspectable(
            &headers(&[("content-length", "20"), ("content-type", "application/json; charset=utf-8")]),
            limit
        ));
        assert!(!is_inspectable(
            &headers(&[("content-length", "2048"), ("content-type", "application/json")]),
            limit
        ));
        assert!(!is_inspectable(
            &headers(&[("content-length", "20"), ("content-type", "multipart/form-data; boundary=x")]),
            limit
        ));
        assert!(!is_inspectable(&headers(&[("content-type", "application/json")]), limit));
    }
}
