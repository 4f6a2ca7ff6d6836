//! Forwarding handler bound to a single upstream instance.
//!
//! A [`ProxyHandler`] owns a `reqwest::Client`, so reusing the handler reuses
//! that client's keep-alive pool for its target.

use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, Request, Response};
use reqwest::redirect::Policy;
use shopmesh_core::ServiceInstance;
use tower_http::request_id::RequestId;
use tracing::debug;
use uuid::Uuid;

use super::config::RouteConfig;

/// Header stamped on every proxied request and its response.
pub const REQUEST_ID_HEADER: &str = "x-gateway-request-id";

/// Settings shared by every handler the gateway creates.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub cookie_domain: Option<String>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            cookie_domain: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("failed to read request body: {0}")]
    Body(String),
}

/// Reusable forwarder for one `(service, instance)` pair.
#[derive(Debug)]
pub struct ProxyHandler {
    service: String,
    target: ServiceInstance,
    base_url: String,
    client: reqwest::Client,
    max_body_bytes: usize,
    cookie_domain: Option<String>,
}

impl ProxyHandler {
    /// # Errors
    ///
    /// Returns [`ProxyError::Upstream`] if the HTTP client cannot be built.
    pub fn new(
        service: &str,
        target: ServiceInstance,
        options: &ProxyOptions,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(options.request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            service: service.to_string(),
            base_url: target.base_url(),
            target,
            client,
            max_body_bytes: options.max_body_bytes,
            cookie_domain: options.cookie_domain.clone(),
        })
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn target(&self) -> &ServiceInstance {
        &self.target
    }

    /// Forwards `req` to this handler's target.
    ///
    /// The route's public prefix is rewritten to its target prefix, every
    /// end-to-end header is copied (auth and tracing headers included), and
    /// `X-Gateway-Request-ID` is set on both the upstream request and the
    /// returned response.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when the body cannot be read or the upstream
    /// call fails. Upstream error statuses are passed through, not errors.
    pub async fn forward(
        &self,
        req: Request<Body>,
        route: &RouteConfig,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
        let url = format!(
            "{}{}",
            self.base_url,
            rewrite_path(path, &route.path_prefix, &route.target_prefix)
        );

        // Only an id stamped by the gateway's own middleware is trusted;
        // an inbound header is never forwarded as-is.
        let request_id = parts
            .extensions
            .get::<RequestId>()
            .map(|id| id.header_value().clone())
            .unwrap_or_else(new_request_id);

        let mut headers = copy_end_to_end(&parts.headers);
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), request_id.clone());
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
        }

        let bytes = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?;

        debug!(service = %self.service, target = %self.target, %url, "forwarding request");
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(bytes)
            .send()
            .await?;

        let status = upstream.status();
        let mut response_headers = copy_end_to_end(upstream.headers());
        let body = upstream.bytes().await?;

        if let Some(domain) = &self.cookie_domain {
            rewrite_set_cookies(&mut response_headers, domain);
        }
        response_headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), request_id);

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn new_request_id() -> HeaderValue {
    HeaderValue::from_str(&Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn copy_end_to_end(source: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(source.len() + 2);
    for (name, value) in source {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Replaces the leading `from` prefix of a path (and query) with `to`.
///
/// Only whole path segments match: `/api/products` does not rewrite
/// `/api/productsx`.
#[must_use]
pub fn rewrite_path(path_and_query: &str, from: &str, to: &str) -> String {
    let Some(rest) = path_and_query.strip_prefix(from) else {
        return path_and_query.to_string();
    };
    if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('?')) {
        return path_and_query.to_string();
    }
    if to == "/" {
        return match rest.chars().next() {
            None => "/".to_string(),
            Some('?') => format!("/{rest}"),
            Some(_) => rest.to_string(),
        };
    }
    format!("{to}{rest}")
}

/// Rewrites the `Domain` attribute of a `Set-Cookie` value.
///
/// Cookies without a `Domain` attribute are host-only and left as they are.
#[must_use]
pub fn rewrite_cookie_domain(cookie: &str, domain: &str) -> String {
    cookie
        .split(';')
        .enumerate()
        .map(|(i, part)| {
            let attr = part.trim_start();
            let is_domain = i > 0
                && attr
                    .get(..7)
                    .is_some_and(|head| head.eq_ignore_ascii_case("domain="));
            if is_domain {
                format!(" Domain={domain}")
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn rewrite_set_cookies(headers: &mut HeaderMap, domain: &str) {
    let cookies: Vec<HeaderValue> = headers
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|value| match value.to_str() {
            Ok(text) => HeaderValue::from_str(&rewrite_cookie_domain(text, domain))
                .unwrap_or_else(|_| value.clone()),
            Err(_) => value.clone(),
        })
        .collect();
    if cookies.is_empty() {
        return;
    }
    headers.remove(header::SET_COOKIE);
    for cookie in cookies {
        headers.append(header::SET_COOKIE, cookie);
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::Request as AxumRequest;
    use axum::http::StatusCode;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn identity_rewrite_keeps_path() {
        assert_eq!(
            rewrite_path("/api/products/42?x=1", "/api/products", "/api/products"),
            "/api/products/42?x=1"
        );
    }

    #[test]
    fn rewrite_swaps_prefix() {
        assert_eq!(rewrite_path("/api/cart/7", "/api/cart", "/v2/cart"), "/v2/cart/7");
        assert_eq!(rewrite_path("/api/cart?all=1", "/api/cart", "/v2"), "/v2?all=1");
        assert_eq!(rewrite_path("/api/cart/7", "/api/cart", "/"), "/7");
        assert_eq!(rewrite_path("/api/cart", "/api/cart", "/"), "/");
        assert_eq!(rewrite_path("/api/cart?q", "/api/cart", "/"), "/?q");
    }

    #[test]
    fn rewrite_requires_segment_boundary() {
        assert_eq!(rewrite_path("/api/cartx", "/api/cart", "/v2"), "/api/cartx");
        assert_eq!(rewrite_path("/other", "/api/cart", "/v2"), "/other");
    }

    #[test]
    fn cookie_domain_is_replaced_case_insensitively() {
        assert_eq!(
            rewrite_cookie_domain("sid=abc; Path=/; domain=10.0.0.5; HttpOnly", "shop.example"),
            "sid=abc; Path=/; Domain=shop.example; HttpOnly"
        );
    }

    #[test]
    fn host_only_cookie_untouched() {
        let cookie = "sid=abc; Path=/; HttpOnly";
        assert_eq!(rewrite_cookie_domain(cookie, "shop.example"), cookie);
        // A cookie literally named "domain" is not an attribute.
        assert_eq!(rewrite_cookie_domain("domain=x; Path=/", "shop.example"), "domain=x; Path=/");
    }

    async fn spawn_echo() -> ServiceInstance {
        let app = Router::new().fallback(|req: AxumRequest| async move {
            let headers: serde_json::Map<String, Value> = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or_default())))
                .collect();
            (
                StatusCode::CREATED,
                [(header::SET_COOKIE, "sid=1; Domain=internal.local; Path=/")],
                Json(json!({
                    "method": req.method().as_str(),
                    "path": req.uri().path_and_query().map(|pq| pq.as_str().to_string()),
                    "headers": headers,
                })),
            )
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        ServiceInstance::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn forwards_request_and_stamps_request_id() {
        let target = spawn_echo().await;
        let options = ProxyOptions {
            cookie_domain: Some("shop.example".to_string()),
            ..ProxyOptions::default()
        };
        let handler = ProxyHandler::new("cart-service", target, &options).unwrap();
        let route = RouteConfig::new("cart-service", "/api/cart").with_target_prefix("/cart");

        let req = Request::builder()
            .method("POST")
            .uri("/api/cart/9?full=true")
            .header("authorization", "Bearer t0k")
            .header("traceparent", "00-abc-def-01")
            .body(Body::from("{}"))
            .unwrap();
        let response = handler.forward(req, &route).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let request_id = response.headers()[REQUEST_ID_HEADER].clone();
        assert_eq!(
            response.headers()[header::SET_COOKIE],
            "sid=1; Domain=shop.example; Path=/"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let echoed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["path"], "/cart/9?full=true");
        assert_eq!(echoed["headers"]["authorization"], "Bearer t0k");
        assert_eq!(echoed["headers"]["traceparent"], "00-abc-def-01");
        assert_eq!(
            echoed["headers"][REQUEST_ID_HEADER],
            request_id.to_str().unwrap()
        );
    }

    #[tokio::test]
    async fn inbound_request_id_is_replaced() {
        let target = spawn_echo().await;
        let handler = ProxyHandler::new("svc", target, &ProxyOptions::default()).unwrap();
        let route = RouteConfig::new("svc", "/api");
        let req = Request::builder()
            .uri("/api")
            .header(REQUEST_ID_HEADER, "fixed-id")
            .body(Body::empty())
            .unwrap();
        let response = handler.forward(req, &route).await.unwrap();
        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        assert_ne!(id, "fixed-id");
        assert!(Uuid::parse_str(&id).is_ok());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let echoed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed["headers"][REQUEST_ID_HEADER], id.as_str());
    }

    #[tokio::test]
    async fn unreachable_target_is_an_upstream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handler = ProxyHandler::new(
            "svc",
            ServiceInstance::new("127.0.0.1", port),
            &ProxyOptions::default(),
        )
        .unwrap();
        let req = Request::builder().uri("/api").body(Body::empty()).unwrap();
        let err = handler
            .forward(req, &RouteConfig::new("svc", "/api"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Upstream(_)));
    }
}
