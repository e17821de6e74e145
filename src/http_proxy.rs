//! Plain (non-CONNECT) HTTP proxy handling: a client sends an absolute-URL
//! request line directly, without ever tunneling. Grounded on
//! `rust_http_proxy/src/proxy.rs`'s `extract_scheme_host_port` plus
//! hop-by-hop header stripping, and on `examples/http_connect_proxy.rs`'s
//! `RemoveRequestHeaderLayer::hop_by_hop` for which headers never reach the
//! inner app.

use crate::env::{ProxyEnv, UrlScheme};
use crate::error::ProxyError;
use crate::gateway::{App, BodyStream, GatewayResponse};
use crate::middleware::AuxAppTable;
use crate::resolver::Resolver;
use http::{HeaderName, Method};
use std::sync::Arc;

/// Headers stripped before the inner app (or the upstream, in a pure
/// forwarding deployment) ever sees the request: proxy-addressed framing
/// that has no meaning past this hop.
const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Splits an absolute request target (`http://host[:port]/path?query`)
/// into scheme, host, optional port, and path+query.
pub fn extract_scheme_host_port(target: &str) -> Result<(UrlScheme, String, Option<u16>, String), ProxyError> {
    let (scheme, rest) = if let Some(rest) = target.strip_prefix("https://") {
        (UrlScheme::Https, rest)
    } else if let Some(rest) = target.strip_prefix("http://") {
        (UrlScheme::Http, rest)
    } else {
        return Err(ProxyError::protocol(format!(
            "request target is not an absolute http(s) url: {target}"
        )));
    };

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            let port: u16 = port
                .parse()
                .map_err(|_| ProxyError::protocol(format!("invalid port in request target: {target}")))?;
            (host.to_owned(), Some(port))
        }
        _ => (authority.to_owned(), None),
    };

    if host.is_empty() {
        return Err(ProxyError::protocol(format!("missing host in request target: {target}")));
    }

    Ok((scheme, host, port, path.to_owned()))
}

/// Handle one plain-HTTP-proxy request: resolve scheme/host/port, consult
/// the auxiliary-app table the same way the Connect Handler does, then
/// either rewrite via `resolver` (pass-through) or keep the absolute URL's
/// path+query as-is (auxiliary-host match) before calling whichever app won.
#[allow(clippy::too_many_arguments)]
pub async fn handle_http_proxy_request(
    method: Method,
    target: &str,
    headers: Vec<(HeaderName, http::HeaderValue)>,
    body: BodyStream,
    proxy_host: &str,
    resolver: &dyn Resolver,
    default_app: &Arc<dyn App>,
    aux_apps: &AuxAppTable,
) -> Result<GatewayResponse, ProxyError> {
    let (scheme, host, port, path) = extract_scheme_host_port(target)?;

    // Proxy-only headers (including Proxy-Authorization) are kept through
    // resolution: per spec §4.D the order is parse -> resolve -> strip ->
    // call, so `require_auth`/`resolve` below must still see them. They are
    // stripped from `env.headers` right before the inner app is called.
    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_owned(), v.to_owned())))
        .collect();

    let content_length = header_pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok());
    let content_type = header_pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.clone());

    let aux_match = aux_apps.match_host(&host).filter(|app| app.handles_path(&path));
    let matched_proxy_host = aux_match.is_some().then(|| host.clone());
    let app = aux_match.unwrap_or_else(|| Arc::clone(default_app));

    let mut env = ProxyEnv {
        method,
        request_uri: target.to_owned(),
        query_string: path.find('?').map(|i| path[i + 1..].to_owned()).unwrap_or_default(),
        protocol: "HTTP/1.1",
        url_scheme: scheme,
        headers: header_pairs,
        content_length,
        content_type,
        connect_host: host,
        connect_port: port,
        proxy_host: proxy_host.to_owned(),
        matched_proxy_host,
    };

    if let Some(realm) = resolver.require_auth(&env) {
        return Ok(proxy_auth_challenge(&realm));
    }

    env.request_uri = if env.matched_proxy_host.is_some() {
        path
    } else {
        resolver.resolve(&env.request_uri, &env)
    };

    // FILTER_REQ_HEADERS: proxy-only framing headers never reach the inner app.
    env.headers
        .retain(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)));

    let mut resp = match app.call(env, body).await {
        Ok(resp) => resp,
        Err(err) => {
            // start_response-equivalent: nothing has been written to the
            // client yet, so a plain 500 is still a valid, complete response.
            tracing::warn!(error = %err, "inner app failed; emitting 500");
            return Ok(GatewayResponse::new(http::StatusCode::INTERNAL_SERVER_ERROR));
        }
    };
    resp.headers.push(("Proxy-Connection".to_owned(), "close".to_owned()));
    Ok(resp)
}

/// A `407 Proxy Authentication` response, per the wire contract: challenge
/// header plus `Proxy-Connection: close` so the client doesn't retry on a
/// connection this proxy is about to drop.
fn proxy_auth_challenge(realm: &str) -> GatewayResponse {
    GatewayResponse::new(http::StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .with_header("Proxy-Authenticate", format!("Basic realm=\"{realm}\""))
        .with_header("Proxy-Connection", "close")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_absolute_https_target() {
        let (scheme, host, port, path) = extract_scheme_host_port("https://example.com:8443/a/b?q=1").unwrap();
        assert_eq!(scheme, UrlScheme::Https);
        assert_eq!(host, "example.com");
        assert_eq!(port, Some(8443));
        assert_eq!(path, "/a/b?q=1");
    }

    #[test]
    fn defaults_path_to_root() {
        let (_, host, port, path) = extract_scheme_host_port("http://example.com").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, None);
        assert_eq!(path, "/");
    }

    #[test]
    fn rejects_relative_target() {
        assert!(extract_scheme_host_port("/just/a/path").is_err());
    }

    #[tokio::test]
    async fn proxy_auth_resolver_sees_header_before_it_is_stripped() {
        use crate::gateway::{empty_body, ResponseBody};
        use crate::middleware::AuxAppTable;
        use crate::resolver::ProxyAuthResolver;
        use crate::testing::FixtureApp;
        use base64::Engine;

        let resolver = ProxyAuthResolver::new("proxytap");
        let app: Arc<dyn App> = Arc::new(FixtureApp);
        let aux_apps = AuxAppTable::new();

        // No Proxy-Authorization at all: still challenged.
        let resp = handle_http_proxy_request(
            Method::GET,
            "http://example.com/a",
            Vec::new(),
            empty_body(),
            "wsgiprox",
            &resolver,
            &app,
            &aux_apps,
        )
        .await
        .unwrap();
        assert_eq!(resp.status, http::StatusCode::PROXY_AUTHENTICATION_REQUIRED);

        // With valid credentials, the header must still be visible to
        // `require_auth`/`resolve` even though HOP_BY_HOP lists
        // `proxy-authorization` — regression test for stripping it too early.
        let token = base64::engine::general_purpose::STANDARD.encode("alice:whatever");
        let headers = vec![(
            HeaderName::from_static("proxy-authorization"),
            http::HeaderValue::from_str(&format!("Basic {token}")).unwrap(),
        )];
        let resp = handle_http_proxy_request(
            Method::GET,
            "http://example.com/a",
            headers,
            empty_body(),
            "wsgiprox",
            &resolver,
            &app,
            &aux_apps,
        )
        .await
        .unwrap();
        assert_eq!(resp.status, http::StatusCode::OK);
        let ResponseBody::Fixed(body) = resp.body else {
            unreachable!("fixture app always returns a fixed body");
        };
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(body, "Requested Url: /alice/http://example.com/a");
    }
}
