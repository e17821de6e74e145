//! Resolving a requested URL (plus the current environment) to the
//! `REQUEST_URI` the inner app actually sees, and optionally gating access
//! behind Basic proxy authentication. Grounded directly on the resolver
//! contract in the data model, with the Basic-auth decode idiom taken from
//! `examples/http_mitm_proxy.rs`'s `ProxyAuthLayer`.

use crate::env::ProxyEnv;
use base64::Engine;

/// Rewrites the raw target URL into the value the inner app will see as
/// `REQUEST_URI`, given the rest of the request environment.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, url: &str, env: &ProxyEnv) -> String;

    /// `Some(realm)` if this request must be challenged with a `407`
    /// before `resolve` may run; `None` to proceed straight to `resolve`.
    /// The default never requires auth.
    fn require_auth(&self, _env: &ProxyEnv) -> Option<String> {
        None
    }
}

/// Identity resolver: the inner app sees the URL exactly as given.
pub struct IdentityResolver;

impl Resolver for IdentityResolver {
    fn resolve(&self, url: &str, _env: &ProxyEnv) -> String {
        url.to_owned()
    }
}

/// Prefixes every resolved URL with a fixed string, e.g. to route requests
/// through a path-based replay or archival front end.
pub struct FixedPrefixResolver {
    prefix: String,
}

impl FixedPrefixResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Resolver for FixedPrefixResolver {
    fn resolve(&self, url: &str, _env: &ProxyEnv) -> String {
        format!("{}{}", self.prefix, url)
    }
}

/// Decodes the username carried in a `Proxy-Authorization: Basic <b64>`
/// header, per RFC 7617. The password is intentionally discarded: this
/// resolver variant uses proxy auth to select a per-user path prefix (e.g.
/// a personal replay/recording session), not to authenticate a secret.
fn decode_proxy_auth_username(env: &ProxyEnv) -> Option<String> {
    let header = env.header("proxy-authorization")?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, _password) = decoded.split_once(':')?;
    Some(username.to_owned())
}

/// Routes each client under a path segment named after their
/// `Proxy-Authorization` username: `rewritten = "/" + username + "/" + url`.
/// Requests with no `Proxy-Authorization` header are gated behind a `407`
/// challenge via [`Resolver::require_auth`] before `resolve` ever runs.
pub struct ProxyAuthResolver {
    realm: String,
}

impl ProxyAuthResolver {
    pub fn new(realm: impl Into<String>) -> Self {
        Self { realm: realm.into() }
    }
}

impl Resolver for ProxyAuthResolver {
    fn resolve(&self, url: &str, env: &ProxyEnv) -> String {
        match decode_proxy_auth_username(env) {
            Some(username) => format!("/{username}/{url}"),
            None => url.to_owned(),
        }
    }

    fn require_auth(&self, env: &ProxyEnv) -> Option<String> {
        if env.header("proxy-authorization").is_some() {
            None
        } else {
            Some(self.realm.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_header(name: &str, value: &str) -> ProxyEnv {
        ProxyEnv {
            method: http::Method::GET,
            request_uri: "/".to_owned(),
            query_string: String::new(),
            protocol: "HTTP/1.1",
            url_scheme: crate::env::UrlScheme::Http,
            headers: vec![(name.to_owned(), value.to_owned())],
            content_length: None,
            content_type: None,
            connect_host: "example.com".to_owned(),
            connect_port: None,
            proxy_host: "wsgiprox".to_owned(),
            matched_proxy_host: None,
        }
    }

    #[test]
    fn missing_header_requires_auth() {
        let env = env_with_header("x-other", "value");
        let resolver = ProxyAuthResolver::new("proxytap");
        assert_eq!(resolver.require_auth(&env), Some("proxytap".to_owned()));
    }

    #[test]
    fn valid_basic_credentials_are_not_challenged_and_rewrite_by_username() {
        let token = base64::engine::general_purpose::STANDARD.encode("u:p");
        let env = env_with_header("proxy-authorization", &format!("Basic {token}"));
        let resolver = ProxyAuthResolver::new("proxytap");
        assert_eq!(resolver.require_auth(&env), None);
        assert_eq!(resolver.resolve("http://example.com/a", &env), "/u/http://example.com/a");
    }

    #[test]
    fn fixed_prefix_resolver_prepends() {
        let env = env_with_header("x-other", "value");
        let resolver = FixedPrefixResolver::new("https://archive.example/replay/");
        assert_eq!(
            resolver.resolve("http://example.com/a", &env),
            "https://archive.example/replay/http://example.com/a"
        );
    }
}
