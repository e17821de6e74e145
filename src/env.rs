//! Typed stand-in for the request environment described in the data
//! model: a gateway-interface-style map of method/path/headers/protocol,
//! plus the `wsgiprox.*`-equivalent proxy keys, now as named fields
//! instead of a stringly-typed map (see REDESIGN FLAGS in SPEC_FULL.md).

use http::Method;

/// Scheme the client believes it is talking, set on `wsgi.url_scheme`
/// in the original design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlScheme {
    Http,
    Https,
}

impl UrlScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// The request environment handed to a [`crate::gateway::App`].
#[derive(Debug, Clone)]
pub struct ProxyEnv {
    pub method: Method,
    /// Set to `resolve(url, env)` before the inner app ever sees it —
    /// the "resolver output is always assigned to REQUEST_URI" invariant.
    pub request_uri: String,
    pub query_string: String,
    pub protocol: &'static str,
    pub url_scheme: UrlScheme,
    /// `HTTP_*`-prefixed headers in the original design, kept here as a
    /// plain ordered list since most callers want to iterate them anyway.
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,

    /// `wsgiprox.connect_host`: hostname from CONNECT, or overwritten by SNI.
    pub connect_host: String,
    /// `wsgiprox.connect_port`: present only when non-default.
    pub connect_port: Option<u16>,
    /// `wsgiprox.proxy_host`: the configured proxy virtual host name.
    pub proxy_host: String,
    /// `wsgiprox.matched_proxy_host`: set when an auxiliary-app host matched.
    pub matched_proxy_host: Option<String>,
}

impl ProxyEnv {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_keep_alive(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}
