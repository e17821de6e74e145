//! An in-memory fixture `App`, used by the test suite and the demo binary.
//! Echoes the request URI and proxy host back in the exact format
//! `wsgiprox/test/fixture_app.py` used, so end-to-end scenarios can assert
//! against a known response body.

use crate::env::ProxyEnv;
use crate::error::ProxyError;
use crate::gateway::{App, BodyStream, GatewayResponse, ResponseBody, WebSocketStream};
use crate::ws::{Frame, Opcode};
use std::future::Future;
use std::pin::Pin;

/// Whether the query string carries an `addproxyhost` parameter, the
/// fixture's cue (per `wsgiprox/test/fixture_app.py`'s `parse_qsl` use) to
/// append the proxy host to the echoed body.
fn has_addproxyhost(query_string: &str) -> bool {
    query_string
        .split('&')
        .any(|pair| pair.split('=').next().unwrap_or("") == "addproxyhost")
}

pub struct FixtureApp;

impl App for FixtureApp {
    fn call(
        &self,
        env: ProxyEnv,
        _body: BodyStream,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayResponse, ProxyError>> + Send + '_>> {
        Box::pin(async move {
            let mut body = format!("Requested Url: {}", env.request_uri);
            if has_addproxyhost(&env.query_string) {
                body.push_str(&format!(" Proxy Host: {}", env.proxy_host));
            }
            Ok(GatewayResponse::new(http::StatusCode::OK)
                .with_header("Content-Type", "text/plain; charset=utf-8")
                .with_body(ResponseBody::Fixed(body.into_bytes().into())))
        })
    }

    /// Echoes each text message back prefixed with the rewritten request
    /// URL, e.g. `M` on `wss://host/ws?q=1` comes back as `<url> M`.
    fn call_websocket<'a>(
        &'a self,
        env: ProxyEnv,
        mut ws: WebSocketStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let frame = match crate::ws::read_frame(&mut ws).await {
                    Ok(frame) => frame,
                    Err(_) => return Ok(()),
                };
                match frame.opcode {
                    Opcode::Close => {
                        let _ = crate::ws::write_frame(
                            &mut ws,
                            &Frame {
                                opcode: Opcode::Close,
                                payload: frame.payload,
                            },
                        )
                        .await;
                        return Ok(());
                    }
                    Opcode::Ping => {
                        let _ = crate::ws::write_frame(
                            &mut ws,
                            &Frame {
                                opcode: Opcode::Pong,
                                payload: frame.payload,
                            },
                        )
                        .await;
                    }
                    Opcode::Text => {
                        let text = String::from_utf8_lossy(&frame.payload);
                        let reply = format!("{} {}", env.request_uri, text);
                        let _ = crate::ws::write_frame(
                            &mut ws,
                            &Frame {
                                opcode: Opcode::Text,
                                payload: reply.into_bytes(),
                            },
                        )
                        .await;
                    }
                    Opcode::Binary | Opcode::Continuation | Opcode::Pong => {
                        let _ = crate::ws::write_frame(&mut ws, &frame).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::UrlScheme;
    use crate::gateway::empty_body;

    fn sample_env(request_uri: &str) -> ProxyEnv {
        ProxyEnv {
            method: http::Method::GET,
            request_uri: request_uri.to_owned(),
            query_string: String::new(),
            protocol: "HTTP/1.1",
            url_scheme: UrlScheme::Http,
            headers: Vec::new(),
            content_length: None,
            content_type: None,
            connect_host: "example.com".to_owned(),
            connect_port: None,
            proxy_host: "wsgiprox".to_owned(),
            matched_proxy_host: None,
        }
    }

    #[tokio::test]
    async fn echoes_request_uri_without_proxy_host_by_default() {
        let app = FixtureApp;
        let resp = app.call(sample_env("http://example.com/a"), empty_body()).await.unwrap();
        let ResponseBody::Fixed(body) = resp.body else {
            unreachable!("fixture app always returns a fixed body");
        };
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(body, "Requested Url: http://example.com/a");
    }

    #[tokio::test]
    async fn appends_proxy_host_when_query_string_requests_it() {
        let mut env = sample_env("/prefix/https://example.com/path/file?foo=bar&addproxyhost=true");
        env.query_string = "foo=bar&addproxyhost=true".to_owned();
        let app = FixtureApp;
        let resp = app.call(env, empty_body()).await.unwrap();
        let ResponseBody::Fixed(body) = resp.body else {
            unreachable!("fixture app always returns a fixed body");
        };
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(
            body,
            "Requested Url: /prefix/https://example.com/path/file?foo=bar&addproxyhost=true Proxy Host: wsgiprox"
        );
    }
}
