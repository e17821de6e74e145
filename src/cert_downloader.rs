//! The auxiliary app serving the root CA for install on client
//! devices/browsers: `/download/pem` and `/download/p12`, matched against
//! the configured proxy virtual host. Grounded on `cloudillo-proxy`'s
//! admin-routes-as-an-`App`-impl shape, trimmed to the two fixed routes
//! this feature needs rather than a general admin API.

use crate::ca::RootCa;
use crate::env::ProxyEnv;
use crate::error::ProxyError;
use crate::gateway::{App, BodyStream, GatewayResponse};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub struct CertDownloaderApp {
    root_ca: Arc<RootCa>,
}

impl CertDownloaderApp {
    pub fn new(root_ca: Arc<RootCa>) -> Self {
        Self { root_ca }
    }

}

impl App for CertDownloaderApp {
    fn handles_path(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        matches!(path, "/download/pem" | "/download/p12")
    }

    fn call(
        &self,
        env: ProxyEnv,
        _body: BodyStream,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayResponse, ProxyError>> + Send + '_>> {
        Box::pin(async move {
            let path = env
                .request_uri
                .split('?')
                .next()
                .unwrap_or(env.request_uri.as_str());

            match path {
                "/download/pem" => {
                    let pem = self.root_ca.get_root_pem();
                    Ok(GatewayResponse::new(http::StatusCode::OK)
                        .with_header("Content-Type", "application/x-x509-ca-cert")
                        .with_header(
                            "Content-Disposition",
                            "attachment; filename=\"proxytap-ca.pem\"",
                        )
                        .with_body(crate::gateway::ResponseBody::Fixed(pem.into_bytes().into())))
                }
                "/download/p12" => {
                    let bundle = self.root_ca.get_root_pkcs12()?;
                    Ok(GatewayResponse::new(http::StatusCode::OK)
                        .with_header("Content-Type", "application/x-pkcs12")
                        .with_header(
                            "Content-Disposition",
                            "attachment; filename=\"proxytap-ca.p12\"",
                        )
                        .with_body(crate::gateway::ResponseBody::Fixed(bundle.into())))
                }
                _ => Ok(GatewayResponse::new(http::StatusCode::NOT_FOUND)
                    .with_body(crate::gateway::ResponseBody::Fixed(bytes::Bytes::from_static(b"not found")))),
            }
        })
    }
}
