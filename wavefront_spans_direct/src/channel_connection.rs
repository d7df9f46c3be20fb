use std::sync::Arc;

use hyper::client::HttpConnector;
use tokio_rustls::rustls::{client::ServerCertVerifier, ClientConfig, RootCertStore};

pub type ChannelType = hyper::Client<hyper_rustls::HttpsConnector<HttpConnector>, hyper::Body>;

/// You can make an insecure connection by passing `insecure_trust_store` to tls_trust.
/// `http://` servers are reached without TLS either way.
pub fn get_channel<TrustFunction>(tls_trust: TrustFunction) -> ChannelType
where
    TrustFunction: FnOnce() -> Option<RootCertStore>,
{
    let tls = ClientConfig::builder().with_safe_defaults();
    let tls = match tls_trust() {
        Some(trust) => tls.with_root_certificates(trust).with_no_client_auth(),
        None => {
            let mut config = tls
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth();
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NotAVerifier));
            config
        }
    };

    let mut http_connector = HttpConnector::new();
    http_connector.enforce_http(false);

    let https_connector = tower::ServiceBuilder::new()
        .layer_fn(move |http_connector| {
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls.clone())
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(http_connector)
        })
        .service(http_connector);

    hyper::Client::builder().build(https_connector)
}

pub fn default_trust_store() -> Option<RootCertStore> {
    let mut store = tokio_rustls::rustls::RootCertStore::empty();
    store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|trust_anchor| {
        tokio_rustls::rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            trust_anchor.subject,
            trust_anchor.spki,
            trust_anchor.name_constraints,
        )
    }));
    Some(store)
}

/// Accepts any server certificate.
pub fn insecure_trust_store() -> Option<RootCertStore> {
    None
}

struct NotAVerifier;

impl ServerCertVerifier for NotAVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::Certificate,
        _intermediates: &[tokio_rustls::rustls::Certificate],
        _server_name: &tokio_rustls::rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<tokio_rustls::rustls::client::ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(tokio_rustls::rustls::client::ServerCertVerified::assertion())
    }
}
