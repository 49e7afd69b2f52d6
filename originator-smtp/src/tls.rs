//! TLS with assurance tracking.
//!
//! The verifier never aborts a handshake: it runs real WebPKI verification
//! against the candidate identities (MX hostname first, then the recipient
//! domain and any additional match domains), records the strongest level
//! that held, and lets the dialog apply policy afterwards. A failed
//! `achieved >= required` check is then an ordinary send failure instead of
//! an opaque alert mid-handshake.

use std::sync::{Arc, Mutex};

use originator_common::TlsAssurance;
use tokio_rustls::{
    rustls::{
        client::{
            danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
            WebPkiServerVerifier,
        },
        pki_types::{CertificateDer, ServerName, UnixTime},
        ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme,
    },
    TlsConnector,
};
use tracing::warn;

/// Shared slot the verifier writes the achieved assurance into.
#[derive(Debug, Clone)]
pub struct AssuranceHandle(Arc<Mutex<TlsAssurance>>);

impl AssuranceHandle {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(TlsAssurance::NoTls)))
    }

    fn record(&self, level: TlsAssurance) {
        let mut achieved = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if level > *achieved {
            *achieved = level;
        }
    }

    /// The strongest assurance achieved by the handshake driven with this
    /// handle; `NoTls` until a handshake ran.
    #[must_use]
    pub fn achieved(&self) -> TlsAssurance {
        *self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct AssuranceVerifier {
    /// WebPKI verifier over the platform trust roots; absent when no roots
    /// could be loaded, in which case every handshake is `TlsAnonymous`.
    webpki: Option<Arc<WebPkiServerVerifier>>,
    exact_name: Option<ServerName<'static>>,
    domain_names: Vec<ServerName<'static>>,
    handle: AssuranceHandle,
}

impl AssuranceVerifier {
    fn classify(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> TlsAssurance {
        let Some(webpki) = &self.webpki else {
            return TlsAssurance::TlsAnonymous;
        };

        let verifies = |name: &ServerName<'static>| {
            webpki
                .verify_server_cert(end_entity, intermediates, name, &[], now)
                .is_ok()
        };

        if self.exact_name.as_ref().is_some_and(|n| verifies(n)) {
            return TlsAssurance::TlsExactMatchCert;
        }
        if self.domain_names.iter().any(|n| verifies(n)) {
            return TlsAssurance::TlsDomainMatchCert;
        }
        TlsAssurance::TlsAnonymous
    }
}

impl ServerCertVerifier for AssuranceVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        self.handle
            .record(self.classify(end_entity, intermediates, now));
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        match &self.webpki {
            Some(webpki) => webpki.verify_tls12_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        match &self.webpki {
            Some(webpki) => webpki.verify_tls13_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.as_ref().map_or_else(
            || {
                vec![
                    SignatureScheme::RSA_PKCS1_SHA256,
                    SignatureScheme::RSA_PSS_SHA256,
                    SignatureScheme::ECDSA_NISTP256_SHA256,
                    SignatureScheme::ED25519,
                ]
            },
            |webpki| webpki.supported_verify_schemes(),
        )
    }
}

/// Everything needed to drive one assured handshake.
pub struct AssuredTls {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
    pub handle: AssuranceHandle,
}

/// Build a connector whose verifier tracks assurance for `mx_host` against
/// `match_domains`.
pub fn assured_connector(mx_host: &str, match_domains: &[String]) -> Result<AssuredTls, String> {
    let server_name = ServerName::try_from(mx_host.to_string())
        .map_err(|e| format!("invalid TLS server name '{mx_host}': {e}"))?;

    let webpki = match load_webpki_verifier() {
        Ok(verifier) => Some(verifier),
        Err(reason) => {
            warn!(%reason, "platform trust roots unavailable, TLS is anonymous-only");
            None
        }
    };

    let handle = AssuranceHandle::new();
    let verifier = AssuranceVerifier {
        webpki,
        exact_name: Some(server_name.clone()),
        domain_names: match_domains
            .iter()
            .filter_map(|d| ServerName::try_from(d.clone()).ok())
            .collect(),
        handle: handle.clone(),
    };

    let mut config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(verifier));

    Ok(AssuredTls {
        connector: TlsConnector::from(Arc::new(config)),
        server_name,
        handle,
    })
}

fn load_webpki_verifier() -> Result<Arc<WebPkiServerVerifier>, String> {
    let loaded = rustls_native_certs::load_native_certs();
    if !loaded.errors.is_empty() {
        warn!(errors = ?loaded.errors, "some platform certificates could not be loaded");
    }

    let mut roots = RootCertStore::empty();
    for cert in loaded.certs {
        // Individually bad roots are skipped, not fatal.
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        return Err("no usable trust roots".to_string());
    }

    WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| e.to_string())
}
