//! rustls-based TLS for both STARTTLS upgrades and TLS-on-connect.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{
    client::TlsStream,
    rustls::pki_types::ServerName,
    rustls::{ClientConfig, RootCertStore},
    TlsConnector,
};

/// Run the TLS handshake over `stream`, verifying the certificate
/// against `domain` with the webpki root set.
pub(crate) async fn upgrade<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    domain: &str,
) -> Result<TlsStream<S>, io::Error> {
    let domain = ServerName::try_from(domain.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
        .connect(domain, stream)
        .await
}
