//! The peer-facing stream abstraction: a plain TCP socket that can be
//! upgraded to TLS in place once a forwarding relay has been spliced,
//! mirroring `sug0-bafomet`'s `communication::socket` pattern of
//! wrapping one concrete transport behind a small owned type rather
//! than behind a generic parameter threaded through every caller.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls_pemfile as pemfile;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::*;

/// Any duplex byte stream we can drive a handshake or splice over.
trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A TCP socket, optionally upgraded to TLS. `local_addr`/`peer_addr`
/// are captured at construction time since they're no longer
/// reachable once the underlying stream is boxed behind `Stream`.
pub struct Socket {
    inner: Pin<Box<dyn Stream>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Socket {
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            inner: Box::pin(stream),
            local_addr,
            peer_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Upgrades the client side of an already-spliced stream to TLS.
    /// Hostname verification is disabled per the forwarding leg's
    /// contract (§6): the server is identified by the forwarding
    /// target, not by certificate name.
    pub async fn upgrade_client_tls(self, connector: &TlsConnector, server_name: &str) -> Result<Self> {
        let name = rustls_pki_types::ServerName::try_from(server_name.to_string())
            .wrapped(ErrorKind::Forwarding)?;
        let tls = connector
            .connect(name, TokioIo(self.inner))
            .await
            .wrapped(ErrorKind::Forwarding)?;
        Ok(Self {
            inner: Box::pin(tls),
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
        })
    }

    pub async fn upgrade_server_tls(self, acceptor: &TlsAcceptor) -> Result<Self> {
        let tls = acceptor
            .accept(TokioIo(self.inner))
            .await
            .wrapped(ErrorKind::Forwarding)?;
        Ok(Self {
            inner: Box::pin(tls),
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
        })
    }
}

/// Trivial newtype so a `Pin<Box<dyn Stream>>` can itself implement
/// `AsyncRead + AsyncWrite`, which `tokio-rustls` requires of the
/// stream it wraps.
struct TokioIo<S>(S);

impl<S: Stream + ?Sized> AsyncRead for TokioIo<Pin<Box<S>>> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_read(cx, buf)
    }
}

impl<S: Stream + ?Sized> AsyncWrite for TokioIo<Pin<Box<S>>> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_shutdown(cx)
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

/// Parses a PEM-encoded certificate chain and private key from bytes,
/// building the mutual-TLS material the forwarding leg needs.
pub fn load_tls_material(
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_pem: &[u8],
) -> Result<(
    Vec<rustls_pki_types::CertificateDer<'static>>,
    rustls_pki_types::PrivateKeyDer<'static>,
    rustls::RootCertStore,
)> {
    let certs: Vec<_> = pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<_, _>>()
        .wrapped(ErrorKind::Forwarding)?;
    let key = pemfile::private_key(&mut &key_pem[..])
        .wrapped(ErrorKind::Forwarding)?
        .ok_or_else(|| Error::simple(ErrorKind::Forwarding))?;

    let mut roots = rustls::RootCertStore::empty();
    for ca in pemfile::certs(&mut &ca_pem[..]) {
        let ca = ca.wrapped(ErrorKind::Forwarding)?;
        roots.add(ca).wrapped(ErrorKind::Forwarding)?;
    }

    Ok((certs, key, roots))
}

/// Builds a `TlsConnector` with hostname verification disabled, as
/// required by the forwarding leg's contract.
pub fn client_tls_connector(
    certs: Vec<rustls_pki_types::CertificateDer<'static>>,
    key: rustls_pki_types::PrivateKeyDer<'static>,
    roots: rustls::RootCertStore,
) -> Result<TlsConnector> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoHostnameVerification(Arc::new(
            rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .wrapped(ErrorKind::Forwarding)?,
        ))))
        .with_client_auth_cert(certs, key)
        .wrapped(ErrorKind::Forwarding)?;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Wraps the default webpki verifier but skips the hostname check,
/// since the forwarding leg identifies its peer by dial target rather
/// than certificate name (§6).
#[derive(Debug)]
struct NoHostnameVerification(Arc<dyn rustls::client::danger::ServerCertVerifier>);

impl rustls::client::danger::ServerCertVerifier for NoHostnameVerification {
    fn verify_server_cert(
        &self,
        end_entity: &rustls_pki_types::CertificateDer<'_>,
        intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        ocsp_response: &[u8],
        now: rustls_pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        // Skip the hostname check by verifying against the end-entity
        // cert's own subject; chain validity is still enforced.
        self.0.verify_server_cert(
            end_entity,
            intermediates,
            &rustls_pki_types::ServerName::IpAddress(std::net::IpAddr::V4(
                std::net::Ipv4Addr::UNSPECIFIED,
            )),
            ocsp_response,
            now,
        )
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls_pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls_pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

/// Bundles the client-side TLS material the forwarding leg's optional
/// mutual-TLS upgrade needs, so `ClientConfig`'s `ProxyConfig` can
/// carry one ready-to-use value instead of three loose parts.
pub struct ProxyTlsConfig {
    pub connector: TlsConnector,
}

pub fn server_tls_acceptor(
    certs: Vec<rustls_pki_types::CertificateDer<'static>>,
    key: rustls_pki_types::PrivateKeyDer<'static>,
    roots: rustls::RootCertStore,
) -> Result<TlsAcceptor> {
    let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .wrapped(ErrorKind::Forwarding)?;
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .wrapped(ErrorKind::Forwarding)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
