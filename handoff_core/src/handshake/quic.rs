//! QUIC endpoints for the direct channel.
//!
//! The offerer listens with a fresh self-signed certificate and publishes its
//! fingerprint through signaling; the answerer accepts exactly that certificate.

use anyhow::Result;
use quinn::{ClientConfig, Endpoint, ServerConfig, TransportConfig};
use rcgen::generate_simple_self_signed;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub const ALPN_PROTOCOL: &[u8] = b"handoff/1";

/// Server name presented during the TLS handshake
pub const SERVER_NAME: &str = "handoff.local";

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// BLAKE3 hex digest of a DER certificate
pub fn certificate_fingerprint(cert: &CertificateDer<'_>) -> String {
    blake3::hash(cert.as_ref()).to_hex().to_string()
}

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivatePkcs8KeyDer<'static>)> {
    let certified_key = generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
    let key = PrivatePkcs8KeyDer::from(certified_key.signing_key.serialize_der());
    let cert_der = CertificateDer::from(certified_key.cert.der().to_vec());
    Ok((cert_der, key))
}

fn transport_config() -> Result<TransportConfig> {
    let mut transport_config = TransportConfig::default();
    transport_config.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
    transport_config.keep_alive_interval(Some(Duration::from_secs(2)));
    transport_config.stream_receive_window((10 * 1024 * 1024_u32).into()); // 10 MiB
    transport_config.receive_window((20 * 1024 * 1024_u32).into()); // 20 MiB
    transport_config.send_window(20 * 1024 * 1024);
    Ok(transport_config)
}

/// Listening endpoint with a fresh certificate; returns the certificate fingerprint.
pub fn make_server_endpoint(bind_addr: SocketAddr) -> Result<(Endpoint, String)> {
    let (cert, key) = generate_self_signed_cert()?;
    let fingerprint = certificate_fingerprint(&cert);

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key.into())?;
    server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));

    let endpoint = Endpoint::server(server_config, bind_addr)?;
    Ok((endpoint, fingerprint))
}

/// Dialing endpoint that only trusts the certificate with `fingerprint`.
pub fn make_client_endpoint(fingerprint: &str) -> Result<Endpoint> {
    let provider = crypto_provider();
    let mut crypto = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertificate {
            fingerprint: fingerprint.to_string(),
            provider,
        }))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));

    let mut endpoint = Endpoint::client(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Host candidates for a listener on `port`: LAN IPv4 addresses, then loopback.
pub fn gather_host_candidates(port: u16) -> Vec<SocketAddr> {
    let mut candidates: Vec<SocketAddr> = local_ip_address::list_afinet_netifas()
        .map(|ifaces| {
            ifaces
                .into_iter()
                .filter(|(_name, ip)| ip.is_ipv4() && !ip.is_loopback())
                .map(|(_name, ip)| SocketAddr::new(ip, port))
                .collect()
        })
        .unwrap_or_default();
    candidates.dedup();
    candidates.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    candidates
}

/// Accepts exactly one certificate, identified by its BLAKE3 fingerprint.
/// Handshake signatures are still checked against that certificate.
#[derive(Debug)]
struct PinnedCertificate {
    fingerprint: String,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if certificate_fingerprint(end_entity) == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "certificate fingerprint does not match the offer".to_string(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_end_with_loopback() {
        let candidates = gather_host_candidates(4242);
        assert!(!candidates.is_empty());
        assert_eq!(
            candidates.last(),
            Some(&SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4242))
        );
        assert!(candidates.iter().all(|c| c.port() == 4242 && c.is_ipv4()));
    }

    #[tokio::test]
    async fn test_pinned_client_rejects_other_certificate() {
        let (server, _fingerprint) = make_server_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            if let Some(incoming) = server.accept().await {
                let _ = incoming.await;
            }
        });

        let client = make_client_endpoint(&"0".repeat(64)).unwrap();
        let result = client.connect(addr, SERVER_NAME).unwrap().await;
        assert!(result.is_err());
        accept.abort();
    }

    #[tokio::test]
    async fn test_pinned_client_accepts_offered_certificate() {
        let (server, fingerprint) = make_server_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let incoming = server.accept().await.unwrap();
            let connection = incoming.await.unwrap();
            // Hold the connection until the client hangs up
            let _ = connection.closed().await;
        });

        let client = make_client_endpoint(&fingerprint).unwrap();
        let connection = client.connect(addr, SERVER_NAME).unwrap().await.unwrap();
        connection.close(0u32.into(), b"test");
        accept.await.unwrap();
    }
}
