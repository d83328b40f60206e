use crate::error::CredentialError;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// The gateway rejects provider tokens older than an hour.
const TOKEN_REFRESH_AFTER: Duration = Duration::from_secs(50 * 60);

/// How a provider proves its identity to the gateway.
#[derive(Clone, Debug)]
pub enum Credential {
    /// Client certificate presented during the TLS handshake.
    Certificate(Arc<CertificateIdentity>),
    /// Signed provider token sent as a bearer authorization header.
    Token(Arc<TokenSigner>),
}

impl Credential {
    /// # Errors
    /// Returns an error if the PEM data lacks a certificate or private key.
    pub fn certificate_from_pem(pem: &[u8]) -> Result<Self, CredentialError> {
        Ok(Self::Certificate(Arc::new(CertificateIdentity::from_pem(pem)?)))
    }

    /// # Errors
    /// Returns an error if the key is not an EC private key in PEM form.
    pub fn token(team_id: impl Into<String>, key_id: impl Into<String>, key_pem: &[u8]) -> Result<Self, CredentialError> {
        Ok(Self::Token(Arc::new(TokenSigner::new(team_id, key_id, key_pem)?)))
    }

    /// Bearer token to attach to each request, if this credential uses one.
    ///
    /// # Errors
    /// Returns an error if signing a fresh token fails.
    pub fn bearer(&self) -> Result<Option<String>, CredentialError> {
        match self {
            Self::Certificate(_) => Ok(None),
            Self::Token(signer) => signer.current().map(Some),
        }
    }
}

pub struct CertificateIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CertificateIdentity {
    /// Reads a certificate chain and its private key from one PEM bundle.
    ///
    /// # Errors
    /// Returns an error if either part is missing or malformed.
    pub fn from_pem(pem: &[u8]) -> Result<Self, CredentialError> {
        let chain = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(CredentialError::MissingCertificate);
        }
        let key = rustls_pemfile::private_key(&mut &pem[..])?.ok_or(CredentialError::MissingKey)?;
        Ok(Self { chain, key })
    }

    #[must_use]
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }

    #[must_use]
    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl fmt::Debug for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateIdentity").field("chain_len", &self.chain.len()).finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    iat: i64,
}

/// Mints ES256 provider tokens and caches the current one until it is due
/// for refresh.
pub struct TokenSigner {
    team_id: String,
    key_id: String,
    key: EncodingKey,
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenSigner {
    /// # Errors
    /// Returns an error if the key cannot be parsed.
    pub fn new(team_id: impl Into<String>, key_id: impl Into<String>, key_pem: &[u8]) -> Result<Self, CredentialError> {
        Ok(Self {
            team_id: team_id.into(),
            key_id: key_id.into(),
            key: EncodingKey::from_ec_pem(key_pem)?,
            cached: Mutex::new(None),
        })
    }

    /// # Errors
    /// Returns an error if signing fails.
    pub fn current(&self) -> Result<String, CredentialError> {
        let mut cached = self.cached.lock();
        if let Some((token, issued)) = cached.as_ref()
            && issued.elapsed() < TOKEN_REFRESH_AFTER
        {
            return Ok(token.clone());
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        let claims = Claims { iss: &self.team_id, iat: time::OffsetDateTime::now_utc().unix_timestamp() };
        let token = jsonwebtoken::encode(&header, &claims, &self.key)?;

        tracing::debug!(key_id = %self.key_id, "Minted new provider token");
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("team_id", &self.team_id)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
