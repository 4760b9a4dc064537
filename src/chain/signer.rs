//! ECDSA producers for the canonical transaction preimage.
//!
//! Two variants: a local in-memory key and a remote HSM-style signing
//! service returning (r, s, v) for a 32-byte digest. Key material never
//! crosses this module's boundary.

use async_trait::async_trait;
use ethers_core::types::{Address, Signature, H256, U256};
use ethers_signers::{LocalWallet, Signer as _};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum SignerError {
    /// The signer cannot be reached; cycle-level fatal
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    /// The signer refused the digest
    #[error("signing request rejected: {0}")]
    Rejected(String),
    #[error("invalid key material: {0}")]
    BadKey(String),
}

/// Abstract ECDSA producer. One in-flight call per signer address; the
/// submitter serializes access.
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;
    /// Sign a 32-byte digest, returning (r, s, v) with v in {27, 28}.
    async fn sign_digest(&self, digest: H256) -> Result<Signature, SignerError>;
}

/// Fold a recovery id into the EIP-155 v for `chain_id`. Accepts v in
/// {0, 1} or {27, 28}; values already >= 35 pass through untouched.
pub fn apply_eip155(mut signature: Signature, chain_id: u64) -> Signature {
    let recovery_id = match signature.v {
        0 | 1 => signature.v,
        27 | 28 => signature.v - 27,
        _ => return signature,
    };
    signature.v = chain_id * 2 + 35 + recovery_id;
    signature
}

/// Private key held in memory, read from the secret provider at init.
pub struct LocalSigner {
    wallet: LocalWallet,
}

impl LocalSigner {
    /// Parse a hex-encoded 32-byte private key.
    pub fn from_hex_key(key: &str) -> Result<Self, SignerError> {
        let wallet: LocalWallet = key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| SignerError::BadKey(format!("{}", e)))?;
        Ok(Self { wallet })
    }
}

#[async_trait]
impl TxSigner for LocalSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_digest(&self, digest: H256) -> Result<Signature, SignerError> {
        self.wallet
            .sign_hash(digest)
            .map_err(|e| SignerError::Rejected(e.to_string()))
    }
}

/// Response of the remote signing service.
#[derive(Debug, Deserialize)]
struct RemoteSignature {
    r: U256,
    s: U256,
    v: u64,
}

/// HSM-style signing service keyed by identifier. The service holds the
/// key; this client only ships digests.
pub struct RemoteSigner {
    client: reqwest::Client,
    url: String,
    key_id: String,
    token: Option<String>,
    address: Address,
    timeout: Duration,
}

impl RemoteSigner {
    pub fn new(
        client: reqwest::Client,
        url: String,
        key_id: String,
        token: Option<String>,
        address: Address,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            url,
            key_id,
            token,
            address,
            timeout,
        }
    }
}

#[async_trait]
impl TxSigner for RemoteSigner {
    fn address(&self) -> Address {
        self.address
    }

    #[instrument(skip(self, digest), fields(key_id = %self.key_id))]
    async fn sign_digest(&self, digest: H256) -> Result<Signature, SignerError> {
        let mut request = self
            .client
            .post(format!("{}/keys/{}/sign", self.url, self.key_id))
            .timeout(self.timeout)
            .json(&serde_json::json!({ "digest": format!("{:#x}", digest) }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SignerError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SignerError::Rejected(format!(
                "signing service returned {}",
                response.status()
            )));
        }

        let remote: RemoteSignature = response
            .json()
            .await
            .map_err(|e| SignerError::Rejected(format!("malformed signature payload: {}", e)))?;

        // Normalize to the 27/28 convention the submitter expects.
        let v = match remote.v {
            0 | 1 => remote.v + 27,
            v => v,
        };
        debug!("remote signer produced signature");
        Ok(Signature {
            r: remote.r,
            s: remote.s,
            v,
        })
    }
}
