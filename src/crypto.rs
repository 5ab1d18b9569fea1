//! SHA3-256 и подписи ML-DSA-65 (Dilithium3)

use crate::error::SignatureError;
use crate::types::{Hash, NodeId, NodeRecord, PublicKey, Region, Signature};
use crate::vrf::VrfSecret;
use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

/// SHA3-256 over several parts, each prefixed by its length
pub fn sha3_parts(domain: &[u8], parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// ML-DSA-65 signing keypair
pub struct Keypair {
    pub public: PublicKey,
    secret: dilithium3::SecretKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let (pk, sk) = dilithium3::keypair();
        Self { public: pk.as_bytes().to_vec(), secret: sk }
    }

    pub fn from_bytes(public: &[u8], secret: &[u8]) -> Result<Self, SignatureError> {
        dilithium3::PublicKey::from_bytes(public)
            .map_err(|e| SignatureError::MalformedKey(format!("public key: {e:?}")))?;
        let secret = dilithium3::SecretKey::from_bytes(secret)
            .map_err(|e| SignatureError::MalformedKey(format!("secret key: {e:?}")))?;
        Ok(Self { public: public.to_vec(), secret })
    }

    pub fn secret_bytes(&self) -> &[u8] {
        self.secret.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        dilithium3::detached_sign(message, &self.secret).as_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(&self.public[..8.min(self.public.len())]))
            .finish_non_exhaustive()
    }
}

/// Verify an ML-DSA-65 detached signature. Malformed keys or signatures verify false.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(pk) = dilithium3::PublicKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig) = dilithium3::DetachedSignature::from_bytes(signature) else {
        return false;
    };
    dilithium3::verify_detached_signature(&sig, message, &pk).is_ok()
}

// =============================================================================
// NODE IDENTITY
// =============================================================================

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error(transparent)]
    Key(#[from] SignatureError),
    #[error("vrf seed must be 32 bytes, got {0}")]
    SeedLength(usize),
}

/// On-disk form, keys hex-encoded
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    node_id: String,
    region: String,
    public_key: String,
    secret_key: String,
    vrf_seed: String,
}

/// Everything a node signs and proves with
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub region: Region,
    pub keypair: Keypair,
    pub vrf: VrfSecret,
}

impl NodeIdentity {
    pub fn generate(node_id: NodeId, region: Region) -> Self {
        Self { node_id, region, keypair: Keypair::generate(), vrf: VrfSecret::generate(&mut OsRng) }
    }

    /// Registry entry for this identity
    pub fn record(&self, stake_weight: u64, trust_score: u8) -> NodeRecord {
        NodeRecord::new(
            self.node_id.clone(),
            self.keypair.public.clone(),
            self.vrf.public_key(),
            self.region.clone(),
            stake_weight,
            trust_score,
        )
    }

    pub fn to_json(&self) -> Result<String, IdentityError> {
        let file = IdentityFile {
            node_id: self.node_id.to_string(),
            region: self.region.to_string(),
            public_key: hex::encode(&self.keypair.public),
            secret_key: hex::encode(self.keypair.secret_bytes()),
            vrf_seed: hex::encode(self.vrf.seed()),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn from_json(json: &str) -> Result<Self, IdentityError> {
        let file: IdentityFile = serde_json::from_str(json)?;
        let keypair = Keypair::from_bytes(&hex::decode(&file.public_key)?, &hex::decode(&file.secret_key)?)?;
        let seed = hex::decode(&file.vrf_seed)?;
        let seed: [u8; 32] = seed.as_slice().try_into().map_err(|_| IdentityError::SeedLength(seed.len()))?;
        Ok(Self {
            node_id: NodeId::new(file.node_id),
            region: Region::new(file.region),
            keypair,
            vrf: VrfSecret::from_seed(seed),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), IdentityError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}
