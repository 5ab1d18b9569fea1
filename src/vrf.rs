//! Verifiable Random Function over Ristretto255
//!
//! Construction (DLEQ proof, same shape as ECVRF):
//!
//! ```text
//! H     = hash_to_group(input)
//! Γ     = x·H                              output = SHA-512("out" ‖ Γ)[..32]
//! k     = SHA-512("nonce" ‖ seed ‖ input)  (deterministic, never reused across inputs)
//! c     = SHA-512("chal" ‖ Y ‖ H ‖ Γ ‖ k·G ‖ k·H)
//! s     = k + c·x
//! proof = (Γ, c, s)
//!
//! verify: U = s·G − c·Y,  V = s·H − c·Γ,  c == SHA-512("chal" ‖ Y ‖ H ‖ Γ ‖ U ‖ V)
//! ```
//!
//! Output is unique per (key, input): Γ is fixed by x and H, and the DLEQ proof
//! binds Γ to the same x as the public key Y.

use crate::error::SignatureError;
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;

const DOMAIN_KEY: &[u8] = b"PULSECHAIN_VRF_KEY_V1";
const DOMAIN_H2G: &[u8] = b"PULSECHAIN_VRF_H2G_V1";
const DOMAIN_NONCE: &[u8] = b"PULSECHAIN_VRF_NONCE_V1";
const DOMAIN_CHALLENGE: &[u8] = b"PULSECHAIN_VRF_CHAL_V1";
const DOMAIN_OUTPUT: &[u8] = b"PULSECHAIN_VRF_OUT_V1";

pub const PROOF_LEN: usize = 96;

/// Compressed Ristretto point
pub type VrfPublic = [u8; 32];

// =============================================================================
// OUTPUT / PROOF
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VrfOutput(pub [u8; 32]);

impl VrfOutput {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfProof {
    pub gamma: [u8; 32],
    pub c: [u8; 32],
    pub s: [u8; 32],
}

impl VrfProof {
    pub fn to_bytes(&self) -> [u8; PROOF_LEN] {
        let mut out = [0u8; PROOF_LEN];
        out[..32].copy_from_slice(&self.gamma);
        out[32..64].copy_from_slice(&self.c);
        out[64..].copy_from_slice(&self.s);
        out
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PROOF_LEN {
            return None;
        }
        let mut proof = Self { gamma: [0u8; 32], c: [0u8; 32], s: [0u8; 32] };
        proof.gamma.copy_from_slice(&bytes[..32]);
        proof.c.copy_from_slice(&bytes[32..64]);
        proof.s.copy_from_slice(&bytes[64..]);
        Some(proof)
    }
}

// =============================================================================
// KEYS
// =============================================================================

/// VRF secret key, derived from a 32-byte seed
#[derive(Clone)]
pub struct VrfSecret {
    seed: [u8; 32],
    scalar: Scalar,
    public: RistrettoPoint,
}

impl VrfSecret {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let scalar = scalar_from_hash(&[DOMAIN_KEY, &seed]);
        let public = scalar * RISTRETTO_BASEPOINT_POINT;
        Self { seed, scalar, public }
    }

    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.compress().to_bytes()
    }

    /// Evaluate the VRF on `input`
    pub fn prove(&self, input: &[u8]) -> (VrfOutput, VrfProof) {
        let h = hash_to_group(input);
        let gamma = self.scalar * h;

        let k = scalar_from_hash(&[DOMAIN_NONCE, &self.seed, input]);
        let u = k * RISTRETTO_BASEPOINT_POINT;
        let v = k * h;

        let c = challenge(&self.public, &h, &gamma, &u, &v);
        let s = k + c * self.scalar;

        let proof = VrfProof {
            gamma: gamma.compress().to_bytes(),
            c: c.to_bytes(),
            s: s.to_bytes(),
        };
        (gamma_to_output(&gamma), proof)
    }
}

impl fmt::Debug for VrfSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VrfSecret")
            .field("public", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// VERIFICATION
// =============================================================================

/// Check `proof` against `public_key` and `input`, returning the proven output.
pub fn verify_proof(public_key: &[u8; 32], input: &[u8], proof: &VrfProof) -> Option<VrfOutput> {
    let y = CompressedRistretto(*public_key).decompress()?;
    let gamma = CompressedRistretto(proof.gamma).decompress()?;
    let c: Scalar = Option::from(Scalar::from_canonical_bytes(proof.c))?;
    let s: Scalar = Option::from(Scalar::from_canonical_bytes(proof.s))?;

    let h = hash_to_group(input);
    let u = s * RISTRETTO_BASEPOINT_POINT - c * y;
    let v = s * h - c * gamma;

    if challenge(&y, &h, &gamma, &u, &v) != c {
        return None;
    }
    Some(gamma_to_output(&gamma))
}

/// Verify that `output` is the VRF value of `input` under `public_key`.
pub fn verify(
    output: &VrfOutput,
    proof: &VrfProof,
    input: &[u8],
    public_key: &[u8; 32],
) -> bool {
    verify_proof(public_key, input, proof).is_some_and(|proven| proven == *output)
}

/// Like [`verify`], reporting which node failed
pub fn check(
    node: &crate::types::NodeId,
    output: &VrfOutput,
    proof: &VrfProof,
    input: &[u8],
    public_key: &[u8; 32],
) -> Result<(), SignatureError> {
    if verify(output, proof, input, public_key) {
        Ok(())
    } else {
        Err(SignatureError::VrfProof(node.clone()))
    }
}

// =============================================================================
// INTERNALS
// =============================================================================

fn scalar_from_hash(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let wide: [u8; 64] = hasher.finalize().into();
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn hash_to_group(input: &[u8]) -> RistrettoPoint {
    let mut hasher = Sha512::new();
    hasher.update(DOMAIN_H2G);
    hasher.update(input);
    let wide: [u8; 64] = hasher.finalize().into();
    RistrettoPoint::from_uniform_bytes(&wide)
}

fn challenge(
    y: &RistrettoPoint,
    h: &RistrettoPoint,
    gamma: &RistrettoPoint,
    u: &RistrettoPoint,
    v: &RistrettoPoint,
) -> Scalar {
    scalar_from_hash(&[
        DOMAIN_CHALLENGE,
        y.compress().as_bytes(),
        h.compress().as_bytes(),
        gamma.compress().as_bytes(),
        u.compress().as_bytes(),
        v.compress().as_bytes(),
    ])
}

fn gamma_to_output(gamma: &RistrettoPoint) -> VrfOutput {
    let mut hasher = Sha512::new();
    hasher.update(DOMAIN_OUTPUT);
    hasher.update(gamma.compress().as_bytes());
    let wide = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&wide[..32]);
    VrfOutput(out)
}
