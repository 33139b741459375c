//! Authorization policy for sealed key objects.
//!
//! A sealed key can only be unsealed through a policy session that has
//! satisfied TPM2_PolicySecret against the PIN object, with the boot state
//! digest as the policy reference. The digest is computed in software so no
//! trial session is needed.

use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tss_esapi::structures::Public;
use tss_esapi::traits::Marshall;

/// TPM_CC_PolicySecret
const CC_POLICY_SECRET: u32 = 0x0000_0151;
/// TPM_ALG_SHA256, prefixed to object names
const ALG_SHA256: u16 = 0x000b;

pub const DIGEST_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("cannot compute boot state digest: {0}")]
    BootDigest(String),
}

/// Source of the boot state measurement sealed keys are bound to
pub trait PolicyDigestProvider {
    fn boot_digest(&self) -> Result<[u8; DIGEST_SIZE], PolicyError>;
}

/// Binds keys to no boot state at all. Stands in until measured boot
/// support lands.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderPolicy;

impl PolicyDigestProvider for PlaceholderPolicy {
    fn boot_digest(&self) -> Result<[u8; DIGEST_SIZE], PolicyError> {
        Ok([0; DIGEST_SIZE])
    }
}

/// TPM name of an object: nameAlg || H(TPMT_PUBLIC)
pub fn object_name(public: &Public) -> Result<Vec<u8>, tss_esapi::Error> {
    let mut name = ALG_SHA256.to_be_bytes().to_vec();
    name.extend_from_slice(&Sha256::digest(public.marshall()?));
    Ok(name)
}

/// Qualified name of an object: nameAlg || H(parent qualified name || name).
/// The qualified name of a hierarchy is its handle.
pub fn qualified_name(parent_qualified_name: &[u8], name: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(parent_qualified_name);
    hasher.update(name);
    let mut qualified_name = ALG_SHA256.to_be_bytes().to_vec();
    qualified_name.extend_from_slice(&hasher.finalize());
    qualified_name
}

/// Applies TPM2_PolicySecret to a running policy digest
pub fn extend_policy_secret(
    digest: &[u8; DIGEST_SIZE],
    auth_name: &[u8],
    policy_ref: &[u8],
) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(digest);
    hasher.update(CC_POLICY_SECRET.to_be_bytes());
    hasher.update(auth_name);
    let intermediate = hasher.finalize();

    let mut hasher = Sha256::new();
    hasher.update(intermediate);
    hasher.update(policy_ref);
    hasher.finalize().into()
}

/// authPolicy of a key sealed behind the PIN object `pin_public`
pub fn sealed_key_policy(
    pin_public: &Public,
    boot_digest: &[u8; DIGEST_SIZE],
) -> Result<[u8; DIGEST_SIZE], tss_esapi::Error> {
    let name = object_name(pin_public)?;
    Ok(extend_policy_secret(&[0; DIGEST_SIZE], &name, boot_digest))
}
