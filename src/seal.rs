//! Sealing disk encryption keys to the TPM.
//!
//! Each container holds two objects created under the SRK: the sealed key and
//! a PIN object whose auth value is the PIN. The sealed key can only be
//! unsealed through a policy session that has proven knowledge of the PIN
//! object's auth value with TPM2_PolicySecret, so changing the PIN only
//! rewrites the PIN object and resealing a key keeps the current PIN.

use crate::keydata::{ContainerError, KeyData};
use crate::policy::{sealed_key_policy, PlaceholderPolicy, PolicyDigestProvider, PolicyError};
use crate::tpm::{
    describe_primary, CleanupError, Device, DeviceError, Escalate, ObjectGuard,
    ParameterEncryption, SessionGuard, SessionKind,
};
use std::path::Path;
use thiserror::Error;
use tss_esapi::attributes::ObjectAttributes;
use tss_esapi::handles::PersistentTpmHandle;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::structures::{Digest, KeyedHashScheme, Public, PublicKeyedHashParameters};
use zeroize::Zeroizing;

/// Size of a sealed key in bytes
pub const KEY_SIZE: usize = 64;
const AUTH_VALUE_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealMode {
    /// Write a new container, refusing to replace an existing file
    Create,
    /// Replace the key in an existing container, keeping its PIN
    Update,
}

#[derive(Error, Debug)]
pub enum SealError {
    #[error("expected a key length of {expected} bytes (got {actual})")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("cannot create new key data file: file already exists")]
    KeyDataExists,
    #[error("cannot open existing key data file to update: {0}")]
    KeyDataNotFoundOrInvalid(#[source] InvalidKeyData),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("{leak}{}", describe_primary(.primary))]
    Cleanup {
        #[source]
        leak: CleanupError,
        primary: Option<Box<SealError>>,
    },
}

/// Why an existing container cannot be updated
#[derive(Error, Debug)]
pub enum InvalidKeyData {
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// The PIN object belongs to another SRK, e.g. from before the TPM was
    /// cleared, so a key sealed behind it could never be unsealed
    #[error("PIN object does not load under the storage root key: {0}")]
    ForeignPin(#[source] DeviceError),
}

#[derive(Error, Debug)]
pub enum UnsealError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("the TPM refused to unseal the key, wrong PIN or boot state: {0}")]
    Authorization(#[source] DeviceError),
    #[error("unsealed {0} bytes, expected {}", KEY_SIZE)]
    UnexpectedLength(usize),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("{leak}{}", describe_primary(.primary))]
    Cleanup {
        #[source]
        leak: CleanupError,
        primary: Option<Box<UnsealError>>,
    },
}

#[derive(Error, Debug)]
pub enum ChangePinError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("the TPM rejected the current PIN: {0}")]
    Authorization(#[source] DeviceError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("{leak}{}", describe_primary(.primary))]
    Cleanup {
        #[source]
        leak: CleanupError,
        primary: Option<Box<ChangePinError>>,
    },
}

macro_rules! impl_escalate {
    ($($error:ident),*) => {
        $(impl Escalate for $error {
            fn cleanup(leak: CleanupError, primary: Option<Self>) -> Self {
                Self::Cleanup {
                    leak,
                    primary: primary.map(Box::new),
                }
            }
        })*
    };
}

impl_escalate!(SealError, UnsealError, ChangePinError);

impl UnsealError {
    fn from_device(error: DeviceError) -> Self {
        match error.is_authorization_failure() {
            true => Self::Authorization(error),
            false => Self::Device(error),
        }
    }
}

impl ChangePinError {
    fn from_device(error: DeviceError) -> Self {
        match error.is_authorization_failure() {
            true => Self::Authorization(error),
            false => Self::Device(error),
        }
    }
}

/// Template of the PIN object: an empty data object whose auth value is the
/// PIN. Dictionary attack protection stays on so guessing is rate limited.
pub fn pin_template() -> Result<Public, tss_esapi::Error> {
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_user_with_auth(true)
        .with_no_da(false)
        .build()?;

    Public::builder()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
        .with_keyed_hash_unique_identifier(Digest::default())
        .build()
}

/// Template of a sealed key. With userWithAuth clear only `policy` can authorize it.
pub fn sealed_key_template(policy: &[u8; 32]) -> Result<Public, tss_esapi::Error> {
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_user_with_auth(false)
        .build()?;

    Public::builder()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_auth_policy(Digest::try_from(policy.to_vec())?)
        .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
        .with_keyed_hash_unique_identifier(Digest::default())
        .build()
}

pub struct KeySealer<'a, D: Device + ?Sized, P = PlaceholderPolicy> {
    device: &'a mut D,
    srk: PersistentTpmHandle,
    policy: P,
}

impl<'a, D: Device + ?Sized> KeySealer<'a, D> {
    pub fn new(device: &'a mut D, srk: PersistentTpmHandle) -> Self {
        Self {
            device,
            srk,
            policy: PlaceholderPolicy,
        }
    }
}

impl<'a, D: Device + ?Sized, P: PolicyDigestProvider> KeySealer<'a, D, P> {
    /// Binds keys to the boot state reported by `policy` instead
    pub fn with_policy<Q: PolicyDigestProvider>(self, policy: Q) -> KeySealer<'a, D, Q> {
        KeySealer {
            device: self.device,
            srk: self.srk,
            policy,
        }
    }

    /// Seals `key` to the TPM and writes the container to `dest`
    pub fn seal(&mut self, dest: &Path, mode: SealMode, key: &[u8]) -> Result<(), SealError> {
        if key.len() != KEY_SIZE {
            return Err(SealError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key.len(),
            });
        }
        let srk = self.srk;
        let pin = match mode {
            SealMode::Update => {
                let existing = KeyData::read_from_file(dest)
                    .map_err(|e| SealError::KeyDataNotFoundOrInvalid(e.into()))?;
                let pin_object = ObjectGuard::load(
                    &mut *self.device,
                    srk,
                    existing.pin_private.clone(),
                    existing.pin_public.clone(),
                )
                .map_err(|e| match e.response_code() {
                    Some(_) => SealError::KeyDataNotFoundOrInvalid(InvalidKeyData::ForeignPin(e)),
                    None => SealError::Device(e),
                })?;
                pin_object
                    .release()
                    .map_err(|leak| SealError::cleanup(leak, None))?;
                Some((existing.pin_private, existing.pin_public))
            }
            SealMode::Create if dest.exists() => return Err(SealError::KeyDataExists),
            SealMode::Create => None,
        };
        let boot_digest = self.policy.boot_digest()?;

        let session = SessionGuard::start(
            &mut *self.device,
            SessionKind::Hmac,
            srk,
            ParameterEncryption::Command,
        )?;
        let key_data = session.run(|device, session| {
            let (pin_private, pin_public) = match pin {
                Some(pin) => pin,
                None => {
                    let template = pin_template().map_err(DeviceError::from)?;
                    device.create(srk, template, &[], &[], Some(session))?
                }
            };
            let policy = sealed_key_policy(&pin_public, &boot_digest).map_err(DeviceError::from)?;
            let template = sealed_key_template(&policy).map_err(DeviceError::from)?;
            let auth_value = Zeroizing::new(device.get_random(AUTH_VALUE_SIZE)?);
            let (key_private, key_public) =
                device.create(srk, template, &auth_value, key, Some(session))?;
            Ok::<_, SealError>(KeyData {
                key_private,
                key_public,
                pin_private,
                pin_public,
            })
        })?;

        match mode {
            SealMode::Create => key_data.write_new(dest).map_err(|e| match e {
                ContainerError::Exists => SealError::KeyDataExists,
                e => e.into(),
            })?,
            SealMode::Update => key_data.replace(dest)?,
        }
        log::info!("Sealed key to {}", dest.display());
        Ok(())
    }

    /// Unseals the key in the container at `source`, authorizing with `pin`
    pub fn unseal(
        &mut self,
        source: &Path,
        pin: &[u8],
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>, UnsealError> {
        let KeyData {
            key_private,
            key_public,
            pin_private,
            pin_public,
        } = KeyData::read_from_file(source)?;
        let boot_digest = self.policy.boot_digest()?;
        let srk = self.srk;

        ObjectGuard::load(&mut *self.device, srk, pin_private, pin_public)?.run(
            |device, pin_object| {
                ObjectGuard::load(device, srk, key_private, key_public)?.run(
                    |device, key_object| {
                        SessionGuard::start(
                            device,
                            SessionKind::Policy,
                            srk,
                            ParameterEncryption::Response,
                        )?
                        .run(|device, session| {
                            SessionGuard::start(
                                device,
                                SessionKind::Hmac,
                                srk,
                                ParameterEncryption::Command,
                            )?
                            .run(|device, auth_session| {
                                device
                                    .policy_secret(
                                        session,
                                        pin_object,
                                        pin,
                                        &boot_digest,
                                        Some(auth_session),
                                    )
                                    .map_err(UnsealError::from_device)
                            })?;
                            let data = device
                                .unseal(key_object, session)
                                .map_err(UnsealError::from_device)?;
                            if data.value().len() != KEY_SIZE {
                                return Err(UnsealError::UnexpectedLength(data.value().len()));
                            }
                            let mut key = Zeroizing::new([0u8; KEY_SIZE]);
                            key.copy_from_slice(data.value());
                            Ok(key)
                        })
                    },
                )
            },
        )
    }

    /// Replaces the PIN of the container at `path`. The file is left as it was
    /// if `old_pin` is wrong.
    pub fn change_pin(
        &mut self,
        path: &Path,
        old_pin: &[u8],
        new_pin: &[u8],
    ) -> Result<(), ChangePinError> {
        let mut key_data = KeyData::read_from_file(path)?;
        let srk = self.srk;

        key_data.pin_private = ObjectGuard::load(
            &mut *self.device,
            srk,
            key_data.pin_private.clone(),
            key_data.pin_public.clone(),
        )?
        .run(|device, pin_object| {
            SessionGuard::start(device, SessionKind::Hmac, srk, ParameterEncryption::Command)?
                .run(|device, session| {
                    device
                        .object_change_auth(pin_object, srk, old_pin, new_pin, Some(session))
                        .map_err(ChangePinError::from_device)
                })
        })?;

        key_data.replace(path)?;
        log::info!("Changed PIN of {}", path.display());
        Ok(())
    }
}
