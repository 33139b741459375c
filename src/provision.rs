//! Brings a TPM into the state the sealing engine expects and reports how far
//! a TPM is from that state.

use crate::policy;
use crate::tpm::{
    describe_primary, CleanupError, DaParameters, Device, DeviceError, Escalate, Hierarchy,
    ObjectGuard,
};
use bitflags::bitflags;
use thiserror::Error;
use tss_esapi::attributes::ObjectAttributes;
use tss_esapi::constants::PropertyTag;
use tss_esapi::handles::PersistentTpmHandle;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::structures::{
    Public, PublicKeyRsa, PublicRsaParametersBuilder, RsaExponent, SymmetricDefinitionObject,
};

const PERMANENT_LOCKOUT_AUTH_SET: u32 = 1 << 2;
const PERMANENT_DISABLE_CLEAR: u32 = 1 << 8;
const SRK_MODULUS_BYTES: usize = 256;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProvisionStatus: u8 {
        /// A key matching the SRK template is persisted at the SRK handle
        const VALID_SRK = 1 << 0;
        /// The DA lockout parameters are the configured ones
        const DA_PARAMS_OK = 1 << 1;
        /// TPM2_Clear through the lockout hierarchy is disabled
        const OWNER_CLEAR_DISABLED = 1 << 2;
        const LOCKOUT_AUTH_SET = 1 << 3;
    }
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("clearing the TPM is disabled and needs physical presence, see `request-clear`")]
    ClearRequiresPhysicalPresence,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("{leak}{}", describe_primary(.primary))]
    Cleanup {
        #[source]
        leak: CleanupError,
        primary: Option<Box<ProvisionError>>,
    },
}

impl Escalate for ProvisionError {
    fn cleanup(leak: CleanupError, primary: Option<Self>) -> Self {
        Self::Cleanup {
            leak,
            primary: primary.map(Box::new),
        }
    }
}

/// Template of the storage root key: a restricted RSA 2048 decryption key
pub fn srk_template() -> Result<Public, tss_esapi::Error> {
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .with_sign_encrypt(false)
        .with_restricted(true)
        .build()?;

    Public::builder()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(
            PublicRsaParametersBuilder::new_restricted_decryption_key(
                SymmetricDefinitionObject::AES_128_CFB,
                RsaKeyBits::Rsa2048,
                RsaExponent::default(),
            )
            .build()?,
        )
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()
}

/// Compares everything but the unique field, which only has to be of the right size
fn matches_template(public: &Public, template: &Public) -> bool {
    match (public, template) {
        (
            Public::Rsa {
                object_attributes,
                name_hashing_algorithm,
                auth_policy,
                parameters,
                unique,
            },
            Public::Rsa {
                object_attributes: template_attributes,
                name_hashing_algorithm: template_name_hashing_algorithm,
                auth_policy: template_auth_policy,
                parameters: template_parameters,
                ..
            },
        ) => {
            object_attributes == template_attributes
                && name_hashing_algorithm == template_name_hashing_algorithm
                && auth_policy == template_auth_policy
                && parameters == template_parameters
                && unique.value().len() == SRK_MODULUS_BYTES
        }
        _ => false,
    }
}

pub struct Provisioner<'a, D: Device + ?Sized> {
    device: &'a mut D,
    srk: PersistentTpmHandle,
    lockout: DaParameters,
}

impl<'a, D: Device + ?Sized> Provisioner<'a, D> {
    pub fn new(device: &'a mut D, srk: PersistentTpmHandle, lockout: DaParameters) -> Self {
        Self {
            device,
            srk,
            lockout,
        }
    }

    /// Clears the TPM, creates the SRK, sets the DA parameters, sets the lockout
    /// auth value to `lockout_auth` and disables further clears.
    ///
    /// `lockout_auth` is also presented to authorize the clear when the TPM
    /// reports a lockout auth value is already set.
    pub fn provision(&mut self, lockout_auth: &[u8]) -> Result<(), ProvisionError> {
        let permanent = self.permanent()?;
        if permanent & PERMANENT_DISABLE_CLEAR != 0 {
            return Err(ProvisionError::ClearRequiresPhysicalPresence);
        }
        let clear_auth = match permanent & PERMANENT_LOCKOUT_AUTH_SET {
            0 => &[][..],
            _ => lockout_auth,
        };
        match self.device.clear(Hierarchy::Lockout, clear_auth) {
            Err(e) if e.response_code().map_or(false, |rc| rc.is_disabled()) => {
                return Err(ProvisionError::ClearRequiresPhysicalPresence)
            }
            result => result?,
        }
        log::info!("Cleared TPM");

        if self.device.read_public(self.srk)?.is_some() {
            log::debug!("Evicting object at {:?}", self.srk);
            self.device.evict(self.srk)?;
        }
        let srk = self.srk;
        let template = srk_template().map_err(DeviceError::from)?;
        let (primary, _) = ObjectGuard::create_primary(&mut *self.device, Hierarchy::Owner, template)?;
        primary.run(|device, handle| Ok::<_, ProvisionError>(device.persist(handle, srk)?))?;
        log::info!("Persisted storage root key at {:?}", srk);

        self.device.dictionary_attack_parameters(&[], &self.lockout)?;
        self.device
            .hierarchy_change_auth(Hierarchy::Lockout, &[], lockout_auth)?;
        self.device
            .clear_control(Hierarchy::Lockout, lockout_auth, true)?;
        log::info!("Set DA parameters and lockout auth, disabled clear");
        Ok(())
    }

    /// Evaluates every flag against the TPM as it is now
    pub fn status(&mut self) -> Result<ProvisionStatus, ProvisionError> {
        let mut status = ProvisionStatus::empty();
        if self.srk_valid()? {
            status |= ProvisionStatus::VALID_SRK;
        }
        if self.da_parameters()? == Some(self.lockout) {
            status |= ProvisionStatus::DA_PARAMS_OK;
        }
        let permanent = self.permanent()?;
        if permanent & PERMANENT_DISABLE_CLEAR != 0 {
            status |= ProvisionStatus::OWNER_CLEAR_DISABLED;
        }
        if permanent & PERMANENT_LOCKOUT_AUTH_SET != 0 {
            status |= ProvisionStatus::LOCKOUT_AUTH_SET;
        }
        Ok(status)
    }

    fn permanent(&mut self) -> Result<u32, ProvisionError> {
        Ok(self.device.property(PropertyTag::Permanent)?.unwrap_or(0))
    }

    fn da_parameters(&mut self) -> Result<Option<DaParameters>, ProvisionError> {
        let max_auth_fail = self.device.property(PropertyTag::MaxAuthFail)?;
        let recovery_time = self.device.property(PropertyTag::LockoutInterval)?;
        let lockout_recovery_time = self.device.property(PropertyTag::LockoutRecovery)?;
        Ok(match (max_auth_fail, recovery_time, lockout_recovery_time) {
            (Some(max_auth_fail), Some(recovery_time), Some(lockout_recovery_time)) => {
                Some(DaParameters {
                    max_auth_fail,
                    recovery_time,
                    lockout_recovery_time,
                })
            }
            _ => None,
        })
    }

    fn srk_valid(&mut self) -> Result<bool, ProvisionError> {
        let (public, qualified_name) = match self.device.read_public(self.srk)? {
            Some(found) => found,
            None => return Ok(false),
        };
        let template = srk_template().map_err(DeviceError::from)?;
        if !matches_template(&public, &template) {
            return Ok(false);
        }

        // A key created from the same template under some other parent matches
        // as well, only a primary of the owner hierarchy has this qualified name
        let name = policy::object_name(&public).map_err(DeviceError::from)?;
        let expected = policy::qualified_name(&Hierarchy::Owner.handle().to_be_bytes(), &name);
        if qualified_name != expected {
            log::debug!("Object at {:?} is not a primary key of the owner hierarchy", self.srk);
        }
        Ok(qualified_name == expected)
    }
}
