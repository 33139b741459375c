//! The TPM command surface the provisioning and sealing engines are written against.
//!
//! [`Device`] is an exclusively owned connection to one TPM. Every engine borrows it
//! mutably for the duration of a single operation, so there is never more than one
//! high level operation in flight per connection.

use std::fmt;
use thiserror::Error;
use tss_esapi::constants::PropertyTag;
use tss_esapi::handles::PersistentTpmHandle;
use tss_esapi::structures::{Private, Public, SensitiveData};

pub mod guard;
#[cfg(test)]
pub(crate) mod mock;
pub mod tss;

pub use guard::{describe_primary, CleanupError, Escalate, ObjectGuard, SessionGuard};
pub use tss::TssDevice;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("cannot connect to TPM: {0}")]
    Connection(#[source] tss_esapi::Error),
    #[error("TPM returned {0}")]
    Response(ResponseCode),
    #[error("failed to create auth session")]
    AuthSessionCreate,
    #[error("no loaded {0} with handle {1:#010x}")]
    UnknownHandle(&'static str, u32),
    #[error(transparent)]
    TssEsapi(tss_esapi::Error),
}

impl DeviceError {
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Self::Response(rc) => Some(*rc),
            _ => None,
        }
    }

    /// The TPM rejected an authorization value or policy
    pub fn is_authorization_failure(&self) -> bool {
        self.response_code()
            .map_or(false, ResponseCode::is_authorization_failure)
    }
}

impl From<tss_esapi::Error> for DeviceError {
    fn from(error: tss_esapi::Error) -> Self {
        match error {
            tss_esapi::Error::Tss2Error(rc) => Self::Response(ResponseCode::new(rc.into())),
            other => Self::TssEsapi(other),
        }
    }
}

pub type Result<T, E = DeviceError> = core::result::Result<T, E>;

/// A TPM response code, reduced to the parts the engines act upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(u32);

const RC_FMT1: u32 = 0x080;

impl ResponseCode {
    pub const DISABLED: Self = Self(0x120);
    pub const AUTH_FAIL: Self = Self(0x98e);
    pub const BAD_AUTH: Self = Self(0x9a2);
    pub const POLICY_FAIL: Self = Self(0x99d);
    pub const HANDLE: Self = Self(0x18b);
    pub const INTEGRITY: Self = Self(0x19f);
    pub const VALUE: Self = Self(0x184);
    pub const NV_DEFINED: Self = Self(0x14c);
    pub const LOCKOUT: Self = Self(0x921);
    pub const OBJECT_MEMORY: Self = Self(0x902);
    pub const SESSION_MEMORY: Self = Self(0x903);

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Strips the TSS layer and the handle/session/parameter number
    fn base(self) -> u32 {
        let rc = self.0 & 0xffff;
        if rc & RC_FMT1 != 0 {
            (rc & 0x3f) | RC_FMT1
        } else {
            rc & 0x97f
        }
    }

    pub fn is_disabled(self) -> bool {
        self.base() == Self::DISABLED.base()
    }

    pub fn is_authorization_failure(self) -> bool {
        [Self::AUTH_FAIL, Self::BAD_AUTH, Self::POLICY_FAIL]
            .iter()
            .any(|rc| rc.base() == self.base())
    }

    pub fn is_lockout(self) -> bool {
        self.base() == Self::LOCKOUT.base()
    }

    pub fn is_handle(self) -> bool {
        self.base() == Self::HANDLE.base()
    }

    fn name(self) -> Option<&'static str> {
        [
            (Self::DISABLED, "TPM_RC_DISABLED"),
            (Self::AUTH_FAIL, "TPM_RC_AUTH_FAIL"),
            (Self::BAD_AUTH, "TPM_RC_BAD_AUTH"),
            (Self::POLICY_FAIL, "TPM_RC_POLICY_FAIL"),
            (Self::HANDLE, "TPM_RC_HANDLE"),
            (Self::INTEGRITY, "TPM_RC_INTEGRITY"),
            (Self::VALUE, "TPM_RC_VALUE"),
            (Self::NV_DEFINED, "TPM_RC_NV_DEFINED"),
            (Self::LOCKOUT, "TPM_RC_LOCKOUT"),
            (Self::OBJECT_MEMORY, "TPM_RC_OBJECT_MEMORY"),
            (Self::SESSION_MEMORY, "TPM_RC_SESSION_MEMORY"),
        ]
        .into_iter()
        .find_map(|(rc, name)| (rc.base() == self.base()).then_some(name))
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({:#x})", name, self.0),
            None => write!(f, "response code {:#x}", self.0),
        }
    }
}

/// The four TPM authorization domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hierarchy {
    Owner,
    Endorsement,
    Platform,
    Lockout,
}

impl Hierarchy {
    /// The permanent TPM_RH handle of the hierarchy
    pub fn handle(self) -> u32 {
        match self {
            Hierarchy::Owner => 0x4000_0001,
            Hierarchy::Lockout => 0x4000_000a,
            Hierarchy::Endorsement => 0x4000_000b,
            Hierarchy::Platform => 0x4000_000c,
        }
    }
}

/// A transient object loaded in the TPM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransientHandle(u32);

impl TransientHandle {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

/// A loaded authorization session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u32);

impl SessionHandle {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Hmac,
    Policy,
}

/// Which direction of the command stream a session encrypts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterEncryption {
    /// The first command parameter (e.g. the sensitive area of TPM2_Create)
    Command,
    /// The first response parameter (e.g. the output of TPM2_Unseal)
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Transient,
    LoadedSession,
}

/// Dictionary attack lockout parameters, set and queried as a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct DaParameters {
    pub max_auth_fail: u32,
    pub recovery_time: u32,
    pub lockout_recovery_time: u32,
}

/// An open connection to a TPM.
///
/// Methods map onto single TPM commands. Owner hierarchy authorization for
/// object creation and persistence always uses the empty auth value; the
/// hierarchy commands take the auth value explicitly.
pub trait Device {
    fn clear(&mut self, auth: Hierarchy, auth_value: &[u8]) -> Result<()>;

    fn clear_control(&mut self, auth: Hierarchy, auth_value: &[u8], disable: bool) -> Result<()>;

    fn hierarchy_change_auth(
        &mut self,
        hierarchy: Hierarchy,
        auth_value: &[u8],
        new_auth_value: &[u8],
    ) -> Result<()>;

    fn dictionary_attack_parameters(
        &mut self,
        lockout_auth: &[u8],
        parameters: &DaParameters,
    ) -> Result<()>;

    fn property(&mut self, tag: PropertyTag) -> Result<Option<u32>>;

    /// Number of handles of `kind` currently held by the TPM
    fn loaded_handle_count(&mut self, kind: HandleKind) -> Result<usize>;

    /// The public area and qualified name of the object at `handle`, if one
    /// is persisted there
    fn read_public(&mut self, handle: PersistentTpmHandle) -> Result<Option<(Public, Vec<u8>)>>;

    fn create_primary(&mut self, hierarchy: Hierarchy, template: Public)
        -> Result<(TransientHandle, Public)>;

    /// Makes a copy of a transient object persistent at `handle`
    fn persist(&mut self, object: TransientHandle, handle: PersistentTpmHandle) -> Result<()>;

    fn evict(&mut self, handle: PersistentTpmHandle) -> Result<()>;

    fn create(
        &mut self,
        parent: PersistentTpmHandle,
        template: Public,
        auth_value: &[u8],
        data: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<(Private, Public)>;

    fn load(
        &mut self,
        parent: PersistentTpmHandle,
        private: Private,
        public: Public,
    ) -> Result<TransientHandle>;

    fn flush_object(&mut self, object: TransientHandle) -> Result<()>;

    /// Starts a session salted with `salt_key`, using AES-128-CFB and SHA-256
    fn start_session(
        &mut self,
        kind: SessionKind,
        salt_key: PersistentTpmHandle,
        encryption: ParameterEncryption,
    ) -> Result<SessionHandle>;

    fn flush_session(&mut self, session: SessionHandle) -> Result<()>;

    /// TPM2_PolicySecret against `auth_object`, authorized with `auth_value`.
    ///
    /// With an HMAC `auth_session` the auth value only enters the session
    /// HMAC, otherwise it is sent as a password.
    fn policy_secret(
        &mut self,
        session: SessionHandle,
        auth_object: TransientHandle,
        auth_value: &[u8],
        policy_ref: &[u8],
        auth_session: Option<SessionHandle>,
    ) -> Result<()>;

    fn unseal(&mut self, object: TransientHandle, session: SessionHandle) -> Result<SensitiveData>;

    /// Returns a new private area for `object` carrying `new_auth_value`.
    /// `new_auth_value` is only encrypted when `session` is an HMAC session
    /// with command encryption.
    fn object_change_auth(
        &mut self,
        object: TransientHandle,
        parent: PersistentTpmHandle,
        auth_value: &[u8],
        new_auth_value: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<Private>;

    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>>;
}
