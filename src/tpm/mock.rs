//! In-memory stand-in for a TPM, modelling the behaviour the engines rely on:
//! hierarchy auth values, the disableClear flag, DA counters, limited object and
//! session slots, PolicySecret digests and the binding of blobs to the SRK seed.

use super::{
    DaParameters, Device, DeviceError, HandleKind, Hierarchy, ParameterEncryption,
    ResponseCode, Result, SessionHandle, SessionKind, TransientHandle,
};
use crate::config::{Config, DEFAULT_LOCKOUT};
use crate::policy;
use crate::provision::Provisioner;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use tss_esapi::attributes::ObjectAttributes;
use tss_esapi::constants::PropertyTag;
use tss_esapi::handles::PersistentTpmHandle;
use tss_esapi::structures::{Digest, Private, Public, PublicKeyRsa, SensitiveData};

const MAX_LOADED_OBJECTS: usize = 3;
const MAX_LOADED_SESSIONS: usize = 3;
const MAX_SENSITIVE_DATA: usize = 128;
const MAX_AUTH_VALUE: usize = 32;

const TRANSIENT_FIRST: u32 = 0x8000_0000;
const HMAC_SESSION_FIRST: u32 = 0x0200_0000;
const POLICY_SESSION_FIRST: u32 = 0x0300_0000;

const PERMANENT_OWNER_AUTH_SET: u32 = 1 << 0;
const PERMANENT_ENDORSEMENT_AUTH_SET: u32 = 1 << 1;
const PERMANENT_LOCKOUT_AUTH_SET: u32 = 1 << 2;
const PERMANENT_DISABLE_CLEAR: u32 = 1 << 8;

fn fail<T>(rc: ResponseCode) -> Result<T> {
    Err(DeviceError::Response(rc))
}

#[derive(Clone)]
struct MockObject {
    public: Public,
    sensitive: Vec<u8>,
    auth: Vec<u8>,
    /// Seed of the object, children are bound to it
    seed: [u8; 32],
    qualified_name: Vec<u8>,
}

/// Contents of a private blob handed out by `create`
#[derive(Clone)]
struct Wrapped {
    public: Public,
    sensitive: Vec<u8>,
    auth: Vec<u8>,
    parent_seed: [u8; 32],
}

struct MockSession {
    kind: SessionKind,
    encryption: ParameterEncryption,
    digest: [u8; 32],
}

pub(crate) struct MockDevice {
    owner_seed: [u8; 32],
    auth: HashMap<Hierarchy, Vec<u8>>,
    disable_clear: bool,
    hide_disable_clear: bool,
    da: DaParameters,
    failed_tries: u32,
    persistent: HashMap<u32, MockObject>,
    transient: HashMap<u32, MockObject>,
    sessions: HashMap<u32, MockSession>,
    wrapped: HashMap<Vec<u8>, Wrapped>,
    next_handle: u32,
    counter: u64,
    fail_next_flush: bool,
    cleartext_secrets: usize,
}

impl MockDevice {
    /// A freshly cleared TPM with simulator default DA parameters
    pub fn new() -> Self {
        let mut device = Self {
            owner_seed: [0; 32],
            auth: HashMap::new(),
            disable_clear: false,
            hide_disable_clear: false,
            da: DaParameters {
                max_auth_fail: 3,
                recovery_time: 1000,
                lockout_recovery_time: 1000,
            },
            failed_tries: 0,
            persistent: HashMap::new(),
            transient: HashMap::new(),
            sessions: HashMap::new(),
            wrapped: HashMap::new(),
            next_handle: 0,
            counter: 0,
            fail_next_flush: false,
            cleartext_secrets: 0,
        };
        device.owner_seed = device.random32();
        device
    }

    /// A TPM provisioned with an empty lockout auth value
    pub fn provisioned() -> Self {
        let mut device = Self::new();
        let srk = device.srk_handle();
        Provisioner::new(&mut device, srk, DEFAULT_LOCKOUT)
            .provision(b"")
            .expect("provisioning the mock device");
        device
    }

    pub fn srk_handle(&self) -> PersistentTpmHandle {
        Config::default().srk().expect("default SRK handle")
    }

    /// Makes the next flush of an object or session fail
    pub fn fail_next_flush(&mut self) {
        self.fail_next_flush = true;
    }

    /// Leaves disableClear out of TPMA_PERMANENT while it stays in effect
    pub fn hide_disable_clear(&mut self) {
        self.hide_disable_clear = true;
    }

    /// What the firmware does for a physical presence clear request
    pub fn platform_clear(&mut self) {
        self.disable_clear = false;
        self.reset_owner();
    }

    /// Number of secrets that crossed the command channel without parameter encryption
    pub fn cleartext_secrets(&self) -> usize {
        self.cleartext_secrets
    }

    pub fn failed_tries(&self) -> u32 {
        self.failed_tries
    }

    fn reset_owner(&mut self) {
        for hierarchy in [Hierarchy::Owner, Hierarchy::Endorsement, Hierarchy::Lockout] {
            self.auth.remove(&hierarchy);
        }
        self.owner_seed = self.random32();
        self.persistent.clear();
        self.transient.clear();
        self.failed_tries = 0;
    }

    fn random32(&mut self) -> [u8; 32] {
        self.counter += 1;
        Sha256::digest(self.counter.to_be_bytes()).into()
    }

    fn next_handle(&mut self, first: u32) -> u32 {
        self.next_handle += 1;
        first + self.next_handle
    }

    fn authorize(&self, hierarchy: Hierarchy, auth_value: &[u8]) -> Result<()> {
        let expected = self.auth.get(&hierarchy).map(Vec::as_slice).unwrap_or(&[]);
        if expected == auth_value {
            Ok(())
        } else {
            fail(ResponseCode::BAD_AUTH)
        }
    }

    fn in_lockout(&self) -> bool {
        self.da.max_auth_fail == 0 || self.failed_tries >= self.da.max_auth_fail
    }

    fn authorize_object(&mut self, object: &MockObject, auth_value: &[u8]) -> Result<()> {
        let da_protected = !attributes(&object.public).no_da();
        if da_protected && self.in_lockout() {
            return fail(ResponseCode::LOCKOUT);
        }
        if object.auth == auth_value {
            return Ok(());
        }
        if da_protected {
            self.failed_tries += 1;
        }
        fail(ResponseCode::AUTH_FAIL)
    }

    fn persistent(&self, handle: PersistentTpmHandle) -> Result<&MockObject> {
        let handle: u32 = handle.into();
        self.persistent
            .get(&handle)
            .map_or_else(|| fail(ResponseCode::HANDLE), Ok)
    }

    fn transient(&self, handle: TransientHandle) -> Result<&MockObject> {
        self.transient
            .get(&handle.value())
            .map_or_else(|| fail(ResponseCode::HANDLE), Ok)
    }

    fn insert_transient(&mut self, object: MockObject) -> Result<TransientHandle> {
        if self.transient.len() >= MAX_LOADED_OBJECTS {
            return fail(ResponseCode::OBJECT_MEMORY);
        }
        let handle = self.next_handle(TRANSIENT_FIRST);
        self.transient.insert(handle, object);
        Ok(TransientHandle::new(handle))
    }

    fn session(&self, session: SessionHandle) -> Result<&MockSession> {
        self.sessions
            .get(&session.value())
            .map_or_else(|| fail(ResponseCode::HANDLE), Ok)
    }

    /// Whether the first command parameter travels encrypted
    fn encrypts_command(&self, session: Option<SessionHandle>) -> Result<bool> {
        Ok(match session {
            Some(session) => {
                let session = self.session(session)?;
                session.kind == SessionKind::Hmac
                    && session.encryption == ParameterEncryption::Command
            }
            None => false,
        })
    }

    fn take_flush_failure(&mut self) -> Result<()> {
        if std::mem::take(&mut self.fail_next_flush) {
            return fail(ResponseCode::HANDLE);
        }
        Ok(())
    }
}

fn attributes(public: &Public) -> ObjectAttributes {
    match public {
        Public::Rsa {
            object_attributes, ..
        }
        | Public::KeyedHash {
            object_attributes, ..
        }
        | Public::Ecc {
            object_attributes, ..
        }
        | Public::SymCipher {
            object_attributes, ..
        } => *object_attributes,
    }
}

fn auth_policy(public: &Public) -> &[u8] {
    match public {
        Public::Rsa { auth_policy, .. }
        | Public::KeyedHash { auth_policy, .. }
        | Public::Ecc { auth_policy, .. }
        | Public::SymCipher { auth_policy, .. } => auth_policy.value(),
    }
}

/// Fills in the unique field the way the TPM derives it from the object's seed
fn with_unique(template: Public, seed: &[u8; 32]) -> Result<Public> {
    match template {
        Public::Rsa {
            object_attributes,
            name_hashing_algorithm,
            auth_policy,
            parameters,
            ..
        } => Ok(Public::Rsa {
            object_attributes,
            name_hashing_algorithm,
            auth_policy,
            parameters,
            unique: PublicKeyRsa::try_from(seed.repeat(8))?,
        }),
        Public::KeyedHash {
            object_attributes,
            name_hashing_algorithm,
            auth_policy,
            parameters,
            ..
        } => Ok(Public::KeyedHash {
            object_attributes,
            name_hashing_algorithm,
            auth_policy,
            parameters,
            unique: Digest::try_from(seed.to_vec())?,
        }),
        _ => fail(ResponseCode::VALUE),
    }
}

impl Device for MockDevice {
    fn clear(&mut self, auth: Hierarchy, auth_value: &[u8]) -> Result<()> {
        if !matches!(auth, Hierarchy::Lockout | Hierarchy::Platform) {
            return fail(ResponseCode::VALUE);
        }
        self.authorize(auth, auth_value)?;
        if self.disable_clear {
            return fail(ResponseCode::DISABLED);
        }
        self.reset_owner();
        Ok(())
    }

    fn clear_control(&mut self, auth: Hierarchy, auth_value: &[u8], disable: bool) -> Result<()> {
        match auth {
            Hierarchy::Lockout | Hierarchy::Platform => self.authorize(auth, auth_value)?,
            _ => return fail(ResponseCode::VALUE),
        }
        if auth == Hierarchy::Lockout && !disable {
            return fail(ResponseCode::AUTH_FAIL);
        }
        self.disable_clear = disable;
        Ok(())
    }

    fn hierarchy_change_auth(
        &mut self,
        hierarchy: Hierarchy,
        auth_value: &[u8],
        new_auth_value: &[u8],
    ) -> Result<()> {
        self.authorize(hierarchy, auth_value)?;
        if new_auth_value.len() > MAX_AUTH_VALUE {
            return fail(ResponseCode::VALUE);
        }
        self.auth.insert(hierarchy, new_auth_value.to_vec());
        Ok(())
    }

    fn dictionary_attack_parameters(
        &mut self,
        lockout_auth: &[u8],
        parameters: &DaParameters,
    ) -> Result<()> {
        self.authorize(Hierarchy::Lockout, lockout_auth)?;
        self.da = *parameters;
        Ok(())
    }

    fn property(&mut self, tag: PropertyTag) -> Result<Option<u32>> {
        let value = match tag {
            PropertyTag::MaxAuthFail => self.da.max_auth_fail,
            PropertyTag::LockoutInterval => self.da.recovery_time,
            PropertyTag::LockoutRecovery => self.da.lockout_recovery_time,
            PropertyTag::LockoutCounter => self.failed_tries,
            PropertyTag::Permanent => {
                let set = |hierarchy| self.auth.get(&hierarchy).map_or(false, |a| !a.is_empty());
                let mut permanent = 0;
                if set(Hierarchy::Owner) {
                    permanent |= PERMANENT_OWNER_AUTH_SET;
                }
                if set(Hierarchy::Endorsement) {
                    permanent |= PERMANENT_ENDORSEMENT_AUTH_SET;
                }
                if set(Hierarchy::Lockout) {
                    permanent |= PERMANENT_LOCKOUT_AUTH_SET;
                }
                if self.disable_clear && !self.hide_disable_clear {
                    permanent |= PERMANENT_DISABLE_CLEAR;
                }
                permanent
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn loaded_handle_count(&mut self, kind: HandleKind) -> Result<usize> {
        Ok(match kind {
            HandleKind::Transient => self.transient.len(),
            HandleKind::LoadedSession => self.sessions.len(),
        })
    }

    fn read_public(&mut self, handle: PersistentTpmHandle) -> Result<Option<(Public, Vec<u8>)>> {
        let handle: u32 = handle.into();
        Ok(self
            .persistent
            .get(&handle)
            .map(|o| (o.public.clone(), o.qualified_name.clone())))
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: Public,
    ) -> Result<(TransientHandle, Public)> {
        self.authorize(hierarchy, &[])?;
        let mut hasher = Sha256::new();
        hasher.update(self.owner_seed);
        hasher.update(format!("{:?}", template));
        let seed: [u8; 32] = hasher.finalize().into();
        let public = with_unique(template, &seed)?;
        let qualified_name = policy::qualified_name(
            &hierarchy.handle().to_be_bytes(),
            &policy::object_name(&public)?,
        );
        let handle = self.insert_transient(MockObject {
            public: public.clone(),
            sensitive: Vec::new(),
            auth: Vec::new(),
            seed,
            qualified_name,
        })?;
        Ok((handle, public))
    }

    fn persist(&mut self, object: TransientHandle, handle: PersistentTpmHandle) -> Result<()> {
        self.authorize(Hierarchy::Owner, &[])?;
        let object = self.transient(object)?.clone();
        let handle: u32 = handle.into();
        if self.persistent.contains_key(&handle) {
            return fail(ResponseCode::NV_DEFINED);
        }
        self.persistent.insert(handle, object);
        Ok(())
    }

    fn evict(&mut self, handle: PersistentTpmHandle) -> Result<()> {
        self.authorize(Hierarchy::Owner, &[])?;
        let handle: u32 = handle.into();
        self.persistent
            .remove(&handle)
            .map(|_| ())
            .map_or_else(|| fail(ResponseCode::HANDLE), Ok)
    }

    fn create(
        &mut self,
        parent: PersistentTpmHandle,
        template: Public,
        auth_value: &[u8],
        data: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<(Private, Public)> {
        let parent_seed = self.persistent(parent)?.seed;
        let encrypted = self.encrypts_command(session)?;
        if data.len() > MAX_SENSITIVE_DATA || auth_value.len() > MAX_AUTH_VALUE {
            return fail(ResponseCode::VALUE);
        }
        if !encrypted && !data.is_empty() {
            self.cleartext_secrets += 1;
        }
        let unique = self.random32();
        let public = with_unique(template, &unique)?;
        let blob = [self.random32(), self.random32()].concat();
        self.wrapped.insert(
            blob.clone(),
            Wrapped {
                public: public.clone(),
                sensitive: data.to_vec(),
                auth: auth_value.to_vec(),
                parent_seed,
            },
        );
        Ok((Private::try_from(blob)?, public))
    }

    fn load(
        &mut self,
        parent: PersistentTpmHandle,
        private: Private,
        public: Public,
    ) -> Result<TransientHandle> {
        let parent = self.persistent(parent)?;
        let (parent_seed, parent_qualified_name) = (parent.seed, parent.qualified_name.clone());
        let wrapped = match self.wrapped.get(private.value()) {
            Some(w) if w.parent_seed == parent_seed && w.public == public => w.clone(),
            _ => return fail(ResponseCode::INTEGRITY),
        };
        let seed = self.random32();
        let qualified_name =
            policy::qualified_name(&parent_qualified_name, &policy::object_name(&wrapped.public)?);
        self.insert_transient(MockObject {
            public: wrapped.public,
            sensitive: wrapped.sensitive,
            auth: wrapped.auth,
            seed,
            qualified_name,
        })
    }

    fn flush_object(&mut self, object: TransientHandle) -> Result<()> {
        self.take_flush_failure()?;
        self.transient
            .remove(&object.value())
            .map(|_| ())
            .map_or_else(|| fail(ResponseCode::HANDLE), Ok)
    }

    fn start_session(
        &mut self,
        kind: SessionKind,
        salt_key: PersistentTpmHandle,
        encryption: ParameterEncryption,
    ) -> Result<SessionHandle> {
        self.persistent(salt_key)?;
        if self.sessions.len() >= MAX_LOADED_SESSIONS {
            return fail(ResponseCode::SESSION_MEMORY);
        }
        let handle = self.next_handle(match kind {
            SessionKind::Hmac => HMAC_SESSION_FIRST,
            SessionKind::Policy => POLICY_SESSION_FIRST,
        });
        self.sessions.insert(
            handle,
            MockSession {
                kind,
                encryption,
                digest: [0; 32],
            },
        );
        Ok(SessionHandle::new(handle))
    }

    fn flush_session(&mut self, session: SessionHandle) -> Result<()> {
        self.take_flush_failure()?;
        self.sessions
            .remove(&session.value())
            .map(|_| ())
            .map_or_else(|| fail(ResponseCode::HANDLE), Ok)
    }

    fn policy_secret(
        &mut self,
        session: SessionHandle,
        auth_object: TransientHandle,
        auth_value: &[u8],
        policy_ref: &[u8],
        auth_session: Option<SessionHandle>,
    ) -> Result<()> {
        let object = self.transient(auth_object)?.clone();
        if self.session(session)?.kind != SessionKind::Policy {
            return fail(ResponseCode::VALUE);
        }
        match auth_session {
            Some(auth_session) if self.session(auth_session)?.kind == SessionKind::Hmac => {}
            Some(_) => return fail(ResponseCode::VALUE),
            None => self.cleartext_secrets += 1,
        }
        self.authorize_object(&object, auth_value)?;
        let name = policy::object_name(&object.public)?;
        if let Some(s) = self.sessions.get_mut(&session.value()) {
            s.digest = policy::extend_policy_secret(&s.digest, &name, policy_ref);
        }
        Ok(())
    }

    fn unseal(&mut self, object: TransientHandle, session: SessionHandle) -> Result<SensitiveData> {
        let object = self.transient(object)?.clone();
        let session = match self.sessions.get(&session.value()) {
            Some(s) => s,
            None => return fail(ResponseCode::HANDLE),
        };
        if session.kind != SessionKind::Policy || session.digest != auth_policy(&object.public) {
            return fail(ResponseCode::POLICY_FAIL);
        }
        if session.encryption != ParameterEncryption::Response {
            self.cleartext_secrets += 1;
        }
        Ok(SensitiveData::try_from(object.sensitive)?)
    }

    fn object_change_auth(
        &mut self,
        object: TransientHandle,
        parent: PersistentTpmHandle,
        auth_value: &[u8],
        new_auth_value: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<Private> {
        let parent_seed = self.persistent(parent)?.seed;
        let object = self.transient(object)?.clone();
        let encrypted = self.encrypts_command(session)?;
        self.authorize_object(&object, auth_value)?;
        if new_auth_value.len() > MAX_AUTH_VALUE {
            return fail(ResponseCode::VALUE);
        }
        if !encrypted {
            // Both the old auth, as a password, and the new one
            self.cleartext_secrets += 2;
        }
        let blob = [self.random32(), self.random32()].concat();
        self.wrapped.insert(
            blob.clone(),
            Wrapped {
                public: object.public,
                sensitive: object.sensitive,
                auth: new_auth_value.to_vec(),
                parent_seed,
            },
        );
        Ok(Private::try_from(blob)?)
    }

    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(num_bytes);
        while bytes.len() < num_bytes {
            bytes.extend_from_slice(&self.random32());
        }
        bytes.truncate(num_bytes);
        Ok(bytes)
    }
}
