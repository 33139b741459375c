//! [`Device`] backed by the TSS2 ESAPI.

use super::{
    DaParameters, Device, DeviceError, HandleKind, Hierarchy, ParameterEncryption,
    ResponseCode, Result, SessionHandle, SessionKind, TransientHandle,
};
use std::collections::HashMap;
use std::str::FromStr;
use tss_esapi::attributes::SessionAttributes;
use tss_esapi::constants::{CapabilityType, PropertyTag, SessionType, StartupType};
use tss_esapi::handles::{AuthHandle, KeyHandle, ObjectHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::resource_handles::{Hierarchy as TssHierarchy, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{
    Auth, CapabilityData, CreateKeyResult, CreatePrimaryKeyResult, Digest, Nonce, Private,
    Public, SensitiveData, SymmetricDefinition,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::Context;

const MAX_HANDLES: u32 = 80;
const TRANSIENT_FIRST: u32 = 0x8000_0000;
const LOADED_SESSION_FIRST: u32 = 0x0200_0000;
const RANDOM_CHUNK: usize = 32;

pub struct TssDevice {
    context: Context,
    objects: HashMap<u32, ObjectHandle>,
    sessions: HashMap<u32, AuthSession>,
    next_id: u32,
}

impl TssDevice {
    /// Opens the TPM named by a TCTI configuration string such as `device:/dev/tpmrm0`
    pub fn connect(tcti: &str) -> Result<Self> {
        let conf = TctiNameConf::from_str(tcti).map_err(DeviceError::Connection)?;
        let mut context = Context::new(conf).map_err(DeviceError::Connection)?;
        // Fails with TPM_RC_INITIALIZE once the firmware has already started the TPM
        if let Err(e) = context.startup(StartupType::Clear) {
            log::debug!("TPM2_Startup: {}", e);
        }
        Ok(Self {
            context,
            objects: HashMap::new(),
            sessions: HashMap::new(),
            next_id: 0,
        })
    }

    fn track_object(&mut self, handle: ObjectHandle) -> TransientHandle {
        self.next_id += 1;
        self.objects.insert(self.next_id, handle);
        TransientHandle::new(self.next_id)
    }

    fn object(&self, handle: TransientHandle) -> Result<ObjectHandle> {
        self.objects
            .get(&handle.value())
            .copied()
            .ok_or(DeviceError::UnknownHandle("transient object", handle.value()))
    }

    fn session(&self, handle: SessionHandle) -> Result<AuthSession> {
        self.sessions
            .get(&handle.value())
            .copied()
            .ok_or(DeviceError::UnknownHandle("session", handle.value()))
    }

    /// The session authorizing an object, a password session if none is given
    fn auth_session(&self, handle: Option<SessionHandle>) -> Result<AuthSession> {
        match handle {
            Some(handle) => self.session(handle),
            None => Ok(AuthSession::Password),
        }
    }

    fn set_auth(&mut self, object: ObjectHandle, auth_value: &[u8]) -> Result<()> {
        let auth = Auth::try_from(auth_value.to_vec())?;
        self.context.tr_set_auth(object, auth)?;
        Ok(())
    }

    fn set_hierarchy_auth(&mut self, hierarchy: Hierarchy, auth_value: &[u8]) -> Result<()> {
        self.set_auth(hierarchy_object(hierarchy), auth_value)
    }

    /// Runs `f` with an ESYS object for the persistent `handle`, closing it afterwards
    fn with_persistent<T, F>(&mut self, handle: PersistentTpmHandle, f: F) -> Result<T>
    where
        F: FnOnce(&mut Context, ObjectHandle) -> Result<T>,
    {
        let mut object = self
            .context
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))?;
        let result = f(&mut self.context, object);
        if let Err(e) = self.context.tr_close(&mut object) {
            log::debug!("Closing ESYS object for {:?}: {}", handle, e);
        }
        result
    }
}

fn hierarchy_object(hierarchy: Hierarchy) -> ObjectHandle {
    match hierarchy {
        Hierarchy::Owner => ObjectHandle::Owner,
        Hierarchy::Endorsement => ObjectHandle::Endorsement,
        Hierarchy::Platform => ObjectHandle::Platform,
        Hierarchy::Lockout => ObjectHandle::Lockout,
    }
}

fn auth_handle(hierarchy: Hierarchy) -> AuthHandle {
    match hierarchy {
        Hierarchy::Owner => AuthHandle::Owner,
        Hierarchy::Endorsement => AuthHandle::Endorsement,
        Hierarchy::Platform => AuthHandle::Platform,
        Hierarchy::Lockout => AuthHandle::Lockout,
    }
}

fn session_handle(session: AuthSession) -> Option<ObjectHandle> {
    match session {
        AuthSession::HmacSession(HmacSession::HmacSession { session_handle, .. }) => {
            Some(session_handle.into())
        }
        AuthSession::PolicySession(PolicySession::PolicySession { session_handle, .. }) => {
            Some(session_handle.into())
        }
        _ => None,
    }
}

impl Device for TssDevice {
    fn clear(&mut self, auth: Hierarchy, auth_value: &[u8]) -> Result<()> {
        self.set_hierarchy_auth(auth, auth_value)?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.clear(auth_handle(auth))
            })?;
        Ok(())
    }

    fn clear_control(&mut self, auth: Hierarchy, auth_value: &[u8], disable: bool) -> Result<()> {
        self.set_hierarchy_auth(auth, auth_value)?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.clear_control(auth_handle(auth), disable)
            })?;
        Ok(())
    }

    fn hierarchy_change_auth(
        &mut self,
        hierarchy: Hierarchy,
        auth_value: &[u8],
        new_auth_value: &[u8],
    ) -> Result<()> {
        self.set_hierarchy_auth(hierarchy, auth_value)?;
        let new_auth = Auth::try_from(new_auth_value.to_vec())?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.hierarchy_change_auth(auth_handle(hierarchy), new_auth)
            })?;
        Ok(())
    }

    fn dictionary_attack_parameters(
        &mut self,
        lockout_auth: &[u8],
        parameters: &DaParameters,
    ) -> Result<()> {
        self.set_hierarchy_auth(Hierarchy::Lockout, lockout_auth)?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.dictionary_attack_parameters(
                    ObjectHandle::Lockout,
                    parameters.max_auth_fail,
                    parameters.recovery_time,
                    parameters.lockout_recovery_time,
                )
            })?;
        Ok(())
    }

    fn property(&mut self, tag: PropertyTag) -> Result<Option<u32>> {
        Ok(self.context.get_tpm_property(tag)?)
    }

    fn loaded_handle_count(&mut self, kind: HandleKind) -> Result<usize> {
        let first = match kind {
            HandleKind::Transient => TRANSIENT_FIRST,
            HandleKind::LoadedSession => LOADED_SESSION_FIRST,
        };
        let (capabilities, _) =
            self.context
                .get_capability(CapabilityType::Handles, first, MAX_HANDLES)?;
        match capabilities {
            CapabilityData::Handles(handles) => Ok(handles.into_inner().len()),
            _ => Ok(0),
        }
    }

    fn read_public(&mut self, handle: PersistentTpmHandle) -> Result<Option<(Public, Vec<u8>)>> {
        let public = self.with_persistent(handle, |ctx, object| {
            let (public, _, qualified_name) =
                ctx.execute_without_session(|ctx| ctx.read_public(KeyHandle::from(object)))?;
            Ok((public, qualified_name.value().to_vec()))
        });
        match public {
            Ok(public) => Ok(Some(public)),
            Err(DeviceError::Response(rc)) if rc.is_handle() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: Public,
    ) -> Result<(TransientHandle, Public)> {
        let primary_hierarchy = match hierarchy {
            Hierarchy::Owner => TssHierarchy::Owner,
            Hierarchy::Endorsement => TssHierarchy::Endorsement,
            Hierarchy::Platform => TssHierarchy::Platform,
            Hierarchy::Lockout => return Err(DeviceError::Response(ResponseCode::VALUE)),
        };
        let CreatePrimaryKeyResult {
            key_handle,
            out_public,
            ..
        } = self.context.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(primary_hierarchy, template, None, None, None, None)
        })?;
        Ok((self.track_object(key_handle.into()), out_public))
    }

    fn persist(&mut self, object: TransientHandle, handle: PersistentTpmHandle) -> Result<()> {
        let object = self.object(object)?;
        let mut persistent = self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(Provision::Owner, object, Persistent::Persistent(handle))
            })?;
        self.context.tr_close(&mut persistent)?;
        Ok(())
    }

    fn evict(&mut self, handle: PersistentTpmHandle) -> Result<()> {
        let retrieved = self
            .context
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))?;
        // An authorization session is required even for an empty owner auth
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(Provision::Owner, retrieved, Persistent::Persistent(handle))
            })?;
        Ok(())
    }

    fn create(
        &mut self,
        parent: PersistentTpmHandle,
        template: Public,
        auth_value: &[u8],
        data: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<(Private, Public)> {
        let session = self.auth_session(session)?;
        let auth = Auth::try_from(auth_value.to_vec())?;
        let data = SensitiveData::try_from(data.to_vec())?;
        self.with_persistent(parent, |ctx, parent| {
            let CreateKeyResult {
                out_private,
                out_public,
                ..
            } = ctx.execute_with_session(Some(session), |ctx| {
                ctx.create(
                    KeyHandle::from(parent),
                    template,
                    Some(auth),
                    Some(data),
                    None,
                    None,
                )
            })?;
            Ok((out_private, out_public))
        })
    }

    fn load(
        &mut self,
        parent: PersistentTpmHandle,
        private: Private,
        public: Public,
    ) -> Result<TransientHandle> {
        let key = self.with_persistent(parent, |ctx, parent| {
            Ok(ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.load(KeyHandle::from(parent), private, public)
            })?)
        })?;
        Ok(self.track_object(key.into()))
    }

    fn flush_object(&mut self, object: TransientHandle) -> Result<()> {
        let handle = self.object(object)?;
        self.context.flush_context(handle)?;
        self.objects.remove(&object.value());
        Ok(())
    }

    fn start_session(
        &mut self,
        kind: SessionKind,
        salt_key: PersistentTpmHandle,
        encryption: ParameterEncryption,
    ) -> Result<SessionHandle> {
        let session_type = match kind {
            SessionKind::Hmac => SessionType::Hmac,
            SessionKind::Policy => SessionType::Policy,
        };
        let session = self.with_persistent(salt_key, |ctx, salt_key| {
            ctx.start_auth_session(
                Some(KeyHandle::from(salt_key)),
                None,
                None,
                session_type,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(DeviceError::AuthSessionCreate)
        })?;
        let builder = SessionAttributes::builder().with_continue_session(true);
        let (session_attributes, session_attributes_mask) = match encryption {
            ParameterEncryption::Command => builder.with_decrypt(true),
            ParameterEncryption::Response => builder.with_encrypt(true),
        }
        .build();
        if let Err(e) =
            self.context
                .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)
        {
            if let Some(handle) = session_handle(session) {
                if let Err(flush_error) = self.context.flush_context(handle) {
                    log::error!("Failed to flush session {:?}: {}", handle, flush_error);
                }
            }
            return Err(e.into());
        }
        self.next_id += 1;
        self.sessions.insert(self.next_id, session);
        Ok(SessionHandle::new(self.next_id))
    }

    fn flush_session(&mut self, session: SessionHandle) -> Result<()> {
        if let Some(handle) = session_handle(self.session(session)?) {
            self.context.flush_context(handle)?;
        }
        self.sessions.remove(&session.value());
        Ok(())
    }

    fn policy_secret(
        &mut self,
        session: SessionHandle,
        auth_object: TransientHandle,
        auth_value: &[u8],
        policy_ref: &[u8],
        auth_session: Option<SessionHandle>,
    ) -> Result<()> {
        let policy_session = PolicySession::try_from(self.session(session)?)?;
        let auth_session = self.auth_session(auth_session)?;
        let object = self.object(auth_object)?;
        self.set_auth(object, auth_value)?;
        let policy_ref = Nonce::try_from(policy_ref.to_vec())?;
        self.context
            .execute_with_session(Some(auth_session), |ctx| {
                ctx.policy_secret(
                    policy_session,
                    AuthHandle::from(object),
                    Nonce::default(),
                    Digest::default(),
                    policy_ref,
                    None,
                )
            })?;
        Ok(())
    }

    fn unseal(&mut self, object: TransientHandle, session: SessionHandle) -> Result<SensitiveData> {
        let session = self.session(session)?;
        let object = self.object(object)?;
        Ok(self
            .context
            .execute_with_session(Some(session), |ctx| ctx.unseal(object))?)
    }

    fn object_change_auth(
        &mut self,
        object: TransientHandle,
        parent: PersistentTpmHandle,
        auth_value: &[u8],
        new_auth_value: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<Private> {
        let session = self.auth_session(session)?;
        let object = self.object(object)?;
        self.set_auth(object, auth_value)?;
        let new_auth = Auth::try_from(new_auth_value.to_vec())?;
        self.with_persistent(parent, |ctx, parent| {
            Ok(ctx.execute_with_session(Some(session), |ctx| {
                ctx.object_change_auth(object, parent, new_auth)
            })?)
        })
    }

    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(num_bytes);
        while bytes.len() < num_bytes {
            let chunk = RANDOM_CHUNK.min(num_bytes - bytes.len());
            bytes.extend_from_slice(self.context.get_random(chunk)?.value());
        }
        Ok(bytes)
    }
}
