//! Scope guards for TPM resources that occupy one of the device's limited slots.
//!
//! A guard derefs to the device it borrows, so further commands are issued
//! through it and nested guards borrow from their enclosing guard. Dropping a
//! guard flushes its resource; [`ObjectGuard::run`] and [`SessionGuard::run`]
//! flush explicitly so that a failed flush reaches the caller.

use super::{
    Device, DeviceError, Hierarchy, ParameterEncryption, SessionHandle, SessionKind,
    TransientHandle,
};
use std::ops::{Deref, DerefMut};
use thiserror::Error;
use tss_esapi::handles::PersistentTpmHandle;
use tss_esapi::structures::{Private, Public};

#[derive(Error, Debug)]
#[error("failed to flush {kind} {handle:#010x}")]
pub struct CleanupError {
    kind: &'static str,
    handle: u32,
    #[source]
    source: DeviceError,
}

impl CleanupError {
    pub fn handle(&self) -> u32 {
        self.handle
    }
}

/// Renders the error a cleanup failure followed, for use in `Display` impls
pub fn describe_primary<E: std::fmt::Display>(primary: &Option<Box<E>>) -> String {
    match primary {
        Some(primary) => format!(" (after: {})", primary),
        None => String::new(),
    }
}

/// Errors able to report a cleanup failure alongside the error that preceded it
pub trait Escalate: Sized {
    fn cleanup(leak: CleanupError, primary: Option<Self>) -> Self;
}

/// Combines the outcome of an operation with the outcome of releasing its resources
pub fn settle<T, E: Escalate>(
    primary: Result<T, E>,
    cleanup: Result<(), CleanupError>,
) -> Result<T, E> {
    match (primary, cleanup) {
        (result, Ok(())) => result,
        (Ok(_), Err(leak)) => Err(E::cleanup(leak, None)),
        (Err(error), Err(leak)) => Err(E::cleanup(leak, Some(error))),
    }
}

pub struct ObjectGuard<'a, D: Device + ?Sized> {
    device: &'a mut D,
    handle: TransientHandle,
    released: bool,
}

impl<'a, D: Device + ?Sized> ObjectGuard<'a, D> {
    pub fn load(
        device: &'a mut D,
        parent: PersistentTpmHandle,
        private: Private,
        public: Public,
    ) -> Result<Self, DeviceError> {
        let handle = device.load(parent, private, public)?;
        Ok(Self::new(device, handle))
    }

    pub fn create_primary(
        device: &'a mut D,
        hierarchy: Hierarchy,
        template: Public,
    ) -> Result<(Self, Public), DeviceError> {
        let (handle, public) = device.create_primary(hierarchy, template)?;
        Ok((Self::new(device, handle), public))
    }

    fn new(device: &'a mut D, handle: TransientHandle) -> Self {
        Self {
            device,
            handle,
            released: false,
        }
    }

    pub fn handle(&self) -> TransientHandle {
        self.handle
    }

    pub fn release(mut self) -> Result<(), CleanupError> {
        self.released = true;
        self.device
            .flush_object(self.handle)
            .map_err(|source| CleanupError {
                kind: "transient object",
                handle: self.handle.value(),
                source,
            })
    }

    /// Runs `f` with the object loaded, then flushes it whatever the outcome
    pub fn run<T, E, F>(mut self, f: F) -> Result<T, E>
    where
        E: Escalate,
        F: FnOnce(&mut D, TransientHandle) -> Result<T, E>,
    {
        let handle = self.handle;
        let result = f(&mut *self.device, handle);
        settle(result, self.release())
    }
}

impl<D: Device + ?Sized> Deref for ObjectGuard<'_, D> {
    type Target = D;
    fn deref(&self) -> &Self::Target {
        &*self.device
    }
}

impl<D: Device + ?Sized> DerefMut for ObjectGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.device
    }
}

impl<D: Device + ?Sized> Drop for ObjectGuard<'_, D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.device.flush_object(self.handle) {
            log::error!(
                "Leaked transient object {:#010x}: {}",
                self.handle.value(),
                e
            );
        }
    }
}

pub struct SessionGuard<'a, D: Device + ?Sized> {
    device: &'a mut D,
    handle: SessionHandle,
    released: bool,
}

impl<'a, D: Device + ?Sized> SessionGuard<'a, D> {
    pub fn start(
        device: &'a mut D,
        kind: SessionKind,
        salt_key: PersistentTpmHandle,
        encryption: ParameterEncryption,
    ) -> Result<Self, DeviceError> {
        let handle = device.start_session(kind, salt_key, encryption)?;
        Ok(Self {
            device,
            handle,
            released: false,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn release(mut self) -> Result<(), CleanupError> {
        self.released = true;
        self.device
            .flush_session(self.handle)
            .map_err(|source| CleanupError {
                kind: "session",
                handle: self.handle.value(),
                source,
            })
    }

    /// Runs `f` with the session loaded, then flushes it whatever the outcome
    pub fn run<T, E, F>(mut self, f: F) -> Result<T, E>
    where
        E: Escalate,
        F: FnOnce(&mut D, SessionHandle) -> Result<T, E>,
    {
        let handle = self.handle;
        let result = f(&mut *self.device, handle);
        settle(result, self.release())
    }
}

impl<D: Device + ?Sized> Deref for SessionGuard<'_, D> {
    type Target = D;
    fn deref(&self) -> &Self::Target {
        &*self.device
    }
}

impl<D: Device + ?Sized> DerefMut for SessionGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.device
    }
}

impl<D: Device + ?Sized> Drop for SessionGuard<'_, D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.device.flush_session(self.handle) {
            log::error!("Leaked session {:#010x}: {}", self.handle.value(), e);
        }
    }
}
