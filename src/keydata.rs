//! On-disk container for a sealed key.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! u32 version
//! u16 len, key private area
//! u16 len, key public area (TPMT_PUBLIC)
//! u16 len, PIN object private area
//! u16 len, PIN object public area (TPMT_PUBLIC)
//! ```

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;
use tss_esapi::structures::{Private, Public};
use tss_esapi::traits::{Marshall, UnMarshall};

pub const CURRENT_VERSION: u32 = 0;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("cannot access key data file: {0}")]
    Io(#[from] io::Error),
    #[error("key data file already exists")]
    Exists,
    #[error("malformed key data: {0}")]
    Malformed(String),
    #[error("unsupported key data version {0}")]
    UnsupportedVersion(u32),
}

/// The TPM blobs that make up a sealed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyData {
    pub key_private: Private,
    pub key_public: Public,
    pub pin_private: Private,
    pub pin_public: Public,
}

fn malformed(what: impl std::fmt::Display) -> ContainerError {
    ContainerError::Malformed(what.to_string())
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], ContainerError> {
        if self.bytes.len() < len {
            return Err(malformed(format!("truncated {}", field)));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u32(&mut self, field: &str) -> Result<u32, ContainerError> {
        let mut buf = [0; 4];
        buf.copy_from_slice(self.take(4, field)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn sized(&mut self, field: &str) -> Result<&'a [u8], ContainerError> {
        let mut buf = [0; 2];
        buf.copy_from_slice(self.take(2, field)?);
        self.take(u16::from_be_bytes(buf) as usize, field)
    }
}

fn put_sized(out: &mut Vec<u8>, field: &str, bytes: &[u8]) -> Result<(), ContainerError> {
    let len = u16::try_from(bytes.len()).map_err(|_| malformed(format!("{} too large", field)))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

impl KeyData {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ContainerError> {
        let key_public = self.key_public.marshall().map_err(malformed)?;
        let pin_public = self.pin_public.marshall().map_err(malformed)?;

        let mut out = CURRENT_VERSION.to_be_bytes().to_vec();
        put_sized(&mut out, "key private area", self.key_private.value())?;
        put_sized(&mut out, "key public area", &key_public)?;
        put_sized(&mut out, "PIN private area", self.pin_private.value())?;
        put_sized(&mut out, "PIN public area", &pin_public)?;
        Ok(out)
    }

    /// Decodes a container, rejecting unknown versions before looking at the payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContainerError> {
        let mut reader = Reader { bytes };
        let version = reader.u32("version")?;
        if version != CURRENT_VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        let key_private = reader.sized("key private area")?;
        let key_public = reader.sized("key public area")?;
        let pin_private = reader.sized("PIN private area")?;
        let pin_public = reader.sized("PIN public area")?;
        if !reader.bytes.is_empty() {
            return Err(malformed(format!(
                "{} trailing bytes",
                reader.bytes.len()
            )));
        }

        Ok(Self {
            key_private: Private::try_from(key_private.to_vec()).map_err(malformed)?,
            key_public: Public::unmarshall(key_public).map_err(malformed)?,
            pin_private: Private::try_from(pin_private.to_vec()).map_err(malformed)?,
            pin_public: Public::unmarshall(pin_public).map_err(malformed)?,
        })
    }

    pub fn read_from_file(path: &Path) -> Result<Self, ContainerError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Writes a new container, failing with [`ContainerError::Exists`] if `path` is taken
    pub fn write_new(&self, path: &Path) -> Result<(), ContainerError> {
        self.stage(path)?
            .persist_noclobber(path)
            .map(|_| ())
            .map_err(|e| match e.error.kind() {
                io::ErrorKind::AlreadyExists => ContainerError::Exists,
                _ => ContainerError::Io(e.error),
            })
    }

    /// Atomically replaces the container at `path`
    pub fn replace(&self, path: &Path) -> Result<(), ContainerError> {
        self.stage(path)?
            .persist(path)
            .map(|_| ())
            .map_err(|e| ContainerError::Io(e.error))
    }

    /// Writes the encoded container to a temporary file next to `path`
    fn stage(&self, path: &Path) -> Result<NamedTempFile, ContainerError> {
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        Ok(file)
    }
}
