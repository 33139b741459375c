//! Provisions a TPM into a hardened state and seals full disk encryption keys to it.
//!
//! ```no_run
//! use std::path::Path;
//! use tpm_fde::config::Config;
//! use tpm_fde::provision::Provisioner;
//! use tpm_fde::seal::{KeySealer, SealMode};
//! use tpm_fde::tpm::TssDevice;
//!
//! # fn main() -> eyre::Result<()> {
//! let config = Config::default();
//! let srk = config.srk()?;
//! let mut device = TssDevice::connect("device:/dev/tpmrm0")?;
//! Provisioner::new(&mut device, srk, config.lockout).provision(b"lockout")?;
//!
//! let mut sealer = KeySealer::new(&mut device, srk);
//! sealer.seal(Path::new("/boot/keydata"), SealMode::Create, &[0x42; 64])?;
//! let key = sealer.unseal(Path::new("/boot/keydata"), b"")?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod keydata;
pub mod policy;
pub mod ppi;
pub mod provision;
pub mod seal;
pub mod tpm;
