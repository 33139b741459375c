//! Physical presence requests through the kernel's PPI interface. The firmware
//! carries the request out, after confirmation, on the next reboot.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

pub const REQUEST_PATH: &str = "/sys/class/tpm/tpm0/ppi/request";

/// PPI operation 5: TPM2_Clear
const OPERATION_CLEAR: &str = "5";

#[derive(Error, Debug)]
pub enum PpiError {
    #[error("cannot submit physical presence request to {path}: {source}")]
    Submit {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Asks the firmware to clear the TPM on the next boot
pub fn request_clear() -> Result<(), PpiError> {
    request_clear_at(Path::new(REQUEST_PATH))
}

pub fn request_clear_at(path: &Path) -> Result<(), PpiError> {
    let submit = || -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(OPERATION_CLEAR.as_bytes())
    };
    submit().map_err(|source| PpiError::Submit {
        path: path.display().to_string(),
        source,
    })?;
    log::info!("Requested TPM clear, reboot to confirm it with the firmware");
    Ok(())
}
