use crate::config::Config;
use crate::ppi;
use crate::provision::{ProvisionStatus, Provisioner};
use crate::seal::{KeySealer, SealMode, KEY_SIZE};
use crate::tpm::{Device, TssDevice};
use clap::{Parser, Subcommand};
use eyre::{eyre, Result};
use std::io::{self, Read};
use std::path::PathBuf;
use zeroize::Zeroizing;

const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0", env = TPM_ENV_VAR)]
    tcti: String,

    /// YAML file overriding the SRK handle and DA lockout parameters
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the firmware to clear the TPM on the next boot
    RequestClear,
    #[command(flatten)]
    Device(DeviceCommands),
}

/// Commands that talk to the TPM through the TCTI
#[derive(Subcommand, Debug)]
enum DeviceCommands {
    /// Clear the TPM, create the SRK, set DA lockout parameters and disable clearing
    Provision {
        /// New lockout hierarchy auth value, empty if omitted
        #[arg(value_name = "LOCKOUT_AUTH")]
        lockout_auth: Option<String>,
    },
    /// Show which parts of the provisioned state the TPM is in
    Status,
    /// Seal a 512 bit key read as hex from stdin
    Seal {
        /// Write a new key data file
        #[arg(long, conflicts_with = "update")]
        create: bool,
        /// Replace the key in an existing key data file, keeping its PIN
        #[arg(long, required_unless_present = "create")]
        update: bool,
        /// Use a key from the TPM's random number generator instead of stdin
        #[arg(long)]
        generate: bool,
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Unseal a key and print it as hex
    Unseal {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        #[arg(long, default_value = "")]
        pin: String,
    },
    /// Change the PIN protecting a sealed key
    ChangePin {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        old_pin: String,
        new_pin: String,
    },
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self.command);
        let config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        match &self.command {
            Commands::RequestClear => ppi::request_clear()?,
            Commands::Device(command) => {
                let mut device = TssDevice::connect(&self.tcti)?;
                run_with_device(command, &config, &mut device)?
            }
        };
        Ok(self)
    }
}

fn run_with_device(command: &DeviceCommands, config: &Config, device: &mut TssDevice) -> Result<()> {
    let srk = config.srk()?;
    match command {
        DeviceCommands::Provision { lockout_auth } => {
            let lockout_auth = lockout_auth.as_deref().unwrap_or_default();
            let mut provisioner = Provisioner::new(device, srk, config.lockout);
            provisioner.provision(lockout_auth.as_bytes())?;
            show_status(provisioner.status()?);
        }
        DeviceCommands::Status => {
            show_status(Provisioner::new(device, srk, config.lockout).status()?);
        }
        DeviceCommands::Seal {
            create,
            generate,
            path,
            ..
        } => {
            let mode = match create {
                true => SealMode::Create,
                false => SealMode::Update,
            };
            let key = match generate {
                true => Zeroizing::new(device.get_random(KEY_SIZE)?),
                false => read_hex_key()?,
            };
            KeySealer::new(device, srk).seal(path, mode, &key)?;
        }
        DeviceCommands::Unseal { path, pin } => {
            let key = KeySealer::new(device, srk).unseal(path, pin.as_bytes())?;
            println!("{}", Zeroizing::new(hex::encode(&key[..])).as_str());
        }
        DeviceCommands::ChangePin {
            path,
            old_pin,
            new_pin,
        } => {
            KeySealer::new(device, srk).change_pin(path, old_pin.as_bytes(), new_pin.as_bytes())?;
        }
    }
    Ok(())
}

fn read_hex_key() -> Result<Zeroizing<Vec<u8>>> {
    let mut input = Zeroizing::new(String::new());
    io::stdin().read_to_string(&mut input)?;
    let key = hex::decode(input.trim()).map_err(|e| eyre!("key on stdin is not hex: {}", e))?;
    Ok(Zeroizing::new(key))
}

fn show_status(status: ProvisionStatus) {
    for (name, flag) in ProvisionStatus::all().iter_names() {
        println!("{:<22} {}", name, status.contains(flag));
    }
}
