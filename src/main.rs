/// To build a distributable binary linked statically against the TSS libraries:
/// ```
/// rustup target add x86_64-unknown-linux-musl
/// TPM_FDE_BUILD_STATIC=1 cargo build --release --target=x86_64-unknown-linux-musl
/// ```
use eyre::Result;
use std::env;
use tpm_fde::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    env::set_var("TSS2_LOG", "all+NONE");
    cli.run()?;
    Ok(())
}
