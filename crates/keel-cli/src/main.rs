//! `keel` binary entry point.

#![deny(unsafe_code)]

#[tokio::main]
async fn main() {
    if let Err(err) = keel_cli::run().await {
        eprintln!("error[{}]: {err}", err.code());
        std::process::exit(err.exit_code());
    }
}
