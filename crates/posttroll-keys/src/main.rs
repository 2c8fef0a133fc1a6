//! `posttroll-generate-keys`: writes an X25519 keypair for the secure
//! backend (spec.md §6).
//!
//! ```text
//! posttroll-generate-keys [-h] [-d DIRECTORY] NAME
//! ```
//!
//! Writes `NAME.key` (public) and `NAME.key_secret` (secret), matching
//! the file pair [`Config::server_public_key_file`]/
//! [`Config::server_secret_key_file`] expect.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use posttroll_transport::crypto::{write_key_file, X25519StaticSecret};

#[derive(Parser, Debug)]
#[command(name = "posttroll-generate-keys", about = "Generate a PostTroll secure-backend keypair")]
struct Args {
    /// Directory to write the keypair into (created if missing).
    #[arg(short = 'd', long = "directory", default_value = ".")]
    directory: PathBuf,

    /// Base name for the keypair: writes `NAME.key` and `NAME.key_secret`.
    name: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "posttroll=info".into()),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok((public_path, secret_path)) => {
            println!("wrote {}", public_path.display());
            println!("wrote {}", secret_path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "key generation failed");
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> anyhow::Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(&args.directory)?;
    let secret = X25519StaticSecret::random();
    let public_path = args.directory.join(format!("{}.key", args.name));
    let secret_path = args.directory.join(format!("{}.key_secret", args.name));
    write_key_file(&public_path, &secret.public_key().to_bytes())?;
    write_key_file(&secret_path, &secret.to_bytes())?;
    Ok((public_path, secret_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_public_and_secret_key_file() {
        let dir = std::env::temp_dir().join(format!("posttroll-keys-test-{:x}", std::process::id()));
        let args = Args { directory: dir.clone(), name: "alice".to_string() };
        let (public_path, secret_path) = run(&args).unwrap();

        let public_bytes = posttroll_transport::crypto::read_key_file(&public_path).unwrap();
        let secret_bytes = posttroll_transport::crypto::read_key_file(&secret_path).unwrap();
        let secret = X25519StaticSecret::from_bytes(secret_bytes);
        assert_eq!(secret.public_key().to_bytes(), public_bytes);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn creates_missing_directories() {
        let dir = std::env::temp_dir()
            .join(format!("posttroll-keys-test-nested-{:x}", std::process::id()))
            .join("nested");
        let args = Args { directory: dir.clone(), name: "bob".to_string() };
        run(&args).unwrap();
        assert!(dir.join("bob.key").exists());
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }
}
