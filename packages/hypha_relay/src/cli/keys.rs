//! `hypha keys` — derive and print an identity.
//!
//! Sign-up in a terminal: generate (or accept) a passphrase, derive the key
//! set, print it. The write key is shown on purpose — it is the owner's own
//! secret, the same way the original sign-up form displayed it.

use anyhow::{Context, Result};
use tracing::warn;

use hypha_identity::passphrase::DEFAULT_WORDS;
use hypha_identity::{
    derive_identity, derive_local_identity, generate_passphrase, validate_passphrase,
};

#[derive(clap::Args)]
pub struct KeysArgs {
    /// Key-derivation domain (the salt)
    #[arg(long)]
    domain: Option<String>,

    /// Passphrase to derive from; generated when omitted
    #[arg(long)]
    passphrase: Option<String>,

    /// Derive a device-local identity instead (requires --read-key)
    #[arg(long)]
    node_name: Option<String>,

    /// Origin read key (hex) for --node-name
    #[arg(long)]
    read_key: Option<String>,
}

pub async fn run(args: KeysArgs) -> Result<()> {
    if let Some(node_name) = args.node_name {
        let read_key = args
            .read_key
            .context("--read-key is required with --node-name")?;
        let local =
            tokio::task::spawn_blocking(move || derive_local_identity(&read_key, &node_name))
                .await
                .context("key derivation task failed")??;
        println!("origin read key: {}", local.origin_read_key);
        println!("discovery key:   {}", local.discovery_key);
        println!("node name:       {}", local.node_name);
        println!("local read key:  {}", local.local_read_key);
        println!(
            "local write key: {}",
            data_encoding::HEXLOWER.encode(&local.local_write_key.to_bytes())
        );
        return Ok(());
    }

    let domain = args.domain.context("--domain is required")?;
    let passphrase = match args.passphrase {
        Some(passphrase) => {
            if let Err(e) = validate_passphrase(&passphrase) {
                warn!(error = %e, "passphrase fails the sign-in rule");
            }
            passphrase
        }
        None => {
            let passphrase = generate_passphrase(DEFAULT_WORDS);
            println!("passphrase:      {passphrase}");
            passphrase
        }
    };

    let identity = tokio::task::spawn_blocking(move || derive_identity(&passphrase, &domain))
        .await
        .context("key derivation task failed")??;

    println!("read key:        {}", identity.read_key);
    println!(
        "write key:       {}",
        data_encoding::HEXLOWER.encode(&identity.write_key.to_bytes())
    );
    println!("discovery key:   {}", identity.discovery_key);
    println!("encryption key:  {}", identity.encryption.public_hex());
    Ok(())
}
