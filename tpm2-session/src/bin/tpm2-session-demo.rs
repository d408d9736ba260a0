// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session demo
//!
//! Walks through password, HMAC, salted and encrypt-only sessions against a
//! TPM. Without `--device` or a config file it runs on the in-process
//! simulator and reports whether secrets were visible on the wire.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tpm2_session::{
    AuthValue, Entity, Error, SessionConfig, SessionDescriptor, Simulator, TpmAlgId, TpmContext,
    TpmtPublic, Transport,
};

/// TPM 2.0 authorization session demo
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON session configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// TPM device path, swtpm `host:port`, or `simulator`
    #[arg(long, env = "TPM_DEVICE")]
    device: Option<String>,
    /// Owner hierarchy auth value
    #[arg(long, default_value = "")]
    owner_auth: String,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Password-authorized CreatePrimary; the key password crosses the bus in the clear
    Plaintext,
    /// CreatePrimary with a salted encryption session; the key password is encrypted
    Encrypted,
    /// Owner -> A -> B with per-entity auth sessions and one shared encryption session
    Hierarchy,
    /// Fill the persistent session pool, then release a slot
    Slots,
    /// Run every demo
    All,
}

/// Access to the bytes exchanged with the TPM, where the transport keeps them
trait WireTap {
    fn saw(&self, needle: &[u8]) -> Option<bool>;
}

impl WireTap for Simulator {
    fn saw(&self, needle: &[u8]) -> Option<bool> {
        Some(self.wire_contains(needle))
    }
}

impl WireTap for Box<dyn Transport> {
    fn saw(&self, _needle: &[u8]) -> Option<bool> {
        None
    }
}

fn report_wire<T: Transport + WireTap>(ctx: &TpmContext<T>, what: &str, secret: &str) {
    match ctx.transport().saw(secret.as_bytes()) {
        Some(true) => println!("  ! {what} {secret:?} was visible on the wire"),
        Some(false) => println!("  ✓ {what} {secret:?} never appeared on the wire"),
        None => println!("  (wire capture not available on this transport)"),
    }
}

fn storage_key() -> TpmtPublic {
    TpmtPublic::rsa_storage_key()
}

fn demo_plaintext<T: Transport + WireTap>(ctx: &mut TpmContext<T>, owner_auth: &str) -> Result<()> {
    println!("--- Plaintext: password session ---");
    let key_auth = "plainpassword";
    let mut owner = ctx.build_session(&SessionDescriptor::password(owner_auth))?;
    let primary = ctx
        .create_primary(
            &Entity::owner(),
            &mut owner,
            None,
            &storage_key(),
            &AuthValue::from(key_auth),
        )
        .context("CreatePrimary with password authorization")?;
    println!(
        "  ✓ primary 0x{:08x}, name {}",
        primary.handle,
        hex::encode(&primary.name)
    );
    report_wire(ctx, "key password", key_auth);
    ctx.flush_context(primary)?;
    println!();
    Ok(())
}

fn demo_encrypted<T: Transport + WireTap>(ctx: &mut TpmContext<T>, owner_auth: &str) -> Result<()> {
    println!("--- Encrypted: salted session ---");
    let key_auth = "encryptedpassword";
    let mut owner = ctx.build_session(&SessionDescriptor::password(owner_auth))?;
    let srk = ctx
        .create_primary(&Entity::owner(), &mut owner, None, &storage_key(), &AuthValue::empty())
        .context("CreatePrimary of the salt key")?;
    println!("  ✓ salt key 0x{:08x}", srk.handle);

    let salted = SessionDescriptor::salted(TpmAlgId::Sha256, srk.entity(), srk.public.clone())?;
    let (mut enc, release) = ctx.start_session(&salted)?;
    let mut owner = ctx.build_session(&SessionDescriptor::hmac_auth(TpmAlgId::Sha256, owner_auth)?)?;
    let result = ctx.create_primary(
        &Entity::owner(),
        &mut owner,
        Some(&mut enc),
        &storage_key(),
        &AuthValue::from(key_auth),
    );
    ctx.release(release)?;
    let primary = result.context("CreatePrimary with an encrypted password")?;
    println!(
        "  ✓ primary 0x{:08x}, name {}",
        primary.handle,
        hex::encode(&primary.name)
    );
    report_wire(ctx, "key password", key_auth);
    ctx.flush_context(primary)?;
    ctx.flush_context(srk)?;
    println!();
    Ok(())
}

fn demo_hierarchy<T: Transport + WireTap>(ctx: &mut TpmContext<T>, owner_auth: &str) -> Result<()> {
    println!("--- Hierarchy: owner -> A -> B ---");
    let (a_auth, b_auth, seal_auth, nv_auth) = ("apassword", "bpassword", "sealpassword", "nvpassword");
    let mut owner = ctx.build_session(&SessionDescriptor::hmac_auth(TpmAlgId::Sha256, owner_auth)?)?;
    let a = ctx
        .create_primary(&Entity::owner(), &mut owner, None, &storage_key(), &AuthValue::from(a_auth))
        .context("CreatePrimary of A")?;
    println!("  ✓ A = 0x{:08x}", a.handle);

    // One salted session on A encrypts every step below.
    let salted = SessionDescriptor::salted(TpmAlgId::Sha256, a.entity(), a.public.clone())?;
    let (mut enc, release) = ctx.start_session(&salted)?;
    let result = hierarchy_steps(ctx, &mut enc, &a, owner_auth, [a_auth, b_auth, seal_auth, nv_auth]);
    ctx.release(release)?;
    result?;

    for secret in [b_auth, seal_auth, nv_auth, "top secret"] {
        report_wire(ctx, "secret", secret);
    }
    ctx.flush_context(a)?;
    println!();
    Ok(())
}

fn hierarchy_steps<T: Transport>(
    ctx: &mut TpmContext<T>,
    enc: &mut tpm2_session::Session,
    a: &tpm2_session::LoadedObject,
    owner_auth: &str,
    [a_auth, b_auth, seal_auth, nv_auth]: [&str; 4],
) -> Result<()> {
    let mut auth_a = ctx.build_session(&SessionDescriptor::hmac_auth(TpmAlgId::Sha256, a_auth)?)?;
    let sensitive = tpm2_session::Tpm2bSensitiveCreate::with_auth(b_auth.as_bytes());
    let b = ctx
        .create(&a.entity(), &mut auth_a, Some(&mut *enc), &storage_key(), &sensitive)
        .context("Create of B under A")?;
    let b = ctx
        .load(&a.entity(), &mut auth_a, Some(&mut *enc), &b)
        .context("Load of B")?;
    println!("  ✓ B = 0x{:08x} under A", b.handle);

    let mut auth_b = ctx.build_session(&SessionDescriptor::hmac_auth(TpmAlgId::Sha256, b_auth)?)?;
    let sealed = ctx
        .seal(&b.entity(), &mut auth_b, Some(&mut *enc), b"top secret", &AuthValue::from(seal_auth))
        .context("Seal under B")?;
    let sealed = ctx.load(&b.entity(), &mut auth_b, Some(&mut *enc), &sealed)?;
    let mut auth_sealed =
        ctx.build_session(&SessionDescriptor::hmac_auth(TpmAlgId::Sha256, seal_auth)?)?;
    let data = ctx
        .unseal(&sealed.entity(), &mut auth_sealed, Some(&mut *enc))
        .context("Unseal")?;
    println!("  ✓ unsealed {:?}", String::from_utf8_lossy(&data));

    let mut owner = ctx.build_session(&SessionDescriptor::hmac_auth(TpmAlgId::Sha256, owner_auth)?)?;
    match ctx.nv_define_space(&mut owner, Some(&mut *enc), 0x01500020, 32, &AuthValue::from(nv_auth)) {
        Ok(index) => {
            let public = ctx.nv_read_public(index.handle)?;
            println!(
                "  ✓ NV index 0x{:08x} defined, {} bytes",
                public.handle, public.public.data_size
            );
            ctx.nv_undefine_space(&mut owner, Some(&mut *enc), index)?;
            println!("  ✓ NV index undefined");
        }
        Err(Error::Tpm { code, .. }) => println!("  - NV index not defined: {code}"),
        Err(e) => return Err(e.into()),
    }

    ctx.flush_context(sealed)?;
    ctx.flush_context(b)?;
    Ok(())
}

fn demo_slots<T: Transport + WireTap>(ctx: &mut TpmContext<T>) -> Result<()> {
    println!("--- Slots: persistent session pool ---");
    let descriptor = SessionDescriptor::unbound(TpmAlgId::Sha256)?;
    let mut held = Vec::new();
    loop {
        match ctx.start_session(&descriptor) {
            Ok((session, release)) => {
                println!(
                    "  ✓ session 0x{:08x} started ({} active)",
                    session.device_handle().unwrap_or_default(),
                    ctx.active_sessions()
                );
                held.push(release);
            }
            Err(Error::SlotExhausted) => {
                println!("  ✓ pool exhausted at {} sessions", held.len());
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    if let Some(release) = held.pop() {
        ctx.release(release)?;
        println!("  ✓ released one ({} active)", ctx.active_sessions());
        let (_, release) = ctx.start_session(&descriptor)?;
        println!("  ✓ slot reused ({} active)", ctx.active_sessions());
        held.push(release);
    }
    for release in held {
        ctx.release(release)?;
    }
    println!("  ✓ all released ({} active)", ctx.active_sessions());
    println!();
    Ok(())
}

fn run<T: Transport + WireTap>(ctx: &mut TpmContext<T>, command: Commands, owner_auth: &str) -> Result<()> {
    match command {
        Commands::Plaintext => demo_plaintext(ctx, owner_auth),
        Commands::Encrypted => demo_encrypted(ctx, owner_auth),
        Commands::Hierarchy => demo_hierarchy(ctx, owner_auth),
        Commands::Slots => demo_slots(ctx),
        Commands::All => {
            demo_plaintext(ctx, owner_auth)?;
            demo_encrypted(ctx, owner_auth)?;
            demo_hierarchy(ctx, owner_auth)?;
            demo_slots(ctx)
        }
    }
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if cli.device.is_some() {
        config.device = cli.device.clone();
    }
    if config.device.is_none() {
        config.device = Some("simulator".into());
    }
    config.validate()?;

    println!("=== TPM 2.0 Session Demo ===\n");
    if config.device.as_deref() == Some("simulator") {
        let mut ctx = TpmContext::with_transport(Simulator::new(), config);
        run(&mut ctx, cli.command, &cli.owner_auth)
    } else {
        let mut ctx = TpmContext::open(config).context("failed to open TPM")?;
        run(&mut ctx, cli.command, &cli.owner_auth)
    }
}
