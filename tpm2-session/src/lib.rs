// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 authorization and parameter-encryption sessions in pure Rust
//!
//! This crate authorizes TPM commands with password and HMAC sessions and
//! protects the first command/response parameter with AES-CFB, talking
//! directly to the TPM device without C library dependencies.
//!
//! ## Features
//!
//! - **Session kinds**: password, unbound, bound, salted and encrypt-only HMAC
//!   sessions described by plain-data [`SessionDescriptor`]s
//! - **Lifetimes**: ephemeral sessions started inline for one exchange, or
//!   persistent sessions held in a bounded pool and handed back with a
//!   [`Release`] token
//! - **Transports**: `/dev/tpmrm0` or `/dev/tpm0`, a swtpm TCP command port,
//!   or the in-process [`Simulator`]
//!
//! ## Supported Commands
//!
//! - Objects: `CreatePrimary`, `Create`, `Load`, `Unseal`, `ReadPublic`, `FlushContext`
//! - Hierarchies: `HierarchyChangeAuth`
//! - NV: `NV_DefineSpace`, `NV_UndefineSpace`, `NV_ReadPublic`
//! - Sessions: `StartAuthSession`
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_session::{AuthValue, Entity, SessionConfig, SessionDescriptor, TpmAlgId, TpmContext, TpmtPublic};
//!
//! let mut ctx = TpmContext::open(SessionConfig::simulator())?;
//! let mut owner_auth = ctx.build_session(&SessionDescriptor::password(""))?;
//! let primary = ctx.create_primary(
//!     &Entity::owner(),
//!     &mut owner_auth,
//!     None,
//!     &TpmtPublic::rsa_storage_key(),
//!     &AuthValue::from("keypass"),
//! )?;
//!
//! // Seal under the new key, keeping its password off the bus.
//! let salted = SessionDescriptor::salted(TpmAlgId::Sha256, primary.entity(), primary.public.clone())?;
//! let (mut enc, release) = ctx.start_session(&salted)?;
//! let mut key_auth = ctx.build_session(&SessionDescriptor::hmac_auth(TpmAlgId::Sha256, "keypass")?)?;
//! let sealed = ctx.seal(&primary.entity(), &mut key_auth, Some(&mut enc), b"secret", &AuthValue::empty())?;
//! ctx.release(release)?;
//! # let _ = sealed;
//! # Ok::<(), tpm2_session::Error>(())
//! ```

mod auth;
mod commands;
mod config;
mod constants;
mod context;
mod crypto;
mod descriptor;
mod device;
mod error;
mod marshal;
mod param;
mod session;
mod simulator;
mod types;

pub use auth::{AuthArea, AuthResponse};
pub use commands::{CreatedObject, LoadedObject, NvIndexInfo};
pub use config::SessionConfig;
pub use constants::*;
pub use context::{Command, Response, TpmContext};
pub use descriptor::{
    AuthValue, DescriptorBuilder, Direction, Encryption, HmacDescriptor, KeyMaterial,
    SessionDescriptor,
};
pub use error::{Error, Result};
pub use session::{Release, Session, SessionHandle, SessionManager};
pub use simulator::{Simulator, SESSION_SLOTS};
pub use types::*;

// Re-export device for advanced usage
pub use device::{open_transport, TcpTransport, TpmCommand, TpmDevice, TpmResponse, Transport};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
