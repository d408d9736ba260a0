// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use tpm2_session::{
    AuthValue, Entity, LoadedObject, Release, Session, SessionConfig, SessionDescriptor,
    Simulator, TpmAlgId, TpmContext, TpmtPublic,
};

pub fn init_tracing() {
    tracing_subscriber::fmt::try_init().ok();
}

pub fn context() -> TpmContext<Simulator> {
    context_with(Simulator::new())
}

pub fn context_with(simulator: Simulator) -> TpmContext<Simulator> {
    init_tracing();
    TpmContext::with_transport(simulator, SessionConfig::simulator())
}

pub fn password(ctx: &TpmContext<Simulator>, auth: &str) -> Session {
    ctx.build_session(&SessionDescriptor::password(auth))
        .expect("password session")
}

pub fn hmac(ctx: &TpmContext<Simulator>, auth: &str) -> Session {
    let descriptor =
        SessionDescriptor::hmac_auth(TpmAlgId::Sha256, auth).expect("hmac descriptor");
    ctx.build_session(&descriptor).expect("hmac session")
}

/// Storage primary under the owner hierarchy (owner auth "")
pub fn primary(ctx: &mut TpmContext<Simulator>, key_auth: &str) -> LoadedObject {
    let mut owner = password(ctx, "");
    ctx.create_primary(
        &Entity::owner(),
        &mut owner,
        None,
        &TpmtPublic::rsa_storage_key(),
        &AuthValue::from(key_auth),
    )
    .expect("create primary")
}

/// Persistent session salted to `key`, encrypting both directions
pub fn salted(ctx: &mut TpmContext<Simulator>, key: &LoadedObject) -> (Session, Release) {
    let descriptor = SessionDescriptor::salted(TpmAlgId::Sha256, key.entity(), key.public.clone())
        .expect("salted descriptor");
    ctx.start_session(&descriptor).expect("start salted session")
}
