// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Cost of each session kind over the in-process simulator
//!
//! Every iteration authorizes one `HierarchyChangeAuth` on the owner. Inline
//! sessions pay a `StartAuthSession` per exchange; persistent ones only the
//! HMAC and nonce rotation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tpm2_session::{
    AuthValue, Direction, Entity, LoadedObject, SessionConfig, SessionDescriptor, Simulator,
    TpmAlgId, TpmContext, TpmtPublic,
};

type SimContext = TpmContext<Simulator>;

fn setup() -> (SimContext, LoadedObject) {
    let mut ctx = TpmContext::with_transport(Simulator::new(), SessionConfig::simulator());
    let mut owner = ctx
        .build_session(&SessionDescriptor::password(""))
        .unwrap();
    let key = ctx
        .create_primary(
            &Entity::owner(),
            &mut owner,
            None,
            &TpmtPublic::rsa_storage_key(),
            &AuthValue::from("bindpassword"),
        )
        .unwrap();
    (ctx, key)
}

fn descriptors(key: &LoadedObject) -> Vec<(&'static str, SessionDescriptor)> {
    vec![
        (
            "unbound",
            SessionDescriptor::hmac_auth(TpmAlgId::Sha256, "").unwrap(),
        ),
        (
            "bound",
            SessionDescriptor::hmac(TpmAlgId::Sha256)
                .bound(key.entity(), "bindpassword")
                .auth("")
                .build()
                .unwrap(),
        ),
        (
            "salted",
            SessionDescriptor::hmac(TpmAlgId::Sha256)
                .salted(key.entity(), key.public.clone())
                .auth("")
                .build()
                .unwrap(),
        ),
        (
            "salted-aes",
            SessionDescriptor::hmac(TpmAlgId::Sha256)
                .salted(key.entity(), key.public.clone())
                .auth("")
                .aes_cfb(128, Direction::InOut)
                .build()
                .unwrap(),
        ),
    ]
}

fn change_owner_auth(ctx: &mut SimContext, session: &mut tpm2_session::Session) {
    ctx.hierarchy_change_auth(&Entity::owner(), session, None, &AuthValue::empty())
        .unwrap();
}

fn bench_password(c: &mut Criterion) {
    let (mut ctx, _) = setup();
    let mut session = ctx
        .build_session(&SessionDescriptor::password(""))
        .unwrap();
    c.bench_function("password", |b| {
        b.iter(|| change_owner_auth(&mut ctx, black_box(&mut session)))
    });
}

fn bench_ephemeral(c: &mut Criterion) {
    let (mut ctx, key) = setup();
    let mut group = c.benchmark_group("ephemeral");
    for (label, descriptor) in descriptors(&key) {
        let mut session = ctx.build_session(&descriptor).unwrap();
        group.bench_function(label, |b| {
            b.iter(|| change_owner_auth(&mut ctx, black_box(&mut session)))
        });
    }
    group.finish();
}

fn bench_persistent(c: &mut Criterion) {
    let (mut ctx, key) = setup();
    let mut group = c.benchmark_group("persistent");
    for (label, descriptor) in descriptors(&key) {
        let (mut session, release) = ctx.start_session(&descriptor).unwrap();
        group.bench_function(label, |b| {
            b.iter(|| change_owner_auth(&mut ctx, black_box(&mut session)))
        });
        ctx.release(release).unwrap();
    }
    group.finish();
}

fn bench_session_start(c: &mut Criterion) {
    let (mut ctx, key) = setup();
    let mut group = c.benchmark_group("start-release");
    for (label, descriptor) in descriptors(&key) {
        group.bench_function(label, |b| {
            b.iter(|| {
                let (_, release) = ctx.start_session(black_box(&descriptor)).unwrap();
                ctx.release(release).unwrap();
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_password,
    bench_ephemeral,
    bench_persistent,
    bench_session_start
);
criterion_main!(benches);
