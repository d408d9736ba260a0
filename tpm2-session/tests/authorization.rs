// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use tpm2_session::{
    tpm_rc, tpm_rh, AuthValue, Entity, Error, SessionDescriptor, Simulator, TpmAlgId, TpmCc,
    TpmtPublic,
};

mod common;

fn owner_with(secret: &str) -> Simulator {
    Simulator::new().with_hierarchy_auth(tpm_rh::OWNER, secret)
}

#[test]
fn test_owner_password() {
    let mut ctx = common::context_with(owner_with("mysecret"));
    let template = TpmtPublic::rsa_storage_key();

    let mut wrong = common::password(&ctx, "wrongpassword");
    let err = ctx
        .create_primary(&Entity::owner(), &mut wrong, None, &template, &AuthValue::empty())
        .unwrap_err();
    match err {
        Error::WrongSecret {
            command,
            session,
            code,
        } => {
            assert_eq!(command, TpmCc::CreatePrimary);
            assert_eq!(session, 1);
            assert_eq!(code.0, 0x98E);
        }
        other => panic!("expected WrongSecret, got {other:?}"),
    }

    let mut right = common::password(&ctx, "mysecret");
    let key = ctx
        .create_primary(&Entity::owner(), &mut right, None, &template, &AuthValue::empty())
        .expect("owner password accepted");
    println!("✓ primary 0x{:08x}", key.handle);
    ctx.flush_context(key).unwrap();
}

#[test]
fn test_owner_hmac() {
    let mut ctx = common::context_with(owner_with("mysecret"));
    let template = TpmtPublic::rsa_storage_key();

    let mut wrong = common::hmac(&ctx, "wrongpassword");
    assert!(matches!(
        ctx.create_primary(&Entity::owner(), &mut wrong, None, &template, &AuthValue::empty()),
        Err(Error::WrongSecret { session: 1, .. })
    ));

    let mut right = common::hmac(&ctx, "mysecret");
    let key = ctx
        .create_primary(&Entity::owner(), &mut right, None, &template, &AuthValue::empty())
        .expect("owner HMAC accepted");
    ctx.flush_context(key).unwrap();
    assert_eq!(ctx.transport().loaded_objects(), 0);
}

#[test]
fn test_wrong_secret_keeps_persistent_session() {
    let mut ctx = common::context_with(owner_with("mysecret"));
    let wrong = SessionDescriptor::hmac(TpmAlgId::Sha256)
        .auth("wrongpassword")
        .aes_cfb(128, tpm2_session::Direction::InOut)
        .build()
        .unwrap();
    let (mut session, release) = ctx.start_session(&wrong).unwrap();
    let before: (Vec<u8>, Vec<u8>) = session
        .nonces()
        .map(|(c, t)| (c.to_vec(), t.to_vec()))
        .unwrap();

    let err = ctx
        .hierarchy_change_auth(&Entity::owner(), &mut session, None, &AuthValue::from("mysecret"))
        .unwrap_err();
    assert!(matches!(err, Error::WrongSecret { .. }));
    assert!(!err.poisons_session());
    assert!(!session.is_poisoned());
    assert!(session.pending_nonce().is_none());
    let after = session.nonces().map(|(c, t)| (c.to_vec(), t.to_vec())).unwrap();
    assert_eq!(before, after);
    assert_eq!(ctx.transport().loaded_sessions(), 1);

    // Still in sync: the same session can encrypt for a correctly authorized command.
    let mut owner = common::hmac(&ctx, "mysecret");
    ctx.hierarchy_change_auth(
        &Entity::owner(),
        &mut owner,
        Some(&mut session),
        &AuthValue::from("mysecret"),
    )
    .expect("retained session still usable");
    assert_ne!(session.nonces().unwrap().0, before.0.as_slice());
    ctx.release(release).unwrap();
}

#[test]
fn test_seal_without_password() {
    let mut ctx = common::context();
    let srk = common::primary(&mut ctx, "");
    let mut parent = common::password(&ctx, "");
    let sealed = ctx
        .seal(&srk.entity(), &mut parent, None, b"secret", &AuthValue::empty())
        .unwrap();
    let sealed = ctx.load(&srk.entity(), &mut parent, None, &sealed).unwrap();

    let mut item = common::password(&ctx, "");
    let data = ctx.unseal(&sealed.entity(), &mut item, None).unwrap();
    assert_eq!(data.as_slice(), b"secret");
    println!("✓ unsealed {:?}", String::from_utf8_lossy(&data));
}

#[test]
fn test_seal_with_password() {
    let mut ctx = common::context();
    let srk = common::primary(&mut ctx, "");
    let mut parent = common::hmac(&ctx, "");
    let sealed = ctx
        .seal(
            &srk.entity(),
            &mut parent,
            None,
            b"secret",
            &AuthValue::from("mypassword"),
        )
        .unwrap();
    let sealed = ctx.load(&srk.entity(), &mut parent, None, &sealed).unwrap();

    let mut wrong = common::hmac(&ctx, "wrongpassword");
    let err = ctx.unseal(&sealed.entity(), &mut wrong, None).unwrap_err();
    match err {
        Error::WrongSecret { command, code, .. } => {
            assert_eq!(command, TpmCc::Unseal);
            assert_eq!(code.base(), tpm_rc::AUTH_FAIL);
        }
        other => panic!("expected WrongSecret, got {other:?}"),
    }

    let mut wrong = common::password(&ctx, "wrongpassword");
    assert!(matches!(
        ctx.unseal(&sealed.entity(), &mut wrong, None),
        Err(Error::WrongSecret { .. })
    ));

    let mut right = common::hmac(&ctx, "mypassword");
    let data = ctx.unseal(&sealed.entity(), &mut right, None).unwrap();
    assert_eq!(data.as_slice(), b"secret");
}

#[test]
fn test_hierarchy_change_auth() {
    let mut ctx = common::context();
    let template = TpmtPublic::rsa_storage_key();

    let mut owner = common::hmac(&ctx, "");
    ctx.hierarchy_change_auth(&Entity::owner(), &mut owner, None, &AuthValue::from("newowner"))
        .expect("change owner auth");

    let mut old = common::hmac(&ctx, "");
    assert!(matches!(
        ctx.create_primary(&Entity::owner(), &mut old, None, &template, &AuthValue::empty()),
        Err(Error::WrongSecret { .. })
    ));

    let mut new = common::password(&ctx, "newowner");
    let key = ctx
        .create_primary(&Entity::owner(), &mut new, None, &template, &AuthValue::empty())
        .expect("new owner auth accepted");
    ctx.flush_context(key).unwrap();

    // Change it back under the new value.
    let mut owner = common::hmac(&ctx, "newowner");
    ctx.hierarchy_change_auth(&Entity::owner(), &mut owner, None, &AuthValue::empty())
        .expect("restore owner auth");
}

#[test]
fn test_bound_session_skips_auth_for_bind_entity() {
    let mut ctx = common::context();
    let parent = common::primary(&mut ctx, "bindpassword");

    let bound =
        SessionDescriptor::bound(TpmAlgId::Sha256, parent.entity(), "bindpassword").unwrap();
    let (mut session, release) = ctx.start_session(&bound).unwrap();

    let sensitive = tpm2_session::Tpm2bSensitiveCreate::with_auth(b"childpassword");
    let child = ctx
        .create(
            &parent.entity(),
            &mut session,
            None,
            &TpmtPublic::rsa_storage_key(),
            &sensitive,
        )
        .expect("create under the bind entity");
    let child = ctx
        .load(&parent.entity(), &mut session, None, &child)
        .expect("load under the bind entity");
    let read = ctx.read_public(child.handle).unwrap();
    assert_eq!(read.name, child.name);

    ctx.release(release).unwrap();
    ctx.flush_context(child).unwrap();
    ctx.flush_context(parent).unwrap();
}

#[test]
fn test_bound_session_needs_auth_for_other_entities() {
    let mut ctx = common::context_with(owner_with("mysecret"));
    let mut owner = common::password(&ctx, "mysecret");
    let key = ctx
        .create_primary(
            &Entity::owner(),
            &mut owner,
            None,
            &TpmtPublic::rsa_storage_key(),
            &AuthValue::from("bindpassword"),
        )
        .unwrap();

    let without_owner_auth =
        SessionDescriptor::bound(TpmAlgId::Sha256, key.entity(), "bindpassword").unwrap();
    let (mut session, release) = ctx.start_session(&without_owner_auth).unwrap();
    assert!(matches!(
        ctx.hierarchy_change_auth(&Entity::owner(), &mut session, None, &AuthValue::from("mysecret")),
        Err(Error::WrongSecret { .. })
    ));
    ctx.release(release).unwrap();

    let with_owner_auth = SessionDescriptor::hmac(TpmAlgId::Sha256)
        .bound(key.entity(), "bindpassword")
        .auth("mysecret")
        .build()
        .unwrap();
    let (mut session, release) = ctx.start_session(&with_owner_auth).unwrap();
    ctx.hierarchy_change_auth(&Entity::owner(), &mut session, None, &AuthValue::from("mysecret"))
        .expect("owner auth supplied for a non-bind entity");
    ctx.release(release).unwrap();
    ctx.flush_context(key).unwrap();
}

#[test]
fn test_nv_index_lifecycle() {
    let mut ctx = common::context();
    let index = 0x0150_0001;
    let mut owner = common::hmac(&ctx, "");
    let info = ctx
        .nv_define_space(&mut owner, None, index, 32, &AuthValue::from("nvpassword"))
        .unwrap();
    assert_eq!(info.handle, index);

    let read = ctx.nv_read_public(index).unwrap();
    assert_eq!(read.name, info.name);
    assert_eq!(read.public.data_size, 32);

    let mut owner = common::hmac(&ctx, "");
    let err = ctx
        .nv_define_space(&mut owner, None, index, 32, &AuthValue::empty())
        .unwrap_err();
    match err {
        Error::Tpm { code, .. } => assert_eq!(code.base(), tpm_rc::NV_DEFINED),
        other => panic!("expected NV_DEFINED, got {other:?}"),
    }

    let mut owner = common::hmac(&ctx, "");
    ctx.nv_undefine_space(&mut owner, None, info).unwrap();
    assert!(matches!(ctx.nv_read_public(index), Err(Error::Tpm { .. })));
}

#[test]
fn test_nv_define_rejects_non_nv_handle() {
    let mut ctx = common::context();
    let mut owner = common::password(&ctx, "");
    assert!(matches!(
        ctx.nv_define_space(&mut owner, None, 0x8000_0000, 32, &AuthValue::empty()),
        Err(Error::Configuration(_))
    ));
}
