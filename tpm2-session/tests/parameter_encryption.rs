// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use tpm2_session::{
    tpm_rc, AuthValue, Command, Direction, Entity, Error, SessionDescriptor, TpmAlgId, TpmCc,
    TpmtPublic, MAX_SYM_DATA,
};

mod common;

#[test]
fn test_salted_session_hides_key_password() {
    let mut ctx = common::context();
    let srk = common::primary(&mut ctx, "");
    let (mut enc, release) = common::salted(&mut ctx, &srk);
    ctx.transport_mut().clear_wire_log();

    let mut owner = common::hmac(&ctx, "");
    let key = ctx
        .create_primary(
            &Entity::owner(),
            &mut owner,
            Some(&mut enc),
            &TpmtPublic::rsa_storage_key(),
            &AuthValue::from("encryptedpassword"),
        )
        .unwrap();
    assert!(!ctx.transport().wire_contains(b"encryptedpassword"));
    println!("✓ key password never crossed the wire in the clear");

    ctx.release(release).unwrap();
    ctx.flush_context(key).unwrap();
    ctx.flush_context(srk).unwrap();
}

#[test]
fn test_password_session_leaks_key_password() {
    let mut ctx = common::context();
    let key = common::primary(&mut ctx, "plainpassword");
    assert!(ctx.transport().wire_contains(b"plainpassword"));
    ctx.flush_context(key).unwrap();
}

#[test]
fn test_seal_and_unseal_through_encryption_session() {
    let mut ctx = common::context();
    let srk = common::primary(&mut ctx, "");
    let (mut enc, release) = common::salted(&mut ctx, &srk);
    ctx.transport_mut().clear_wire_log();

    let mut parent = common::hmac(&ctx, "");
    let sealed = ctx
        .seal(&srk.entity(), &mut parent, Some(&mut enc), b"top secret", &AuthValue::from("mypassword"))
        .unwrap();
    let sealed = ctx
        .load(&srk.entity(), &mut parent, Some(&mut enc), &sealed)
        .unwrap();
    let mut item = common::hmac(&ctx, "mypassword");
    let data = ctx
        .unseal(&sealed.entity(), &mut item, Some(&mut enc))
        .unwrap();
    assert_eq!(data.as_slice(), b"top secret");

    for secret in [&b"top secret"[..], b"mypassword"] {
        assert!(!ctx.transport().wire_contains(secret));
    }
    ctx.release(release).unwrap();
}

#[test]
fn test_response_only_encryption() {
    let mut ctx = common::context();
    let srk = common::primary(&mut ctx, "");
    let descriptor = SessionDescriptor::hmac(TpmAlgId::Sha256)
        .salted(srk.entity(), srk.public.clone())
        .aes_cfb(128, Direction::Out)
        .build()
        .unwrap();
    let (mut enc, release) = ctx.start_session(&descriptor).unwrap();

    let mut parent = common::password(&ctx, "");
    let sealed = ctx
        .seal(&srk.entity(), &mut parent, Some(&mut enc), b"outbound", &AuthValue::empty())
        .unwrap();
    // The command direction is not covered, so the data went out in the clear.
    assert!(ctx.transport().wire_contains(b"outbound"));

    let sealed = ctx.load(&srk.entity(), &mut parent, None, &sealed).unwrap();
    ctx.transport_mut().clear_wire_log();
    let mut item = common::password(&ctx, "");
    let data = ctx
        .unseal(&sealed.entity(), &mut item, Some(&mut enc))
        .unwrap();
    assert_eq!(data.as_slice(), b"outbound");
    assert!(!ctx.transport().wire_contains(b"outbound"));
    ctx.release(release).unwrap();
}

#[test]
fn test_unbound_auth_session_encrypts() {
    let mut ctx = common::context();
    let srk = common::primary(&mut ctx, "");
    ctx.transport_mut().clear_wire_log();

    let descriptor = SessionDescriptor::hmac(TpmAlgId::Sha256)
        .auth("")
        .aes_cfb(128, Direction::InOut)
        .build()
        .unwrap();
    let mut parent = ctx.build_session(&descriptor).unwrap();
    ctx.seal(&srk.entity(), &mut parent, None, b"unbound-secret", &AuthValue::empty())
        .unwrap();
    assert!(!ctx.transport().wire_contains(b"unbound-secret"));
}

#[test]
fn test_sha384_aes256_session() {
    let mut ctx = common::context();
    let srk = common::primary(&mut ctx, "");
    let descriptor = SessionDescriptor::hmac(TpmAlgId::Sha384)
        .salted(srk.entity(), srk.public.clone())
        .aes_cfb(256, Direction::InOut)
        .nonce_size(48)
        .build()
        .unwrap();
    let (mut enc, release) = ctx.start_session(&descriptor).unwrap();
    assert_eq!(enc.nonces().unwrap().0.len(), 48);

    let mut parent = common::hmac(&ctx, "");
    let sealed = ctx
        .seal(&srk.entity(), &mut parent, Some(&mut enc), b"wide", &AuthValue::empty())
        .unwrap();
    let sealed = ctx
        .load(&srk.entity(), &mut parent, Some(&mut enc), &sealed)
        .unwrap();
    let mut item = common::hmac(&ctx, "");
    let data = ctx
        .unseal(&sealed.entity(), &mut item, Some(&mut enc))
        .unwrap();
    assert_eq!(data.as_slice(), b"wide");
    ctx.release(release).unwrap();
}

#[test]
fn test_seal_size_limit() {
    let mut ctx = common::context();
    let srk = common::primary(&mut ctx, "");
    let mut parent = common::password(&ctx, "");

    let largest = vec![0x5a; MAX_SYM_DATA];
    let sealed = ctx
        .seal(&srk.entity(), &mut parent, None, &largest, &AuthValue::empty())
        .expect("MAX_SYM_DATA bytes seal");
    let sealed = ctx.load(&srk.entity(), &mut parent, None, &sealed).unwrap();
    let data = ctx.unseal(&sealed.entity(), &mut parent, None).unwrap();
    assert_eq!(data.as_slice(), largest.as_slice());

    let too_large = vec![0x5a; MAX_SYM_DATA + 1];
    assert!(matches!(
        ctx.seal(&srk.entity(), &mut parent, None, &too_large, &AuthValue::empty()),
        Err(Error::Configuration(_))
    ));
}

fn change_auth_command(new_auth: &[u8]) -> Command {
    let mut cmd = Command::new(TpmCc::HierarchyChangeAuth);
    cmd.add_auth_handle(Entity::owner()).unwrap();
    cmd.add_sensitive(new_auth).unwrap();
    cmd
}

#[test]
fn test_parameter_size_limit() {
    let mut ctx = common::context();
    assert_eq!(ctx.config().max_parameter_size, 1024);
    let srk = common::primary(&mut ctx, "");
    let (mut enc, release) = common::salted(&mut ctx, &srk);

    // 1024 bytes are encrypted and sent; the device rejects an auth that long.
    let mut owner = common::password(&ctx, "");
    let err = ctx
        .execute(&change_auth_command(&[0x11; 1024]), &mut [&mut owner, &mut enc])
        .unwrap_err();
    match err {
        Error::Tpm { code, .. } => {
            assert_eq!(code, tpm2_session::ResponseCode::for_parameter(tpm_rc::SIZE, 1));
            assert_eq!(code.0, 0x1D5);
        }
        other => panic!("expected a size error from the TPM, got {other:?}"),
    }
    assert!(!enc.is_poisoned());

    // 1025 bytes never leave the host.
    ctx.transport_mut().clear_wire_log();
    let err = ctx
        .execute(&change_auth_command(&[0x11; 1025]), &mut [&mut owner, &mut enc])
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(ctx.transport().wire_log().is_empty());
    assert!(!enc.is_poisoned());

    // The session stayed in sync through both failures.
    ctx.execute(&change_auth_command(b""), &mut [&mut owner, &mut enc])
        .expect("session usable after rejected parameters");
    ctx.release(release).unwrap();
}

#[test]
fn test_session_level_parameter_encryption() {
    let mut ctx = common::context();
    let descriptor = SessionDescriptor::hmac(TpmAlgId::Sha256)
        .aes_cfb(128, Direction::InOut)
        .build()
        .unwrap();
    let (mut session, release) = ctx.start_session(&descriptor).unwrap();

    session.prepare(None, true, false).unwrap();
    let mut block = vec![0u8; 1024];
    session.encrypt_parameter(&mut block).unwrap();
    assert_ne!(block, vec![0u8; 1024]);

    let mut oversized = vec![0u8; 1025];
    assert!(matches!(
        session.encrypt_parameter(&mut oversized),
        Err(Error::Configuration(_))
    ));
    assert!(oversized.iter().all(|&b| b == 0));

    let mut password = ctx
        .build_session(&SessionDescriptor::password(""))
        .unwrap();
    password.prepare(Some(&Entity::owner()), false, false).unwrap();
    assert!(matches!(
        password.encrypt_parameter(&mut [0u8; 16]),
        Err(Error::Configuration(_))
    ));
    ctx.release(release).unwrap();
}

#[test]
fn test_two_decrypt_sessions_rejected() {
    let mut ctx = common::context();
    let descriptor = SessionDescriptor::unbound(TpmAlgId::Sha256).unwrap();
    let (mut first, first_release) = ctx.start_session(&descriptor).unwrap();
    let (mut second, second_release) = ctx.start_session(&descriptor).unwrap();
    let mut owner = common::password(&ctx, "");

    ctx.transport_mut().clear_wire_log();
    let err = ctx
        .execute(
            &change_auth_command(b""),
            &mut [&mut owner, &mut first, &mut second],
        )
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(ctx.transport().wire_log().is_empty());

    ctx.release(first_release).unwrap();
    ctx.release(second_release).unwrap();
}

#[test]
fn test_sha512_session_salted_to_sha256_key() {
    let mut ctx = common::context();
    let srk = common::primary(&mut ctx, "");
    assert_eq!(srk.public.name_alg, TpmAlgId::Sha256);
    let descriptor = SessionDescriptor::hmac(TpmAlgId::Sha512)
        .salted(srk.entity(), srk.public.clone())
        .aes_cfb(128, Direction::InOut)
        .build()
        .unwrap();
    // The simulator refuses a seed longer than the salt key's name digest.
    let (mut enc, release) = ctx
        .start_session(&descriptor)
        .expect("seed sized by the salt key");

    let mut parent = common::hmac(&ctx, "");
    let sealed = ctx
        .seal(&srk.entity(), &mut parent, Some(&mut enc), b"mixed", &AuthValue::empty())
        .unwrap();
    let sealed = ctx.load(&srk.entity(), &mut parent, None, &sealed).unwrap();
    let mut item = common::hmac(&ctx, "");
    let data = ctx.unseal(&sealed.entity(), &mut item, Some(&mut enc)).unwrap();
    assert_eq!(data.as_slice(), b"mixed");
    assert!(!ctx.transport().wire_contains(b"mixed"));
    ctx.release(release).unwrap();
}
