mod common;

use common::{config, provisioned_service, TENANT};
use softhsm::entities::{HsmAssociationEntity, SigningKeyStatus};
use softhsm::schemes::{KeyScheme, SignatureSpec};
use softhsm::service::{
    CryptoService, KeyGenerationRequest, KeyReference, Repositories, SharedSecretSpec,
    SignRequest, WrappingKeyContext, WrappingKeyParent, SOFT_HSM_ID,
};
use softhsm::{build_default_service, SoftHsmError};

#[test]
fn every_scheme_and_spec_signs_through_the_default_stack() {
    let repositories = Repositories::in_memory();
    let service = build_default_service(&config(), repositories.clone()).unwrap();
    service
        .create_wrapping_key(
            "k1",
            true,
            &WrappingKeyContext::new(TENANT, WrappingKeyParent::Unmanaged("root".into())),
        )
        .unwrap();
    repositories
        .associations
        .save(HsmAssociationEntity::new(TENANT, SOFT_HSM_ID, Some("k1".into())))
        .unwrap();

    for (scheme, specs) in service.supported_schemes() {
        let public = service
            .generate_key_pair(&KeyGenerationRequest::new(TENANT, "LEDGER", scheme))
            .unwrap();
        assert_eq!(public.scheme, scheme);
        for spec in specs {
            let sig = service
                .sign(&SignRequest::new(TENANT, KeyReference::from(&public), b"msg", spec))
                .unwrap();
            assert!(public.verify(spec, b"msg", &sig), "{scheme:?} {spec:?}");
        }
    }
}

#[test]
fn keys_are_addressable_by_alias() {
    let service = provisioned_service(Repositories::in_memory());
    let public = service
        .generate_key_pair(
            &KeyGenerationRequest::new(TENANT, "LEDGER", KeyScheme::EcdsaP384)
                .with_alias("notary")
                .with_external_id("ext-1"),
        )
        .unwrap();

    let entity = service
        .lookup_signing_key(TENANT, &KeyReference::Alias("notary".into()))
        .unwrap();
    assert_eq!(entity.public_key, public.encoded);
    assert_eq!(entity.key_id, public.key_id());
    assert_eq!(entity.external_id.as_deref(), Some("ext-1"));

    let sig = service
        .sign(&SignRequest::new(
            TENANT,
            KeyReference::Alias("notary".into()),
            b"msg",
            SignatureSpec::EcdsaSha384Plain,
        ))
        .unwrap();
    assert!(public.verify(SignatureSpec::EcdsaSha384Plain, b"msg", &sig));

    let err = service
        .generate_key_pair(
            &KeyGenerationRequest::new(TENANT, "LEDGER", KeyScheme::Ed25519).with_alias("notary"),
        )
        .unwrap_err();
    assert!(matches!(err, SoftHsmError::BadRequest(_)));
}

#[test]
fn destroyed_keys_refuse_to_sign() {
    let repositories = Repositories::in_memory();
    let service = provisioned_service(repositories.clone());
    service
        .generate_key_pair(
            &KeyGenerationRequest::new(TENANT, "LEDGER", KeyScheme::Ed25519).with_alias("old"),
        )
        .unwrap();
    let entity = service
        .lookup_signing_key(TENANT, &KeyReference::Alias("old".into()))
        .unwrap();
    repositories
        .signing
        .create(TENANT)
        .unwrap()
        .set_status(entity.id, SigningKeyStatus::Destroyed)
        .unwrap();

    let err = service
        .sign(&SignRequest::new(
            TENANT,
            KeyReference::Alias("old".into()),
            b"msg",
            SignatureSpec::EdDsa,
        ))
        .unwrap_err();
    assert!(matches!(err, SoftHsmError::BadRequest(_)));
}

#[test]
fn destroyed_keys_refuse_public_key_lookups_after_caching() {
    let repositories = Repositories::in_memory();
    let service = provisioned_service(repositories.clone());
    let signer = service
        .generate_key_pair(&KeyGenerationRequest::new(TENANT, "LEDGER", KeyScheme::Ed25519))
        .unwrap();
    let agreer = service
        .generate_key_pair(&KeyGenerationRequest::new(TENANT, "SESSION_INIT", KeyScheme::X25519))
        .unwrap();
    let peer = service
        .generate_key_pair(&KeyGenerationRequest::new(TENANT, "SESSION_INIT", KeyScheme::X25519))
        .unwrap();

    // Both keys are cached by short key id after this.
    let request = SignRequest::new(
        TENANT,
        KeyReference::from(&signer),
        b"msg",
        SignatureSpec::EdDsa,
    );
    service.sign(&request).unwrap();
    let shared = SharedSecretSpec {
        tenant_id: TENANT.into(),
        public_key: agreer.encoded.clone(),
        other_public_key: peer.encoded.clone(),
    };
    service.derive_shared_secret(&shared).unwrap();

    let signing = repositories.signing.create(TENANT).unwrap();
    for public in [&signer, &agreer] {
        let row = signing.find_by_public_key(&public.encoded).unwrap().unwrap();
        signing.set_status(row.id, SigningKeyStatus::Destroyed).unwrap();
    }

    assert!(matches!(service.sign(&request), Err(SoftHsmError::BadRequest(_))));
    assert!(matches!(
        service.derive_shared_secret(&shared),
        Err(SoftHsmError::BadRequest(_))
    ));
}

#[test]
fn mismatched_spec_is_rejected() {
    let service = provisioned_service(Repositories::in_memory());
    let public = service
        .generate_key_pair(&KeyGenerationRequest::new(TENANT, "LEDGER", KeyScheme::Ed25519))
        .unwrap();
    let err = service
        .sign(&SignRequest::new(
            TENANT,
            KeyReference::from(&public),
            b"msg",
            SignatureSpec::EcdsaSha256,
        ))
        .unwrap_err();
    assert!(matches!(err, SoftHsmError::BadRequest(_)));
}

#[test]
fn unknown_keys_and_tenants_are_not_found() {
    let service = provisioned_service(Repositories::in_memory());
    let public = service
        .generate_key_pair(&KeyGenerationRequest::new(TENANT, "LEDGER", KeyScheme::Ed25519))
        .unwrap();

    let unknown = SignRequest::new(
        TENANT,
        KeyReference::PublicKey(vec![1, 2, 3]),
        b"msg",
        SignatureSpec::EdDsa,
    );
    assert!(matches!(service.sign(&unknown), Err(SoftHsmError::NotFound(_))));

    // Another tenant cannot reach this tenant's key.
    let foreign = SignRequest::new(
        "tenant-b",
        KeyReference::from(&public),
        b"msg",
        SignatureSpec::EdDsa,
    );
    assert!(matches!(service.sign(&foreign), Err(SoftHsmError::NotFound(_))));
}

#[test]
fn x25519_keys_agree_on_a_shared_secret() {
    let service = provisioned_service(Repositories::in_memory());
    let ours = service
        .generate_key_pair(&KeyGenerationRequest::new(TENANT, "SESSION_INIT", KeyScheme::X25519))
        .unwrap();
    let theirs = service
        .generate_key_pair(&KeyGenerationRequest::new(TENANT, "SESSION_INIT", KeyScheme::X25519))
        .unwrap();

    let a = service
        .derive_shared_secret(&SharedSecretSpec {
            tenant_id: TENANT.into(),
            public_key: ours.encoded.clone(),
            other_public_key: theirs.encoded.clone(),
        })
        .unwrap();
    let b = service
        .derive_shared_secret(&SharedSecretSpec {
            tenant_id: TENANT.into(),
            public_key: theirs.encoded.clone(),
            other_public_key: ours.encoded.clone(),
        })
        .unwrap();
    assert_eq!(a.len(), 32);
    assert_eq!(a, b);

    // Agreement keys cannot sign, and signing keys cannot agree.
    let err = service
        .sign(&SignRequest::new(
            TENANT,
            KeyReference::from(&ours),
            b"msg",
            SignatureSpec::EdDsa,
        ))
        .unwrap_err();
    assert!(matches!(err, SoftHsmError::BadRequest(_)));

    let signer = service
        .generate_key_pair(&KeyGenerationRequest::new(TENANT, "LEDGER", KeyScheme::Ed25519))
        .unwrap();
    let err = service
        .derive_shared_secret(&SharedSecretSpec {
            tenant_id: TENANT.into(),
            public_key: signer.encoded,
            other_public_key: theirs.encoded,
        })
        .unwrap_err();
    assert!(matches!(err, SoftHsmError::BadRequest(_)));
}
