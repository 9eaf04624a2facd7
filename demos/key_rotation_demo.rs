//! Minimal example: rotating a tenant's wrapping key.
//!
//! Provisions a tenant, generates a signing key, rotates the master wrapping
//! key and migrates the signing key's material to it. Signing keeps working
//! the whole way through.
//! Run with: `cargo run --example key_rotation_demo`

use softhsm::entities::HsmAssociationEntity;
use softhsm::schemes::{KeyScheme, SignatureSpec};
use softhsm::service::{
    KeyGenerationRequest, KeyReference, SignRequest, WrappingKeyContext, WrappingKeyParent,
    SOFT_HSM_ID,
};
use softhsm::{build_default_service, CryptoService, Repositories, SoftHsmConfig};

const CONFIG: &str = r#"
[retry]
max_attempts = 3
attempt_timeout_ms = 5000

[[root_keys]]
name = "root"
passphrase = "demo passphrase, never use in production"
salt = "demo salt"
"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Setup
    let config = SoftHsmConfig::from_toml_str(CONFIG)?;
    let repositories = Repositories::in_memory();
    let service = build_default_service(&config, repositories.clone())?;
    let tenant = "tenant-a";
    let under_root = WrappingKeyContext::new(tenant, WrappingKeyParent::Unmanaged("root".into()));

    // 2. Provision the tenant with master wrapping key k1
    service.create_wrapping_key("k1", true, &under_root)?;
    repositories
        .associations
        .save(HsmAssociationEntity::new(tenant, SOFT_HSM_ID, Some("k1".into())))?;

    // 3. Generate and use a signing key
    let public = service.generate_key_pair(
        &KeyGenerationRequest::new(tenant, "LEDGER", KeyScheme::EcdsaP256).with_alias("notary"),
    )?;
    let request = SignRequest::new(
        tenant,
        KeyReference::from(&public),
        b"transaction #1",
        SignatureSpec::EcdsaSha256,
    );
    let signature = service.sign(&request)?;
    println!(
        "Signed with {} (verified: {})",
        public.key_id(),
        public.verify(SignatureSpec::EcdsaSha256, b"transaction #1", &signature)
    );

    // 4. Rotate: create k2 and make it the tenant's master key
    let wrapping = repositories.wrapping.create(tenant)?;
    let k1 = wrapping.find_key("k1")?.ok_or("k1 missing")?;
    service.create_wrapping_key("k2", true, &under_root)?;
    repositories.associations.set_master_key_alias(tenant, "k2")?;

    // 5. Migrate signing-key material from k1 to k2
    let summary = service.rewrap_all_signing_keys_wrapped_by(k1.id, tenant)?;
    println!(
        "Rewrapped {} key(s) under {} ({} already present)",
        summary.migrated, summary.target_wrapping_key_id, summary.already_present
    );

    // 6. Signing still works, now through k2
    let signature = service.sign(&request)?;
    println!(
        "Signed again (verified: {})",
        public.verify(SignatureSpec::EcdsaSha256, b"transaction #1", &signature)
    );

    let materials = repositories
        .signing
        .create(tenant)?
        .key_materials_wrapped_by(k1.id)?;
    println!("{} material row(s) still wrapped by k1", materials.len());

    Ok(())
}
