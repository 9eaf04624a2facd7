//! Migration of signing-key material to the tenant's current wrapping key.
//!
//! For every material row wrapped by the old key:
//! 1. Unwrap under the old key's chain
//! 2. Re-wrap under the current key's chain
//! 3. Insert a new row keyed by `(current_id, signing_key_id)`
//!
//! Old rows are never updated or deleted, so a signing call that already
//! picked the old row still succeeds while the migration runs. All chain
//! lookups and all unwrapping happen before the first insert, so a failed
//! precondition or authentication error leaves the catalog untouched.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::SigningKeyMaterialEntity;
use crate::error::SoftHsmError;
use crate::service::{RewrapSummary, SoftCryptoService};

impl SoftCryptoService {
    pub(crate) fn rewrap_signing_keys(
        &self,
        old_wrapping_key_id: Uuid,
        tenant_id: &str,
    ) -> Result<RewrapSummary, SoftHsmError> {
        if tenant_id.trim().is_empty() {
            return Err(SoftHsmError::BadRequest("tenant id must not be blank".into()));
        }
        let wrapping = self.wrapping_repo(tenant_id)?;
        let signing = self.signing_repo(tenant_id)?;

        // Migrate to whatever is current now, which may be the old key itself.
        let current = self.current_wrapping_key_info(tenant_id, wrapping.as_ref())?;

        let old = wrapping
            .find_key_by_id(old_wrapping_key_id)?
            .ok_or_else(|| {
                SoftHsmError::IllegalState(format!(
                    "Unable to find existing wrapping key with id {old_wrapping_key_id} for tenant '{tenant_id}'"
                ))
            })?;

        let resolver = self.resolver(tenant_id, wrapping.as_ref());
        let current_chain = resolver.parent_chain(&current)?;
        let old_chain = resolver.parent_chain(&old)?;

        let mut summary = RewrapSummary {
            target_wrapping_key_id: current.id,
            migrated: 0,
            already_present: 0,
        };
        if old.id == current.id {
            debug!(tenant_id, alias = %old.alias, "wrapping key is already current, nothing to rewrap");
            return Ok(summary);
        }

        let current_key = resolver.peel(&current_chain)?;
        let old_key = resolver.peel(&old_chain)?;

        let rows = signing.key_materials_wrapped_by(old.id)?;
        info!(
            tenant_id,
            from = %old.alias,
            to = %current.alias,
            rows = rows.len(),
            "rewrapping signing keys"
        );

        let mut rewrapped = Vec::with_capacity(rows.len());
        for row in &rows {
            let plain = old_key.unwrap(&row.key_material)?;
            rewrapped.push(SigningKeyMaterialEntity {
                wrapping_key_id: current.id,
                signing_key_id: row.signing_key_id,
                key_material: current_key.wrap(&plain)?,
                created: Utc::now(),
            });
        }

        for material in rewrapped {
            let signing_key_id = material.signing_key_id;
            if signing.insert_key_material(material)? {
                summary.migrated += 1;
            } else {
                debug!(tenant_id, %signing_key_id, "material already present under target key");
                summary.already_present += 1;
            }
        }

        info!(
            tenant_id,
            from = %old.alias,
            to = %current.alias,
            migrated = summary.migrated,
            already_present = summary.already_present,
            "rewrap complete"
        );
        Ok(summary)
    }
}
