//! Audit entry signatures
//!
//! The signature is HMAC-SHA256 over a canonical JSON rendering of every entry field
//! except the row id. Timestamps are truncated to microseconds before signing so that
//! entries read back from Postgres still verify.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tally_core::models::{AuditEntry, NewAuditEntry};
use tally_core::AppError;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies audit entries with a shared secret
#[derive(Clone)]
pub struct AuditSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSigner").finish_non_exhaustive()
    }
}

impl AuditSigner {
    pub fn new(secret: &str) -> Result<Self, AppError> {
        if secret.is_empty() {
            return Err(AppError::InvalidInput(
                "Audit signing secret must not be empty".to_string(),
            ));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AppError::Internal(format!("Invalid audit signing key: {}", e)))?;
        Ok(Self { mac })
    }

    /// Stamp and sign a new entry.
    pub fn sign(&self, entry: NewAuditEntry, recorded_at: DateTime<Utc>) -> AuditEntry {
        let recorded_at = recorded_at.trunc_subsecs(6);
        let mut signed = AuditEntry {
            id: Uuid::new_v4(),
            tenant_id: entry.tenant_id,
            actor_id: entry.actor_id,
            action: entry.action,
            entity_ref: entry.entity_ref,
            before: entry.before,
            after: entry.after,
            recorded_at,
            signature: String::new(),
        };
        signed.signature = self.signature_for(&signed);
        signed
    }

    /// Recompute the signature and compare in constant time.
    pub fn verify(&self, entry: &AuditEntry) -> bool {
        let expected = self.signature_for(entry);
        expected.as_bytes().ct_eq(entry.signature.as_bytes()).into()
    }

    fn signature_for(&self, entry: &AuditEntry) -> String {
        let mut mac = self.mac.clone();
        mac.update(&canonical_bytes(entry));
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Object keys serialize in sorted order, so equal entries always render identically.
fn canonical_bytes(entry: &AuditEntry) -> Vec<u8> {
    json!({
        "tenant_id": entry.tenant_id,
        "actor_id": entry.actor_id,
        "action": entry.action.as_str(),
        "entity_ref": entry.entity_ref,
        "before": entry.before,
        "after": entry.after,
        "recorded_at": entry
            .recorded_at
            .to_rfc3339_opts(SecondsFormat::Micros, true),
    })
    .to_string()
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::models::AuditAction;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn entry() -> NewAuditEntry {
        NewAuditEntry::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            AuditAction::DeductionSucceeded,
            "item:42",
        )
        .with_before(json!({ "quantity_on_hand": 10 }))
        .with_after(json!({ "quantity_on_hand": 5 }))
    }

    #[test]
    fn test_signed_entry_verifies() {
        let signer = AuditSigner::new(SECRET).unwrap();
        let signed = signer.sign(entry(), Utc::now());
        assert_eq!(signed.signature.len(), 64);
        assert!(signer.verify(&signed));
    }

    #[test]
    fn test_any_field_change_breaks_signature() {
        let signer = AuditSigner::new(SECRET).unwrap();
        let signed = signer.sign(entry(), Utc::now());

        let mut tampered = signed.clone();
        tampered.after = Some(json!({ "quantity_on_hand": 6 }));
        assert!(!signer.verify(&tampered));

        let mut tampered = signed.clone();
        tampered.action = AuditAction::DeductionFailed;
        assert!(!signer.verify(&tampered));

        let mut tampered = signed.clone();
        tampered.recorded_at += chrono::Duration::microseconds(1);
        assert!(!signer.verify(&tampered));

        let mut tampered = signed;
        tampered.actor_id = Uuid::new_v4();
        assert!(!signer.verify(&tampered));
    }

    #[test]
    fn test_other_key_does_not_verify() {
        let signed = AuditSigner::new(SECRET).unwrap().sign(entry(), Utc::now());
        let other = AuditSigner::new("another-secret-another-secret-000").unwrap();
        assert!(!other.verify(&signed));
    }

    #[test]
    fn test_timestamp_is_truncated_to_micros() {
        let signer = AuditSigner::new(SECRET).unwrap();
        let at = DateTime::from_timestamp(1_800_000_000, 123_456_789).unwrap();
        let signed = signer.sign(entry(), at);
        assert_eq!(signed.recorded_at.timestamp_subsec_nanos(), 123_456_000);
        assert!(signer.verify(&signed));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(AuditSigner::new("").is_err());
    }
}
