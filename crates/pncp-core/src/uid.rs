//! Stable notice identity.
//!
//! Two disjoint value spaces: the preferred form concatenates the organ tax
//! id, year and sequential number with `-` and therefore always contains the
//! separator; the fallback form is a bare sha256 hex digest and never does.

use sha2::{Digest, Sha256};

use crate::RawNotice;

pub const UID_SEPARATOR: char = '-';

/// Preferred UID when all three natural-key fields are present and none of
/// them contains the separator. Violations force the fallback form instead
/// of escaping.
pub fn preferred_uid(organ_tax_id: &str, year: &str, seq_no: &str) -> Option<String> {
    let parts = [organ_tax_id.trim(), year.trim(), seq_no.trim()];
    if parts
        .iter()
        .any(|part| part.is_empty() || part.contains(UID_SEPARATOR))
    {
        return None;
    }
    Some(parts.join("-"))
}

/// Deterministic fallback UID: sha256 over the ordered tuple
/// (title, city, organ, raw publication date), fields delimited by U+001F
/// so adjacent fields cannot run together.
pub fn fallback_uid(title: &str, city: &str, organ: &str, published_raw: &str) -> String {
    let mut hasher = Sha256::new();
    for (index, field) in [title, city, organ, published_raw].iter().enumerate() {
        if index > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Derives the UID for a raw record, preferring the natural key.
pub fn derive_uid(raw: &RawNotice) -> String {
    if let (Some(cnpj), Some(year), Some(seq)) = (
        raw.orgao_cnpj.as_deref(),
        raw.ano.as_deref(),
        raw.numero_sequencial.as_deref(),
    ) {
        if let Some(uid) = preferred_uid(cnpj, year, seq) {
            return uid;
        }
    }
    fallback_uid(
        raw.display_title().unwrap_or(""),
        raw.municipio_nome.as_deref().unwrap_or(""),
        raw.organ().unwrap_or(""),
        raw.published_raw().unwrap_or(""),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawNotice {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn preferred_uid_concatenates_natural_key() {
        assert_eq!(
            preferred_uid("12345678000190", "2024", "15").as_deref(),
            Some("12345678000190-2024-15")
        );
    }

    #[test]
    fn separator_in_any_field_forces_fallback() {
        assert_eq!(preferred_uid("123-456", "2024", "15"), None);
        assert_eq!(preferred_uid("123", "2024-25", "15"), None);
        assert_eq!(preferred_uid("123", "2024", ""), None);

        let record = raw(json!({
            "orgao_cnpj": "123-456",
            "ano": "2024",
            "numero_sequencial": "15",
            "titulo": "Pregão X",
            "municipio_nome": "A",
            "orgao": "B",
            "data": "2024-01-01",
        }));
        let uid = derive_uid(&record);
        assert_eq!(uid.len(), 64);
        assert!(!uid.contains(UID_SEPARATOR));
    }

    #[test]
    fn fallback_uid_is_deterministic_for_identical_input() {
        let record = raw(json!({
            "titulo": "Pregão X",
            "municipio_nome": "A",
            "orgao": "B",
            "data": "2024-01-01",
        }));
        assert_eq!(derive_uid(&record), derive_uid(&record));
        assert_eq!(
            derive_uid(&record),
            fallback_uid("Pregão X", "A", "B", "2024-01-01")
        );
    }

    #[test]
    fn fallback_fields_do_not_run_together() {
        assert_ne!(fallback_uid("ab", "c", "", ""), fallback_uid("a", "bc", "", ""));
    }

    #[test]
    fn sequential_number_discriminates_preferred_uids() {
        let a = raw(json!({"orgao_cnpj": "123", "ano": "2024", "numero_sequencial": "1"}));
        let b = raw(json!({"orgao_cnpj": "123", "ano": "2024", "numero_sequencial": "2"}));
        assert_ne!(derive_uid(&a), derive_uid(&b));
    }

    #[test]
    fn preferred_and_fallback_spaces_are_disjoint() {
        let preferred = preferred_uid("123", "2024", "1").unwrap();
        assert!(preferred.contains(UID_SEPARATOR));
        let fallback = fallback_uid("t", "c", "o", "d");
        assert!(fallback.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!fallback.contains(UID_SEPARATOR));
    }
}
