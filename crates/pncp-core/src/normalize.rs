//! Raw record validation and conversion into the canonical entity.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

use crate::{deep_link, uid, Notice, RawNotice};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("record carries no parseable date")]
    MissingDate,
}

/// Parses the timestamp shapes the registry emits: RFC3339, naive ISO with
/// optional fraction, or a bare date (taken as midnight UTC).
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

fn required(value: Option<&str>, field: &'static str) -> Result<String, NormalizeError> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(NormalizeError::MissingField(field))
}

fn optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Converts one raw record into a `Notice`, or reports why it must be
/// skipped. A failure never aborts the batch; callers count skips.
pub fn normalize(raw: &RawNotice) -> Result<Notice, NormalizeError> {
    let title = required(raw.display_title(), "title")?;
    let city = required(raw.municipio_nome.as_deref(), "city")?;
    let state = required(raw.uf.as_deref(), "state")?;

    let raw_published_at = raw.published_raw().unwrap_or("").to_string();
    let published_at = parse_datetime(&raw_published_at);
    let proposal_deadline = raw
        .data_fim_vigencia
        .as_deref()
        .and_then(parse_datetime);
    if published_at.is_none() && proposal_deadline.is_none() {
        return Err(NormalizeError::MissingDate);
    }

    Ok(Notice {
        uid: uid::derive_uid(raw),
        organ_tax_id: optional(raw.orgao_cnpj.as_deref()),
        year: optional(raw.ano.as_deref()),
        seq_no: optional(raw.numero_sequencial.as_deref()),
        title,
        object: raw.object_text().unwrap_or("").to_string(),
        city,
        state,
        modality: raw.modalidade_licitacao_nome.clone().unwrap_or_default(),
        kind: raw.tipo_nome.clone().unwrap_or_default(),
        organ: raw.organ().unwrap_or("").to_string(),
        process_number: raw.process_number().unwrap_or("").to_string(),
        published_at,
        raw_published_at,
        proposal_deadline,
        link: deep_link(raw),
        reviewed: false,
        rejected: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawNotice {
        serde_json::from_value(value).unwrap()
    }

    fn complete_record() -> RawNotice {
        raw(json!({
            "titulo": "Pregão Eletrônico 15/2024",
            "objeto": "Aquisição de material escolar",
            "municipio_nome": "Aracaju",
            "uf": "SE",
            "orgao_cnpj": "12345678000190",
            "ano": "2024",
            "numero_sequencial": "15",
            "orgao_nome": "Prefeitura de Aracaju",
            "data_publicacao_pncp": "2024-01-05T10:30:00",
            "data_fim_vigencia": "2024-02-01T18:00:00",
        }))
    }

    #[test]
    fn complete_record_normalizes_with_preferred_uid() {
        let notice = normalize(&complete_record()).unwrap();
        assert_eq!(notice.uid, "12345678000190-2024-15");
        assert_eq!(notice.city, "Aracaju");
        assert_eq!(notice.state, "SE");
        assert!(notice.published_at.is_some());
        assert!(notice.proposal_deadline.is_some());
        assert!(!notice.reviewed);
        assert!(!notice.rejected);
        assert_eq!(
            notice.link,
            "https://pncp.gov.br/app/editais/12345678000190/2024/15"
        );
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let mut record = complete_record();
        record.titulo = None;
        assert_eq!(
            normalize(&record),
            Err(NormalizeError::MissingField("title"))
        );

        let mut record = complete_record();
        record.municipio_nome = Some("   ".into());
        assert_eq!(normalize(&record), Err(NormalizeError::MissingField("city")));

        let mut record = complete_record();
        record.uf = None;
        assert_eq!(normalize(&record), Err(NormalizeError::MissingField("state")));
    }

    #[test]
    fn record_without_any_date_is_rejected() {
        let mut record = complete_record();
        record.data_publicacao_pncp = None;
        record.data_fim_vigencia = None;
        assert_eq!(normalize(&record), Err(NormalizeError::MissingDate));
    }

    #[test]
    fn deadline_alone_satisfies_the_date_requirement() {
        let mut record = complete_record();
        record.data_publicacao_pncp = Some("not a date".into());
        let notice = normalize(&record).unwrap();
        assert!(notice.published_at.is_none());
        assert!(notice.proposal_deadline.is_some());
        assert_eq!(notice.raw_published_at, "not a date");
    }

    #[test]
    fn timestamp_shapes_parse() {
        assert!(parse_datetime("2024-01-05T10:30:00Z").is_some());
        assert!(parse_datetime("2024-01-05T10:30:00-03:00").is_some());
        assert!(parse_datetime("2024-01-05T10:30:00.123").is_some());
        assert!(parse_datetime("2024-01-05").is_some());
        assert!(parse_datetime("05/01/2024").is_none());
        assert!(parse_datetime("").is_none());
    }

    #[test]
    fn identical_input_yields_identical_uid() {
        let record = raw(json!({
            "titulo": "Pregão X",
            "municipio_nome": "A",
            "uf": "SE",
            "orgao": "B",
            "data": "2024-01-01",
        }));
        let first = normalize(&record).unwrap();
        let second = normalize(&record).unwrap();
        assert_eq!(first.uid, second.uid);
        assert_eq!(first.uid.len(), 64);
    }
}
