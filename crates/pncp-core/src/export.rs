//! Fixed tabular projection of notices for spreadsheet consumers.
//!
//! Internal-only fields (uid, raw source timestamp) are deliberately
//! excluded; the column set and order are part of the external contract.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Notice;

pub const COLUMNS: [&str; 12] = [
    "Cidade",
    "UF",
    "Publicação",
    "Fim do envio de proposta",
    "Objeto",
    "Modalidade",
    "Tipo",
    "Orgão",
    "Número do processo",
    "Título",
    "Revisado",
    "Rejeitado",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub city: String,
    pub state: String,
    pub published: String,
    pub proposal_deadline: String,
    pub object: String,
    pub modality: String,
    pub kind: String,
    pub organ: String,
    pub process_number: String,
    pub title: String,
    pub reviewed: bool,
    pub rejected: bool,
}

/// Renders a timestamp as `dd/mm/YYYY HH:MM`; empty when absent.
pub fn format_datetime_br(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|dt| dt.format("%d/%m/%Y %H:%M").to_string())
        .unwrap_or_default()
}

impl ExportRow {
    pub fn from_notice(notice: &Notice) -> Self {
        Self {
            city: notice.city.clone(),
            state: notice.state.clone(),
            published: format_datetime_br(notice.published_at),
            proposal_deadline: format_datetime_br(notice.proposal_deadline),
            object: notice.object.clone(),
            modality: notice.modality.clone(),
            kind: notice.kind.clone(),
            organ: notice.organ.clone(),
            process_number: notice.process_number.clone(),
            title: notice.title.clone(),
            reviewed: notice.reviewed,
            rejected: notice.rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn notice() -> Notice {
        Notice {
            uid: "123-2024-1".into(),
            organ_tax_id: Some("123".into()),
            year: Some("2024".into()),
            seq_no: Some("1".into()),
            title: "Pregão X".into(),
            object: "Objeto".into(),
            city: "Aracaju".into(),
            state: "SE".into(),
            modality: "Pregão".into(),
            kind: "Edital".into(),
            organ: "Prefeitura".into(),
            process_number: "55/2024".into(),
            published_at: Utc.with_ymd_and_hms(2024, 1, 5, 10, 30, 0).single(),
            raw_published_at: "2024-01-05T10:30:00".into(),
            proposal_deadline: None,
            link: String::new(),
            reviewed: true,
            rejected: false,
        }
    }

    #[test]
    fn row_renders_dates_in_brazilian_format() {
        let row = ExportRow::from_notice(&notice());
        assert_eq!(row.published, "05/01/2024 10:30");
        assert_eq!(row.proposal_deadline, "");
        assert!(row.reviewed);
        assert!(!row.rejected);
    }

    #[test]
    fn column_set_is_stable() {
        assert_eq!(COLUMNS.len(), 12);
        assert_eq!(COLUMNS[0], "Cidade");
        assert_eq!(COLUMNS[9], "Título");
    }

    #[test]
    fn uid_is_not_part_of_the_export_surface() {
        let row = ExportRow::from_notice(&notice());
        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("uid").is_none());
        assert!(json.get("raw_published_at").is_none());
    }
}
