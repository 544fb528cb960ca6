//! Core domain model for PNCP Edital Watch.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub mod export;
pub mod normalize;
pub mod uid;

pub use normalize::{normalize, NormalizeError};

pub const CRATE_NAME: &str = "pncp-core";

/// Registry origin used for deep links and relative URLs.
pub const ORIGIN: &str = "https://pncp.gov.br";

/// Fixed page size accepted by the registry search API.
pub const PAGE_SIZE: usize = 100;

/// Region cap per search, carried over from the original tool.
pub const MAX_REGIONS_PER_SEARCH: usize = 25;

/// Closed status enumeration accepted by the search API. Absence of a
/// status means "no filter" and is modelled as `Option<Status>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    RecebendoProposta,
    EmJulgamento,
    Encerrado,
}

impl Status {
    pub fn api_value(self) -> &'static str {
        match self {
            Status::RecebendoProposta => "recebendo_proposta",
            Status::EmJulgamento => "em_julgamento",
            Status::Encerrado => "encerrado",
        }
    }

    pub fn from_api_value(value: &str) -> Option<Self> {
        match value {
            "recebendo_proposta" => Some(Status::RecebendoProposta),
            "em_julgamento" => Some(Status::EmJulgamento),
            "encerrado" => Some(Status::Encerrado),
            _ => None,
        }
    }
}

/// A municipality already resolved to its registry code. Resolution from
/// human names lives in the external catalog; only resolved values flow in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
}

/// Named filter specification persisted alongside the review marks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSearch {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub regions: Vec<Region>,
}

fn de_stringly<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

/// One element of the search response array, as the registry emits it.
///
/// The registry is inconsistent about field names across document types, so
/// alternates are kept as separate fields and resolved by the accessors
/// below in a fixed fallback order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawNotice {
    pub title: Option<String>,
    pub titulo: Option<String>,
    pub description: Option<String>,
    pub objeto: Option<String>,
    #[serde(deserialize_with = "de_stringly")]
    pub orgao_cnpj: Option<String>,
    #[serde(deserialize_with = "de_stringly")]
    pub ano: Option<String>,
    #[serde(deserialize_with = "de_stringly")]
    pub numero_sequencial: Option<String>,
    pub municipio_nome: Option<String>,
    pub uf: Option<String>,
    pub modalidade_licitacao_nome: Option<String>,
    pub tipo_nome: Option<String>,
    pub orgao_nome: Option<String>,
    pub orgao: Option<String>,
    #[serde(rename = "numeroProcesso", deserialize_with = "de_stringly")]
    pub numero_processo: Option<String>,
    #[serde(deserialize_with = "de_stringly")]
    pub processo: Option<String>,
    pub data_publicacao_pncp: Option<String>,
    pub data: Option<String>,
    #[serde(rename = "dataPublicacao")]
    pub data_publicacao: Option<String>,
    pub data_fim_vigencia: Option<String>,
    pub item_url: Option<String>,
    pub url: Option<String>,
}

fn pick<'a>(fields: &[&'a Option<String>]) -> Option<&'a str> {
    fields
        .iter()
        .find_map(|f| f.as_deref().map(str::trim).filter(|s| !s.is_empty()))
}

impl RawNotice {
    pub fn display_title(&self) -> Option<&str> {
        pick(&[&self.title, &self.titulo])
    }

    pub fn object_text(&self) -> Option<&str> {
        pick(&[&self.description, &self.objeto])
    }

    pub fn organ(&self) -> Option<&str> {
        pick(&[&self.orgao_nome, &self.orgao])
    }

    pub fn process_number(&self) -> Option<&str> {
        pick(&[&self.numero_processo, &self.processo])
    }

    pub fn published_raw(&self) -> Option<&str> {
        pick(&[&self.data_publicacao_pncp, &self.data, &self.data_publicacao])
    }

    pub fn raw_url(&self) -> Option<&str> {
        pick(&[&self.item_url, &self.url])
    }
}

/// Canonical notice entity. Never persisted itself; addressable by `uid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub uid: String,
    pub organ_tax_id: Option<String>,
    pub year: Option<String>,
    pub seq_no: Option<String>,
    pub title: String,
    pub object: String,
    pub city: String,
    pub state: String,
    pub modality: String,
    pub kind: String,
    pub organ: String,
    pub process_number: String,
    pub published_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Source timestamp exactly as fetched; feeds the fallback UID.
    pub raw_published_at: String,
    pub proposal_deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub link: String,
    pub reviewed: bool,
    pub rejected: bool,
}

const ITEM_KEYS: [&str; 9] = [
    "items",
    "results",
    "conteudo",
    "licitacoes",
    "data",
    "documents",
    "documentos",
    "content",
    "resultados",
];

/// Unwraps the search response envelope. The registry sometimes returns a
/// bare array and sometimes nests it under one of several keys.
///
/// Elements that do not deserialize become empty records so the normalizer
/// rejects and counts them instead of them vanishing from the batch.
pub fn items_from_response(body: &JsonValue) -> Vec<RawNotice> {
    let items: Vec<JsonValue> = match body {
        JsonValue::Array(array) => array.clone(),
        JsonValue::Object(_) => ITEM_KEYS
            .iter()
            .find_map(|key| body.get(*key).and_then(JsonValue::as_array).cloned())
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).unwrap_or_default())
        .collect()
}

fn absolute_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    if raw.starts_with("http") {
        return raw.to_string();
    }
    format!("{}/{}", ORIGIN.trim_end_matches('/'), raw.trim_start_matches('/'))
}

/// Builds the deep link for a record.
///
/// Preferred form `{origin}/app/editais/{cnpj}/{year}/{seq}` when the organ
/// tax id looks like a CNPJ and year/sequence are usable; otherwise falls
/// back to the record's own URL with legacy `/compras/` segments rewritten.
pub fn deep_link(raw: &RawNotice) -> String {
    let cnpj = raw.orgao_cnpj.as_deref().unwrap_or("").trim();
    let year = raw.ano.as_deref().unwrap_or("").trim();
    let seq = raw.numero_sequencial.as_deref().unwrap_or("").trim();
    if cnpj.len() == 14
        && !year.is_empty()
        && year.chars().all(|c| c.is_ascii_digit())
        && !seq.is_empty()
    {
        return format!("{ORIGIN}/app/editais/{cnpj}/{year}/{seq}");
    }

    absolute_url(raw.raw_url().unwrap_or(""))
        .replace("/app/compras/", "/app/editais/")
        .replace("/compras/", "/app/editais/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_api_values() {
        for status in [Status::RecebendoProposta, Status::EmJulgamento, Status::Encerrado] {
            assert_eq!(Status::from_api_value(status.api_value()), Some(status));
        }
        assert_eq!(Status::from_api_value("todos"), None);
    }

    #[test]
    fn items_are_unwrapped_from_nested_and_bare_envelopes() {
        let nested = json!({"items": [{"title": "A"}, {"title": "B"}]});
        assert_eq!(items_from_response(&nested).len(), 2);

        let alt_key = json!({"conteudo": [{"titulo": "C"}]});
        let items = items_from_response(&alt_key);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].display_title(), Some("C"));

        let bare = json!([{"title": "D"}]);
        assert_eq!(items_from_response(&bare).len(), 1);

        assert!(items_from_response(&json!("not an envelope")).is_empty());
    }

    #[test]
    fn malformed_elements_survive_as_empty_records() {
        let body = json!({"items": [{"titulo": "ok"}, 42, {"titulo": ["not", "a", "string"]}]});
        let items = items_from_response(&body);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].display_title(), Some("ok"));
        assert_eq!(items[1], RawNotice::default());
        assert_eq!(items[2], RawNotice::default());
    }

    #[test]
    fn numeric_wire_fields_deserialize_as_strings() {
        let raw: RawNotice =
            serde_json::from_value(json!({"ano": 2024, "numero_sequencial": 7})).unwrap();
        assert_eq!(raw.ano.as_deref(), Some("2024"));
        assert_eq!(raw.numero_sequencial.as_deref(), Some("7"));
    }

    #[test]
    fn accessors_resolve_alternate_field_names_in_order() {
        let raw: RawNotice = serde_json::from_value(json!({
            "titulo": "Pregão X",
            "objeto": "Aquisição de bens",
            "orgao": "Prefeitura de A",
            "processo": "123/2024",
            "data": "2024-01-01",
        }))
        .unwrap();
        assert_eq!(raw.display_title(), Some("Pregão X"));
        assert_eq!(raw.object_text(), Some("Aquisição de bens"));
        assert_eq!(raw.organ(), Some("Prefeitura de A"));
        assert_eq!(raw.process_number(), Some("123/2024"));
        assert_eq!(raw.published_raw(), Some("2024-01-01"));
    }

    #[test]
    fn deep_link_prefers_cnpj_year_seq_triplet() {
        let raw: RawNotice = serde_json::from_value(json!({
            "orgao_cnpj": "12345678000190",
            "ano": "2024",
            "numero_sequencial": "15",
            "item_url": "/compras/ignored",
        }))
        .unwrap();
        assert_eq!(
            deep_link(&raw),
            "https://pncp.gov.br/app/editais/12345678000190/2024/15"
        );
    }

    #[test]
    fn deep_link_falls_back_to_rewritten_item_url() {
        let raw: RawNotice = serde_json::from_value(json!({
            "orgao_cnpj": "short",
            "item_url": "/app/compras/123/2024/9",
        }))
        .unwrap();
        assert_eq!(deep_link(&raw), "https://pncp.gov.br/app/editais/123/2024/9");

        let absolute: RawNotice = serde_json::from_value(json!({
            "url": "https://pncp.gov.br/compras/1/2/3",
        }))
        .unwrap();
        assert_eq!(deep_link(&absolute), "https://pncp.gov.br/app/editais/1/2/3");

        assert_eq!(deep_link(&RawNotice::default()), "");
    }
}
