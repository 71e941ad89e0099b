//! Fiscal-ledger domain types: parsing context, checkpoint and output rows

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bumped whenever `ParsingContext` changes shape incompatibly
pub const CHECKPOINT_VERSION: u32 = 1;

// ==========================================================================
// Enums
// ==========================================================================

/// Operation direction from the document header (`IND_OPER`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Entrada,
    Saida,
}

impl Direction {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(Direction::Entrada),
            "1" => Some(Direction::Saida),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Entrada => "entrada",
            Direction::Saida => "saida",
        }
    }
}

/// Operation category derived from the CFOP classification code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    UsoConsumo,
    AtivoImobilizado,
    EnergiaEletrica,
    Comunicacao,
    Transporte,
    Combustivel,
}

impl OperationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::UsoConsumo => "uso_consumo",
            OperationCategory::AtivoImobilizado => "ativo_imobilizado",
            OperationCategory::EnergiaEletrica => "energia_eletrica",
            OperationCategory::Comunicacao => "comunicacao",
            OperationCategory::Transporte => "transporte",
            OperationCategory::Combustivel => "combustivel",
        }
    }
}

// ==========================================================================
// Parsing context
// ==========================================================================

/// Active document header; valid until the next header or block end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHeader {
    pub direction: Direction,
    pub partner_code: String,
    pub number: String,
    pub date: Option<NaiveDate>,
}

/// Registry entry used to enrich operation rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub name: String,
    pub tax_id: Option<String>,
}

/// State threaded through the record dispatcher across lines and chunks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsingContext {
    /// Competence month from the file header (`YYYY-MM-01`)
    pub current_period: Option<NaiveDate>,
    /// Document-owner tax id from the file header
    pub current_tax_id: Option<String>,
    pub current_establishment_id: Option<Uuid>,
    pub current_document: Option<DocumentHeader>,
    pub establishments_by_tax_id: HashMap<String, Uuid>,
    pub participants_by_code: HashMap<String, ParticipantInfo>,
}

impl ParsingContext {
    /// Bind a resolved establishment and make it current
    pub fn bind_establishment(&mut self, tax_id: &str, id: Uuid) {
        self.establishments_by_tax_id.insert(tax_id.to_string(), id);
        self.current_establishment_id = Some(id);
    }
}

/// Versioned snapshot persisted next to the byte cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub context: ParsingContext,
}

impl Checkpoint {
    pub fn new(context: ParsingContext) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            context,
        }
    }

    /// The stored context, if it was written by a compatible version
    pub fn into_context(self) -> Option<ParsingContext> {
        (self.version == CHECKPOINT_VERSION).then_some(self.context)
    }
}

// ==========================================================================
// Output rows
// ==========================================================================

/// Establishment seen in the file, before it has an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishmentRecord {
    pub code: Option<String>,
    pub name: String,
    pub tax_id: String,
    pub state: Option<String>,
    pub registration: Option<String>,
}

/// Trading-partner registry row, unique per (establishment, code)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRow {
    pub establishment_id: Uuid,
    pub code: String,
    pub name: String,
    pub country_code: Option<String>,
    pub tax_id: Option<String>,
    pub state_registration: Option<String>,
    pub municipality_code: Option<String>,
}

impl ParticipantRow {
    pub fn key(&self) -> (Uuid, String) {
        (self.establishment_id, self.code.clone())
    }
}

/// Natural key of a normalized operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub establishment_id: Uuid,
    pub competence_month: NaiveDate,
    pub document_number: String,
    pub cfop: String,
    pub partner_code: String,
}

/// Normalized operation row produced from a document item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRow {
    pub establishment_id: Uuid,
    pub competence_month: NaiveDate,
    pub direction: Direction,
    pub category: OperationCategory,
    pub cfop: String,
    pub partner_code: String,
    pub partner_name: Option<String>,
    pub document_number: String,
    pub document_date: Option<NaiveDate>,
    pub amount_cents: i64,
    pub icms_cents: i64,
    pub icms_st_cents: i64,
    pub ipi_cents: i64,
    pub pis_cents: i64,
    pub cofins_cents: i64,
}

impl OperationRow {
    pub fn key(&self) -> OperationKey {
        OperationKey {
            establishment_id: self.establishment_id,
            competence_month: self.competence_month,
            document_number: self.document_number.clone(),
            cfop: self.cfop.clone(),
            partner_code: self.partner_code.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_codes() {
        assert_eq!(Direction::from_code("0"), Some(Direction::Entrada));
        assert_eq!(Direction::from_code("1"), Some(Direction::Saida));
        assert_eq!(Direction::from_code("2"), None);
    }

    #[test]
    fn test_checkpoint_survives_json_and_rejects_other_versions() {
        let mut context = ParsingContext::default();
        context.current_period = NaiveDate::from_ymd_opt(2024, 3, 1);
        context.bind_establishment("11222333000181", Uuid::nil());
        context.participants_by_code.insert(
            "P001".to_string(),
            ParticipantInfo { name: "FORNECEDOR A".to_string(), tax_id: None },
        );

        let json = serde_json::to_value(Checkpoint::new(context.clone())).unwrap();
        let restored: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(restored.clone().into_context(), Some(context));

        let stale = Checkpoint { version: CHECKPOINT_VERSION + 1, ..restored };
        assert!(stale.into_context().is_none());
    }

    #[test]
    fn test_context_deserializes_from_empty_object() {
        let context: ParsingContext = serde_json::from_str("{}").unwrap();
        assert!(context.current_document.is_none());
        assert!(context.establishments_by_tax_id.is_empty());
    }
}
