//! Tag-driven record dispatcher
//!
//! Each handler mutates the `ParsingContext` and reports at most one
//! emission. Handlers never perform I/O: establishments that are not yet
//! cached come back as `Emission::Establishment` and the caller binds the
//! resolved id before feeding the next line.

use crate::types::{
    Direction, DocumentHeader, EstablishmentRecord, OperationRow, ParsingContext,
    ParticipantInfo, ParticipantRow,
};

use super::framer::decode_line;
use super::records::{cfop_category, competence_month, field, parse_cents, parse_date, RecordTag};

/// Something the caller has to persist or resolve
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// Unknown establishment: look up or create, then `bind_establishment`
    Establishment(EstablishmentRecord),
    Participant(ParticipantRow),
    Operation(OperationRow),
}

/// Result of dispatching one line
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Tag outside the allow-list
    Ignored,
    /// Recognized tag with unusable fields; the line is skipped
    Malformed { tag: RecordTag, reason: &'static str },
    /// Well-formed item filtered out by a scoping or classification rule
    Rejected(&'static str),
    /// Context changed, nothing to persist
    Updated,
    Emit(Emission),
}

/// Classify a raw line and apply it to the context.
pub fn dispatch(context: &mut ParsingContext, raw: &[u8]) -> LineOutcome {
    let Some(tag) = RecordTag::from_line(raw) else {
        return LineOutcome::Ignored;
    };

    let text = decode_line(raw);
    let fields: Vec<&str> = text.trim_start_matches('\u{feff}').split('|').collect();
    if fields.len() < tag.min_fields() {
        return LineOutcome::Malformed { tag, reason: "too few fields" };
    }

    let result = match tag {
        RecordTag::FileHeader => file_header(context, &fields),
        RecordTag::Establishment => establishment(context, &fields),
        RecordTag::Participant => participant(context, &fields),
        RecordTag::BlockEstablishment => block_establishment(context, &fields),
        RecordTag::DocumentHeader => document_header(context, &fields),
        RecordTag::DocumentItem => document_item(context, &fields),
        RecordTag::BlockEnd => {
            context.current_document = None;
            Ok(LineOutcome::Updated)
        }
    };

    result.unwrap_or_else(|reason| LineOutcome::Malformed { tag, reason })
}

/// Classify a line dropped for exceeding the length cap, from its head alone.
pub fn oversized(context: &mut ParsingContext, head: &[u8]) -> LineOutcome {
    let Some(tag) = RecordTag::from_line(head) else {
        return LineOutcome::Ignored;
    };
    if tag == RecordTag::DocumentHeader {
        context.current_document = None;
    }
    LineOutcome::Malformed { tag, reason: "line too long" }
}

type HandlerResult = Result<LineOutcome, &'static str>;

/// `|0000|COD_VER|TIPO_ESCRIT|IND_SIT_ESP|NUM_REC|DT_INI|DT_FIN|NOME|CNPJ|...`
fn file_header(context: &mut ParsingContext, fields: &[&str]) -> HandlerResult {
    let start = field(fields, 6)
        .and_then(parse_date)
        .ok_or("invalid start date")?;
    let tax_id = field(fields, 9).ok_or("missing tax id")?;

    context.current_period = Some(competence_month(start));
    context.current_tax_id = Some(tax_id.to_string());
    context.current_establishment_id = None;
    context.current_document = None;
    Ok(LineOutcome::Updated)
}

/// `|0140|COD_EST|NOME|CNPJ|UF|IE|COD_MUN|IM|SUFRAMA|`
fn establishment(context: &mut ParsingContext, fields: &[&str]) -> HandlerResult {
    let name = field(fields, 3).ok_or("missing establishment name")?;
    let tax_id = field(fields, 4).ok_or("missing establishment tax id")?;

    let record = EstablishmentRecord {
        code: field(fields, 2).map(str::to_string),
        name: name.to_string(),
        tax_id: tax_id.to_string(),
        state: field(fields, 5).map(str::to_string),
        registration: field(fields, 6).map(str::to_string),
    };
    Ok(switch_establishment(context, record))
}

/// `|C010|CNPJ|IND_ESCRI|`
fn block_establishment(context: &mut ParsingContext, fields: &[&str]) -> HandlerResult {
    let tax_id = field(fields, 2).ok_or("missing establishment tax id")?;

    let record = EstablishmentRecord {
        code: None,
        name: tax_id.to_string(),
        tax_id: tax_id.to_string(),
        state: None,
        registration: None,
    };
    Ok(switch_establishment(context, record))
}

fn switch_establishment(context: &mut ParsingContext, record: EstablishmentRecord) -> LineOutcome {
    context.current_document = None;
    match context.establishments_by_tax_id.get(&record.tax_id) {
        Some(id) => {
            context.current_establishment_id = Some(*id);
            LineOutcome::Updated
        }
        None => {
            context.current_establishment_id = None;
            LineOutcome::Emit(Emission::Establishment(record))
        }
    }
}

/// `|0150|COD_PART|NOME|COD_PAIS|CNPJ|CPF|IE|COD_MUN|SUFRAMA|END|...`
fn participant(context: &mut ParsingContext, fields: &[&str]) -> HandlerResult {
    let code = field(fields, 2).ok_or("missing participant code")?;
    let name = field(fields, 3).ok_or("missing participant name")?;
    let tax_id = field(fields, 5).or_else(|| field(fields, 6));

    context.participants_by_code.insert(
        code.to_string(),
        ParticipantInfo {
            name: name.to_string(),
            tax_id: tax_id.map(str::to_string),
        },
    );

    let Some(establishment_id) = context.current_establishment_id else {
        return Ok(LineOutcome::Updated);
    };

    Ok(LineOutcome::Emit(Emission::Participant(ParticipantRow {
        establishment_id,
        code: code.to_string(),
        name: name.to_string(),
        country_code: field(fields, 4).map(str::to_string),
        tax_id: tax_id.map(str::to_string),
        state_registration: field(fields, 7).map(str::to_string),
        municipality_code: field(fields, 8).map(str::to_string),
    })))
}

/// `|C100|IND_OPER|IND_EMIT|COD_PART|COD_MOD|COD_SIT|SER|NUM_DOC|CHV_NFE|DT_DOC|...`
fn document_header(context: &mut ParsingContext, fields: &[&str]) -> HandlerResult {
    // A broken header must not leave the previous document active
    context.current_document = None;

    let direction = field(fields, 2)
        .and_then(Direction::from_code)
        .ok_or("invalid operation direction")?;
    let number = field(fields, 8).ok_or("missing document number")?;

    context.current_document = Some(DocumentHeader {
        direction,
        partner_code: field(fields, 4).unwrap_or_default().to_string(),
        number: number.to_string(),
        date: field(fields, 10).and_then(parse_date),
    });
    Ok(LineOutcome::Updated)
}

const ITEM_AMOUNT: usize = 7;
const ITEM_CFOP: usize = 11;
const ITEM_ICMS: usize = 15;
const ITEM_ICMS_ST: usize = 18;
const ITEM_IPI: usize = 24;
const ITEM_PIS: usize = 30;
const ITEM_COFINS: usize = 36;

/// `|C170|NUM_ITEM|COD_ITEM|DESCR_COMPL|QTD|UNID|VL_ITEM|VL_DESC|IND_MOV|CST_ICMS|CFOP|...`
fn document_item(context: &mut ParsingContext, fields: &[&str]) -> HandlerResult {
    let Some(establishment_id) = context.current_establishment_id else {
        return Ok(LineOutcome::Rejected("no current establishment"));
    };
    let Some(document) = context.current_document.as_ref() else {
        return Ok(LineOutcome::Rejected("no current document"));
    };

    let cfop = field(fields, ITEM_CFOP).ok_or("missing classification code")?;
    let Some(category) = cfop_category(cfop) else {
        return Ok(LineOutcome::Rejected("classification code not accepted"));
    };

    let amount_cents = amount(fields, ITEM_AMOUNT)?;
    if amount_cents <= 0 {
        return Ok(LineOutcome::Rejected("non-positive amount"));
    }

    let Some(competence_month) = document
        .date
        .map(competence_month)
        .or(context.current_period)
    else {
        return Ok(LineOutcome::Rejected("no competence month"));
    };

    let partner_name = context
        .participants_by_code
        .get(&document.partner_code)
        .map(|p| p.name.clone());

    Ok(LineOutcome::Emit(Emission::Operation(OperationRow {
        establishment_id,
        competence_month,
        direction: document.direction,
        category,
        cfop: cfop.to_string(),
        partner_code: document.partner_code.clone(),
        partner_name,
        document_number: document.number.clone(),
        document_date: document.date,
        amount_cents,
        icms_cents: amount(fields, ITEM_ICMS)?,
        icms_st_cents: amount(fields, ITEM_ICMS_ST)?,
        ipi_cents: amount(fields, ITEM_IPI)?,
        pis_cents: amount(fields, ITEM_PIS)?,
        cofins_cents: amount(fields, ITEM_COFINS)?,
    })))
}

/// Monetary field; absent trailing fields count as zero
fn amount(fields: &[&str], index: usize) -> Result<i64, &'static str> {
    match fields.get(index) {
        Some(raw) => parse_cents(raw).ok_or("invalid monetary value"),
        None => Ok(0),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    pub const HEADER: &str = "|0000|006|0|||01032024|31032024|EMPRESA TESTE LTDA|11222333000181|SP|3550308||00|0|";
    pub const ESTABLISHMENT: &str = "|0140|01|MATRIZ|11222333000181|SP|123456789|3550308|||";
    pub const PARTICIPANT: &str = "|0150|P001|FORNECEDOR A|01058|99888777000155||987654321|3550308||RUA X|10||CENTRO|";
    pub const DOCUMENT: &str = "|C100|0|1|P001|55|00|1|NF123|35240399888777000155550010000001231000001234|15032024|15032024|1500,00|";

    /// C170 with the given amount, CFOP and ICMS
    pub fn item(amount: &str, cfop: &str, icms: &str) -> String {
        format!(
            "|C170|1|ITEM01|MATERIAL DE ESCRITORIO|10|UN|{amount}|0|0|090|{cfop}|001|{amount}|18,00|{icms}|0|0|0|0|||0|0|0|50|{amount}|1,65|||24,75|50|{amount}|7,60|||114,00|3.1.1|"
        )
    }

    fn bound_context() -> ParsingContext {
        let mut context = ParsingContext::default();
        dispatch(&mut context, HEADER.as_bytes());
        context.bind_establishment("11222333000181", Uuid::nil());
        context
    }

    #[test]
    fn test_header_sets_period_and_owner() {
        let mut context = ParsingContext::default();
        let outcome = dispatch(&mut context, HEADER.as_bytes());

        assert_eq!(outcome, LineOutcome::Updated);
        assert_eq!(context.current_period, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(context.current_tax_id.as_deref(), Some("11222333000181"));
    }

    #[test]
    fn test_header_resets_root_but_keeps_cache() {
        let mut context = bound_context();
        dispatch(&mut context, DOCUMENT.as_bytes());
        dispatch(&mut context, HEADER.as_bytes());

        assert!(context.current_document.is_none());
        assert!(context.current_establishment_id.is_none());
        assert!(context.establishments_by_tax_id.contains_key("11222333000181"));
    }

    #[test]
    fn test_unknown_establishment_is_emitted_for_resolution() {
        let mut context = ParsingContext::default();
        dispatch(&mut context, HEADER.as_bytes());

        match dispatch(&mut context, ESTABLISHMENT.as_bytes()) {
            LineOutcome::Emit(Emission::Establishment(record)) => {
                assert_eq!(record.code.as_deref(), Some("01"));
                assert_eq!(record.name, "MATRIZ");
                assert_eq!(record.tax_id, "11222333000181");
            }
            other => panic!("expected establishment emission, got {:?}", other),
        }
        assert!(context.current_establishment_id.is_none());
    }

    #[test]
    fn test_cached_establishment_is_reused() {
        let mut context = bound_context();
        context.current_establishment_id = None;

        assert_eq!(dispatch(&mut context, ESTABLISHMENT.as_bytes()), LineOutcome::Updated);
        assert_eq!(context.current_establishment_id, Some(Uuid::nil()));
    }

    #[test]
    fn test_block_c_establishment_switch() {
        let mut context = bound_context();
        let other = Uuid::new_v4();
        context.establishments_by_tax_id.insert("11222333000262".to_string(), other);

        dispatch(&mut context, "|C010|11222333000262|2|".as_bytes());
        assert_eq!(context.current_establishment_id, Some(other));
    }

    #[test]
    fn test_concrete_item_scenario() {
        let mut context = bound_context();
        dispatch(&mut context, PARTICIPANT.as_bytes());
        dispatch(&mut context, DOCUMENT.as_bytes());

        let outcome = dispatch(&mut context, item("1500,00", "1556", "270,00").as_bytes());
        let LineOutcome::Emit(Emission::Operation(row)) = outcome else {
            panic!("expected an operation row, got {:?}", outcome);
        };

        assert_eq!(row.category.as_str(), "uso_consumo");
        assert_eq!(row.amount_cents, 150_000);
        assert_eq!(row.icms_cents, 27_000);
        assert_eq!(row.pis_cents, 2_475);
        assert_eq!(row.cofins_cents, 11_400);
        assert_eq!(row.competence_month, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(row.document_number, "NF123");
        assert_eq!(row.partner_code, "P001");
        assert_eq!(row.partner_name.as_deref(), Some("FORNECEDOR A"));
        assert_eq!(row.direction, Direction::Entrada);
    }

    #[test]
    fn test_document_date_wins_over_file_period() {
        let mut context = bound_context();
        let april_doc = DOCUMENT.replace("|15032024|15032024|", "|02042024|02042024|");
        dispatch(&mut context, april_doc.as_bytes());

        let LineOutcome::Emit(Emission::Operation(row)) =
            dispatch(&mut context, item("10,00", "1556", "0").as_bytes())
        else {
            panic!("expected an operation row");
        };
        assert_eq!(row.competence_month, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
    }

    #[test]
    fn test_file_period_used_without_document_date() {
        let mut context = bound_context();
        let undated = DOCUMENT.replace("|15032024|15032024|", "|||");
        dispatch(&mut context, undated.as_bytes());

        let LineOutcome::Emit(Emission::Operation(row)) =
            dispatch(&mut context, item("10,00", "1556", "0").as_bytes())
        else {
            panic!("expected an operation row");
        };
        assert_eq!(row.competence_month, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn test_item_without_competence_month_is_dropped() {
        let mut context = ParsingContext::default();
        context.bind_establishment("11222333000181", Uuid::nil());
        dispatch(&mut context, DOCUMENT.replace("|15032024|15032024|", "|||").as_bytes());

        assert_eq!(
            dispatch(&mut context, item("10,00", "1556", "0").as_bytes()),
            LineOutcome::Rejected("no competence month")
        );
    }

    #[test]
    fn test_item_without_document_header_produces_nothing() {
        let mut context = bound_context();
        assert_eq!(
            dispatch(&mut context, item("1500,00", "1556", "270,00").as_bytes()),
            LineOutcome::Rejected("no current document")
        );
    }

    #[test]
    fn test_item_without_establishment_produces_nothing() {
        let mut context = ParsingContext::default();
        dispatch(&mut context, HEADER.as_bytes());
        dispatch(&mut context, DOCUMENT.as_bytes());
        assert_eq!(
            dispatch(&mut context, item("1500,00", "1556", "270,00").as_bytes()),
            LineOutcome::Rejected("no current establishment")
        );
    }

    #[test]
    fn test_block_end_clears_document() {
        let mut context = bound_context();
        dispatch(&mut context, DOCUMENT.as_bytes());
        dispatch(&mut context, "|C990|42|".as_bytes());
        assert!(matches!(
            dispatch(&mut context, item("1500,00", "1556", "0").as_bytes()),
            LineOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_classification_outside_allow_list_is_filtered() {
        let mut context = bound_context();
        dispatch(&mut context, DOCUMENT.as_bytes());
        assert_eq!(
            dispatch(&mut context, item("1500,00", "1102", "0").as_bytes()),
            LineOutcome::Rejected("classification code not accepted")
        );
    }

    #[test]
    fn test_non_positive_amount_is_filtered() {
        let mut context = bound_context();
        dispatch(&mut context, DOCUMENT.as_bytes());
        assert_eq!(
            dispatch(&mut context, item("0,00", "1556", "0").as_bytes()),
            LineOutcome::Rejected("non-positive amount")
        );
    }

    #[test]
    fn test_short_item_line_is_skipped() {
        let mut context = bound_context();
        dispatch(&mut context, DOCUMENT.as_bytes());
        assert_eq!(
            dispatch(&mut context, "|C170|1|ITEM|".as_bytes()),
            LineOutcome::Malformed { tag: RecordTag::DocumentItem, reason: "too few fields" }
        );
    }

    #[test]
    fn test_garbage_amount_is_skipped_and_context_survives() {
        let mut context = bound_context();
        dispatch(&mut context, DOCUMENT.as_bytes());

        let outcome = dispatch(&mut context, item("12x", "1556", "0").as_bytes());
        assert!(matches!(outcome, LineOutcome::Malformed { .. }));
        assert!(context.current_document.is_some());
    }

    #[test]
    fn test_broken_document_header_clears_previous_document() {
        let mut context = bound_context();
        dispatch(&mut context, DOCUMENT.as_bytes());
        let broken = DOCUMENT.replace("|C100|0|", "|C100|9|");

        assert!(matches!(dispatch(&mut context, broken.as_bytes()), LineOutcome::Malformed { .. }));
        assert!(context.current_document.is_none());
    }

    #[test]
    fn test_oversized_lines() {
        let mut context = bound_context();
        dispatch(&mut context, DOCUMENT.as_bytes());

        assert_eq!(
            oversized(&mut context, b"|C170|1|ITEM0000"),
            LineOutcome::Malformed { tag: RecordTag::DocumentItem, reason: "line too long" }
        );
        assert!(context.current_document.is_some());

        assert!(matches!(oversized(&mut context, b"|C100|0|1|P001|5"), LineOutcome::Malformed { .. }));
        assert!(context.current_document.is_none());

        assert_eq!(oversized(&mut context, b"|C400|xxxxxxxxxx"), LineOutcome::Ignored);
    }

    #[test]
    fn test_participant_without_establishment_only_feeds_registry() {
        let mut context = ParsingContext::default();
        assert_eq!(dispatch(&mut context, PARTICIPANT.as_bytes()), LineOutcome::Updated);
        assert_eq!(context.participants_by_code["P001"].tax_id.as_deref(), Some("99888777000155"));
    }

    #[test]
    fn test_participant_row_emitted_under_establishment() {
        let mut context = bound_context();
        let LineOutcome::Emit(Emission::Participant(row)) = dispatch(&mut context, PARTICIPANT.as_bytes()) else {
            panic!("expected participant row");
        };
        assert_eq!(row.code, "P001");
        assert_eq!(row.state_registration.as_deref(), Some("987654321"));
        assert_eq!(row.municipality_code.as_deref(), Some("3550308"));
    }

    #[test]
    fn test_ignored_tags() {
        let mut context = bound_context();
        assert_eq!(dispatch(&mut context, "|C190|090|1556|".as_bytes()), LineOutcome::Ignored);
        assert_eq!(dispatch(&mut context, "".as_bytes()), LineOutcome::Ignored);
    }

    #[test]
    fn test_latin1_line_is_decoded() {
        let mut context = bound_context();
        let mut raw = b"|0150|P002|CONSTRU".to_vec();
        raw.push(0xC7); // Ç in ISO-8859-1
        raw.extend_from_slice(b"AO LTDA|01058|11111111000191|||||");

        dispatch(&mut context, &raw);
        assert_eq!(context.participants_by_code["P002"].name, "CONSTRUÇAO LTDA");
    }
}
