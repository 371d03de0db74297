// 📥 Ingest - CSV rows → typed EntityRecord / OwnershipLink
//
// The only place raw registry columns are seen. A per-source ColumnMapping
// says which header holds which field; everything downstream works on the
// typed, normalized records.

use crate::config::ColumnMapping;
use crate::entities::{EntityRecord, Identifier, IdentifierKind, OwnershipLink, RelationshipKind};
use crate::error::{LinkageError, Result};
use crate::normalize::Normalizer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    #[serde(skip)]
    pub records: Vec<EntityRecord>,
    pub rows: usize,
    /// Rows without an id (dropped)
    pub missing_id: usize,
    /// Rows whose normalized name is empty (kept, never blocked)
    pub missing_name: usize,
    pub bad_weight: usize,
    pub bad_parent: usize,
}

/// Column positions resolved against the header row
struct ColumnIndex {
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    fn new(headers: &csv::StringRecord) -> Self {
        let positions = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_string(), i))
            .collect();
        ColumnIndex { positions }
    }

    fn require(&self, column: &str) -> Result<usize> {
        self.positions
            .get(column)
            .copied()
            .ok_or_else(|| LinkageError::Config(format!("CSV is missing required column '{column}'")))
    }

    fn get<'r>(&self, row: &'r csv::StringRecord, column: Option<&str>) -> Option<&'r str> {
        let idx = *self.positions.get(column?)?;
        let value = row.get(idx)?.trim();
        (!value.is_empty()).then_some(value)
    }
}

/// Read entity rows for one source
pub fn read_entities<R: Read>(
    reader: R,
    source: &str,
    mapping: &ColumnMapping,
    normalizer: &Normalizer,
) -> Result<IngestReport> {
    let mut rdr = csv::Reader::from_reader(reader);
    let columns = ColumnIndex::new(rdr.headers()?);
    let id_col = columns.require(&mapping.entity_id)?;
    let name_col = columns.require(&mapping.name)?;
    let prefix = mapping
        .id_prefix
        .clone()
        .unwrap_or_else(|| format!("{source}:"));
    let identifier_columns = mapping.identifier_columns();

    let mut report = IngestReport::default();
    for result in rdr.records() {
        let row = result?;
        report.rows += 1;

        let raw_id = row.get(id_col).map(str::trim).unwrap_or("");
        if raw_id.is_empty() {
            report.missing_id += 1;
            continue;
        }
        let name = row.get(name_col).map(str::trim).unwrap_or("");

        let mut record = EntityRecord::new(&format!("{prefix}{raw_id}"), source, name, normalizer);
        if !record.has_name() {
            let missing = LinkageError::MissingField {
                entity_id: record.entity_id.clone(),
                field: "name",
            };
            debug!(%missing, "row kept without a usable name");
            report.missing_name += 1;
        }

        if let Some(state) = columns.get(&row, mapping.state.as_deref()) {
            record = record.with_state(state, normalizer);
        }
        if let Some(city) = columns.get(&row, mapping.city.as_deref()) {
            record = record.with_city(city, normalizer);
        }
        if let Some(street) = columns.get(&row, mapping.street.as_deref()) {
            record = record.with_street(street, normalizer);
        }
        if let Some(zip) = columns.get(&row, mapping.zip.as_deref()) {
            record = record.with_zip(zip);
        }
        if let Some(code) = columns.get(&row, mapping.industry_code.as_deref()) {
            record = record.with_industry_code(code);
        }
        if let Some(weight) = columns.get(&row, mapping.weight.as_deref()) {
            match parse_weight(weight) {
                Some(w) => record = record.with_weight(w),
                None => report.bad_weight += 1,
            }
        }
        for (kind, column) in &identifier_columns {
            if let Some(raw) = columns.get(&row, Some(column)) {
                record = record.with_identifier(*kind, raw);
            }
        }
        if let Some(raw) = columns.get(&row, mapping.parent_identifier.as_deref()) {
            match parse_parent(raw, mapping.parent_kind) {
                Some(parent) => record.parent_identifier = Some(parent),
                None => {
                    warn!(entity = %record.entity_id, value = raw, "unusable parent identifier");
                    report.bad_parent += 1;
                }
            }
        }

        report.records.push(record);
    }

    Ok(report)
}

pub fn load_entities_csv(
    path: &Path,
    source: &str,
    mapping: &ColumnMapping,
    normalizer: &Normalizer,
) -> Result<IngestReport> {
    let file = std::fs::File::open(path)?;
    read_entities(file, source, mapping, normalizer)
}

/// "1,250" / "1250.0" → 1250
fn parse_weight(raw: &str) -> Option<i64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    cleaned
        .parse::<i64>()
        .ok()
        .or_else(|| cleaned.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))
}

/// Parent reference: bare value when the mapping fixes the kind, otherwise
/// "kind:value"
fn parse_parent(raw: &str, kind: Option<IdentifierKind>) -> Option<Identifier> {
    match kind {
        Some(kind) => Identifier::parse(kind, raw),
        None => {
            let (kind, value) = raw.split_once(':')?;
            Identifier::parse(kind.parse().ok()?, value)
        }
    }
}

// ============================================================================
// OWNERSHIP LINKS
// ============================================================================

#[derive(Debug, Deserialize)]
struct LinkRow {
    child_kind: String,
    child: String,
    #[serde(default)]
    parent_kind: String,
    parent: String,
    source: String,
    #[serde(default)]
    relationship: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkIngestReport {
    #[serde(skip)]
    pub links: Vec<OwnershipLink>,
    pub rows: usize,
    pub skipped: usize,
}

/// Header: child_kind, child, parent_kind, parent, source, relationship
pub fn read_ownership_links<R: Read>(reader: R) -> Result<LinkIngestReport> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut report = LinkIngestReport::default();

    for result in rdr.deserialize() {
        let row: LinkRow = result?;
        report.rows += 1;

        let parsed = row.child_kind.parse::<IdentifierKind>().and_then(|child_kind| {
            let parent_kind = if row.parent_kind.trim().is_empty() {
                child_kind
            } else {
                row.parent_kind.parse()?
            };
            let relationship: RelationshipKind = row.relationship.parse()?;
            Ok((child_kind, parent_kind, relationship))
        });
        let (child_kind, parent_kind, relationship) = match parsed {
            Ok(kinds) => kinds,
            Err(e) => {
                warn!(row = report.rows, child = %row.child, error = %e, "skipping ownership link row");
                report.skipped += 1;
                continue;
            }
        };

        match (
            Identifier::parse(child_kind, &row.child),
            Identifier::parse(parent_kind, &row.parent),
        ) {
            (Some(child), Some(parent)) => report.links.push(OwnershipLink {
                child,
                parent,
                source: row.source.trim().to_string(),
                relationship,
            }),
            _ => report.skipped += 1,
        }
    }

    Ok(report)
}

pub fn load_ownership_links_csv(path: &Path) -> Result<LinkIngestReport> {
    let file = std::fs::File::open(path)?;
    read_ownership_links(file)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const F7_CSV: &str = "\
f_num,employer_name,st,city,ein,units,parent_lei
101,\"Acme Foods, Inc.\",New York,Buffalo,12-3456789,\"1,250\",549300ZZZZZZZZZZZZ03
102,Zenith Steel,PA,Erie,,n/a,
,Nameless Row,NY,Albany,,,
103,Inc.,NY,Albany,00-0000000,,
";

    fn f7_mapping() -> ColumnMapping {
        let mut mapping = ColumnMapping {
            entity_id: "f_num".to_string(),
            name: "employer_name".to_string(),
            state: Some("st".to_string()),
            street: None,
            zip: None,
            industry_code: None,
            weight: Some("units".to_string()),
            parent_identifier: Some("parent_lei".to_string()),
            parent_kind: Some(IdentifierKind::Lei),
            ..ColumnMapping::default()
        };
        mapping.identifiers.clear();
        mapping.identifiers.insert("tax_id".to_string(), "ein".to_string());
        mapping
    }

    #[test]
    fn test_read_entities_with_mapping() {
        let report = read_entities(F7_CSV.as_bytes(), "f7", &f7_mapping(), &Normalizer::default()).unwrap();

        assert_eq!(report.rows, 4);
        assert_eq!(report.missing_id, 1);
        assert_eq!(report.records.len(), 3);

        let acme = &report.records[0];
        assert_eq!(acme.entity_id, "f7:101");
        assert_eq!(acme.name_normalized, "acme foods");
        assert_eq!(acme.state.as_deref(), Some("NY"));
        assert_eq!(acme.city.as_deref(), Some("buffalo"));
        assert_eq!(acme.weight, Some(1250));
        assert_eq!(acme.identifier(IdentifierKind::TaxId).unwrap().value, "123456789");
        assert_eq!(acme.parent_identifier.as_ref().unwrap().kind, IdentifierKind::Lei);

        let zenith = &report.records[1];
        assert!(zenith.identifiers.is_empty());
        assert_eq!(zenith.weight, None);
        assert_eq!(report.bad_weight, 1);

        // name reduces to nothing, identifier all zeros
        let empty = &report.records[2];
        assert!(!empty.has_name());
        assert!(empty.identifiers.is_empty());
        assert_eq!(report.missing_name, 1);
    }

    #[test]
    fn test_missing_required_column() {
        let csv = "id,title\n1,Acme\n";
        let err = read_entities(csv.as_bytes(), "f7", &ColumnMapping::default(), &Normalizer::default());
        assert!(matches!(err, Err(LinkageError::Config(_))));
    }

    #[test]
    fn test_parent_with_kind_prefix() {
        let parent = parse_parent("lei:549300ZZZZZZZZZZZZ03", None).unwrap();
        assert_eq!(parent.kind, IdentifierKind::Lei);
        assert!(parse_parent("549300ZZZZZZZZZZZZ03", None).is_none());
        assert!(parse_parent("duns:123", None).is_none());
    }

    #[test]
    fn test_parse_weight() {
        assert_eq!(parse_weight("1,250"), Some(1250));
        assert_eq!(parse_weight("12.6"), Some(13));
        assert_eq!(parse_weight("many"), None);
    }

    #[test]
    fn test_read_ownership_links() {
        let csv = "\
child_kind,child,parent_kind,parent,source,relationship
lei,549300XXXXXXXXXXXX01,,549300YYYYYYYYYYYY02,gleif,direct
lei,549300YYYYYYYYYYYY02,lei,549300ZZZZZZZZZZZZ03,gleif,ultimate
tax_id,12-3456789,tax_id,,sec,direct
";
        let report = read_ownership_links(csv.as_bytes()).unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(report.links.len(), 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.links[0].parent.kind, IdentifierKind::Lei);
        assert_eq!(report.links[1].relationship, RelationshipKind::Ultimate);
    }

    #[test]
    fn test_unknown_kind_skips_row() {
        let csv = "\
child_kind,child,parent_kind,parent,source,relationship
lei,549300XXXXXXXXXXXX01,lei,549300YYYYYYYYYYYY02,gleif,direct
duns,123456789,duns,987654321,dnb,direct
";
        let report = read_ownership_links(csv.as_bytes()).unwrap();
        assert_eq!(report.rows, 2);
        assert_eq!(report.links.len(), 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.links[0].child.value, "549300XXXXXXXXXXXX01");
    }

    #[test]
    fn test_load_entities_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"entity_id,name,state\n7,Bolt Works LLC,PA\n").unwrap();

        let report = load_entities_csv(file.path(), "osha", &ColumnMapping::default(), &Normalizer::default())
            .unwrap();
        assert_eq!(report.records[0].entity_id, "osha:7");
        assert_eq!(report.records[0].name_normalized, "bolt works");
    }
}
