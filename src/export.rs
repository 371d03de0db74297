// 📤 Export - review artifacts for a run
//
// - candidate pairs as CSV (one row per retained pair, with both signals,
//   per-field comparison levels, and the assigned label)
// - the run summary as pretty JSON

use crate::classify::ClassifiedPair;
use crate::error::Result;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Flat CSV row; ClassifiedPair nests its levels, which csv cannot serialize
#[derive(Debug, Serialize)]
struct PairRow<'a> {
    id1: &'a str,
    id2: &'a str,
    source1: &'a str,
    source2: &'a str,
    string_signal: Option<f64>,
    probabilistic_signal: Option<f64>,
    name_level: &'static str,
    state_level: &'static str,
    city_level: &'static str,
    zip_level: &'static str,
    industry_level: &'static str,
    label: &'static str,
    strategies: String,
}

impl<'a> From<&'a ClassifiedPair> for PairRow<'a> {
    fn from(classified: &'a ClassifiedPair) -> Self {
        let pair = &classified.pair;
        PairRow {
            id1: &pair.id1,
            id2: &pair.id2,
            source1: &pair.source1,
            source2: &pair.source2,
            string_signal: pair.string_signal.map(round4),
            probabilistic_signal: pair.probabilistic_signal.map(round4),
            name_level: pair.levels.name.as_str(),
            state_level: pair.levels.state.as_str(),
            city_level: pair.levels.city.as_str(),
            zip_level: pair.levels.zip.as_str(),
            industry_level: pair.levels.industry.as_str(),
            label: classified.label.as_str(),
            strategies: pair.strategies.join(";"),
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Write pairs as CSV; returns the number of data rows
pub fn write_pairs<W: Write>(writer: W, pairs: &[ClassifiedPair]) -> Result<usize> {
    let mut wtr = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(writer);

    for pair in pairs {
        wtr.serialize(PairRow::from(pair))?;
    }
    wtr.flush()?;

    Ok(pairs.len())
}

pub fn export_pairs_csv(path: &Path, pairs: &[ClassifiedPair]) -> Result<usize> {
    let file = File::create(path)?;
    write_pairs(BufWriter::new(file), pairs)
}

pub fn write_summary_json<T: Serialize>(path: &Path, summary: &T) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut file, summary)?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Label;
    use crate::fellegi_sunter::{ComparisonLevel, ComparisonVector};
    use crate::scoring::CandidatePair;

    fn create_test_pair() -> ClassifiedPair {
        ClassifiedPair {
            pair: CandidatePair {
                id1: "f7:101".to_string(),
                id2: "osha:9".to_string(),
                source1: "f7".to_string(),
                source2: "osha".to_string(),
                string_signal: Some(0.954_321),
                probabilistic_signal: None,
                levels: ComparisonVector {
                    name: ComparisonLevel::Exact,
                    state: ComparisonLevel::Exact,
                    ..ComparisonVector::default()
                },
                strategies: vec!["name_state", "name_city"],
            },
            label: Label::Likely,
        }
    }

    #[test]
    fn test_write_pairs_csv() {
        let mut out = Vec::new();
        let written = write_pairs(&mut out, &[create_test_pair()]).unwrap();
        assert_eq!(written, 1);

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id1,id2,source1,source2,string_signal,probabilistic_signal,name_level,state_level,city_level,zip_level,industry_level,label,strategies"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("f7:101,osha:9,f7,osha,0.9543,,"));
        assert!(row.ends_with(",LIKELY,name_state;name_city"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_export_files() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("pairs.csv");
        let json_path = dir.path().join("summary.json");

        export_pairs_csv(&csv_path, &[create_test_pair()]).unwrap();
        write_summary_json(&json_path, &serde_json::json!({ "merged": 3 })).unwrap();

        let mut rdr = csv::Reader::from_path(&csv_path).unwrap();
        assert_eq!(rdr.records().count(), 1);

        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(summary["merged"], 3);
    }
}
