//! Heuristic SKU extraction from the structural export.
//!
//! Walks the document tree in reading order, remembering the latest section
//! header and gauge label, and turns every row of every *technical* table
//! into a [`SkuRecord`]. The records feed the synthesis prompt as hints; the
//! model's output is authoritative.
//!
//! ## Table filter
//!
//! Only tables whose merged header mentions one of
//! [`TECHNICAL_HEADER_KEYWORDS`] are kept. Selection guides, colour charts
//! and other tables are dropped on purpose: a missing row costs less than a
//! polluted SKU list, and the model still sees the whole page image.
//!
//! ## Column shift
//!
//! Table recognition sometimes moves the part-number column to the end of
//! the row, leaving every value one column to the right of its header.
//! [`correct_column_shift`] detects this with string heuristics and rotates
//! the values back.

use super::document::{BoundingBox, DocItem, DoclingDocument, TableCell};
use crate::error::ChunkError;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Header keywords that mark a table as a product specification table.
pub const TECHNICAL_HEADER_KEYWORDS: [&str; 3] = ["Part", "SKU", "Conductor"];

const INITIAL_SECTION: &str = "General Catalog";
const INITIAL_GAUGE: &str = "N/A";

/// Column header → cell value, in column order.
///
/// Serialised as a JSON object whose key order follows the table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TechnicalData(pub Vec<(String, String)>);

impl TechnicalData {
    /// Insert, overwriting the value of an existing key in place.
    pub fn insert(&mut self, key: String, value: String) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn describe(&self, skip_part_no: bool) -> String {
        self.0
            .iter()
            .filter(|(k, _)| !(skip_part_no && k.eq_ignore_ascii_case("part no")))
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Serialize for TechnicalData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TechnicalData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = TechnicalData;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of column header to value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut data = TechnicalData::default();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    data.insert(k, v);
                }
                Ok(data)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// One product row recovered from a technical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkuRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub sku: Option<String>,
    pub series: String,
    pub gauge: String,
    pub catalog_family_context: String,
    pub series_context: String,
    pub page_no: Option<usize>,
    pub bbox: Option<BoundingBox>,
    pub technical_data: TechnicalData,
    pub content: String,
}

impl SkuRecord {
    fn content_line(&self, skip_part_no: bool) -> String {
        format!(
            "Product: {}. Category: {}. Part Number: {}. Details: {}. Page {}.",
            self.series,
            self.gauge,
            self.sku.as_deref().unwrap_or("unknown"),
            self.technical_data.describe(skip_part_no),
            self.page_no.map_or_else(|| "unknown".to_string(), |p| p.to_string()),
        )
    }
}

/// Whether a merged header row describes a specification table.
pub fn is_technical(headers: &[String]) -> bool {
    TECHNICAL_HEADER_KEYWORDS
        .iter()
        .any(|kw| headers.iter().any(|h| h.contains(kw)))
}

/// First value that looks like a part number: at least four characters and
/// starting with `'5'`, containing `'/'`, or starting with a letter.
pub fn sku_candidate(values: &[String]) -> Option<String> {
    values
        .iter()
        .filter(|v| v.chars().count() >= 4)
        .find(|v| {
            v.starts_with('5') || v.contains('/') || v.chars().next().is_some_and(char::is_alphabetic)
        })
        .cloned()
}

fn is_long_integer(s: &str) -> bool {
    s.len() >= 4 && s.chars().all(|c| c.is_ascii_digit())
}

fn looks_like_part_number(s: &str) -> bool {
    s.chars().count() >= 4
        && (s.chars().all(|c| c.is_ascii_digit())
            || s.chars().any(char::is_alphabetic)
            || s.contains('/'))
}

/// Detect a right-shifted row and rotate its values back. Returns whether
/// the record changed.
///
/// A row is treated as shifted when its last value
/// * equals, contains or is contained in the SKU candidate, or
/// * sits under a header mentioning `"mm"` while being a four-plus digit
///   integer (a part number where a diameter belongs), or
/// * is a four-plus digit integer found in no other column while the first
///   value does not look like a part number itself.
pub fn correct_column_shift(record: &mut SkuRecord) -> bool {
    let data = &record.technical_data.0;
    let Some((last_key, last_val)) = data.last() else {
        return false;
    };

    let matches_sku = record.sku.as_deref().is_some_and(|sku| {
        last_val == sku || sku.contains(last_val.as_str()) || last_val.contains(sku)
    });

    let part_in_mm_column = last_key.contains("mm")
        && !last_val.contains('.')
        && last_val.len() >= 4
        && last_val.chars().all(|c| c.is_ascii_digit());

    let orphan_part_number = is_long_integer(last_val)
        && data[..data.len() - 1].iter().all(|(_, v)| v != last_val)
        && !looks_like_part_number(&data[0].1);

    if !(matches_sku || part_in_mm_column || orphan_part_number) {
        return false;
    }

    let mut values: Vec<String> = data.iter().map(|(_, v)| v.clone()).collect();
    values.rotate_right(1);
    let rotated = data
        .iter()
        .map(|(k, _)| k.clone())
        .zip(values)
        .collect::<Vec<_>>();

    record.sku = rotated.first().map(|(_, v)| v.clone());
    record.technical_data = TechnicalData(rotated);
    record.content = record.content_line(false);
    true
}

fn cell_texts(row: &[TableCell]) -> Vec<String> {
    row.iter().map(|c| c.text.trim().to_string()).collect()
}

/// Merge the leading header rows. Returns the headers and the index of the
/// first data row.
fn merge_header_rows(grid: &[Vec<TableCell>]) -> (Vec<String>, usize) {
    let mut headers: Vec<String> = Vec::new();
    let mut data_start = 0;

    for (idx, row) in grid.iter().enumerate() {
        if !row.iter().any(|c| c.column_header) {
            break;
        }
        let texts = cell_texts(row);
        if headers.is_empty() {
            headers = texts;
        } else {
            for (col, text) in texts.into_iter().enumerate() {
                if let Some(header) = headers.get_mut(col) {
                    if !text.is_empty() && !header.contains(&text) {
                        header.push(' ');
                        header.push_str(&text);
                    }
                }
            }
        }
        data_start = idx + 1;
    }

    (headers, data_start)
}

fn table_records(table: &DocItem, grid: &[Vec<TableCell>], section: &str, gauge: &str, page_offset: usize) -> Vec<SkuRecord> {
    let (headers, data_start) = merge_header_rows(grid);
    if !is_technical(&headers) {
        debug!("Dropping non-technical table {} (headers: {:?})", table.self_ref, headers);
        return Vec::new();
    }

    let prov = table.first_prov();
    let page_no = prov.map(|p| p.page_no + page_offset);
    let bbox = prov.map(|p| p.bbox.clone());

    grid[data_start..]
        .iter()
        .map(|row| {
            let values = cell_texts(row);
            let mut specs = TechnicalData::default();
            for (header, value) in headers.iter().zip(&values) {
                if !header.is_empty() && !value.is_empty() {
                    specs.insert(header.clone(), value.clone());
                }
            }

            let mut record = SkuRecord {
                kind: "product_spec".to_string(),
                sku: sku_candidate(&values),
                series: section.to_string(),
                gauge: gauge.to_string(),
                catalog_family_context: section.to_string(),
                series_context: gauge.to_string(),
                page_no,
                bbox: bbox.clone(),
                technical_data: specs,
                content: String::new(),
            };
            record.content = record.content_line(true);
            correct_column_shift(&mut record);
            record
        })
        .collect()
}

/// Extract SKU records from a document. Page numbers are shifted by
/// `page_offset` into source-document numbering.
pub fn extract_skus(doc: &DoclingDocument, page_offset: usize) -> Vec<SkuRecord> {
    let mut section = INITIAL_SECTION.to_string();
    let mut gauge = INITIAL_GAUGE.to_string();
    let mut records = Vec::new();

    doc.walk(|item| match item.label.as_str() {
        "section_header" | "header" | "title" => {
            let text = item.text.trim();
            if !text.is_empty() {
                if text.contains("AWG") {
                    gauge = text.to_string();
                } else {
                    section = text.to_string();
                }
            }
            false
        }
        "table" => {
            if let Some(data) = item.data.as_ref().filter(|d| !d.grid.is_empty()) {
                records.extend(table_records(item, &data.grid, &section, &gauge, page_offset));
            }
            true
        }
        _ => true,
    });

    if records.iter().any(|r| r.page_no.is_some()) {
        records.sort_by(|a, b| {
            let key = |r: &SkuRecord| {
                (
                    r.page_no.unwrap_or(0),
                    r.bbox.as_ref().map_or(0.0, BoundingBox::top_key),
                )
            };
            let (pa, ta) = key(a);
            let (pb, tb) = key(b);
            pa.cmp(&pb).then(ta.total_cmp(&tb))
        });
    }
    records
}

/// Read `metadata.json`, extract SKU records and write them as JSON lines.
pub async fn run_sku_extraction(metadata: &Path, output: &Path, page_offset: usize) -> Result<Vec<SkuRecord>, ChunkError> {
    let raw = tokio::fs::read_to_string(metadata)
        .await
        .map_err(|e| ChunkError::io(metadata, e))?;
    let doc: DoclingDocument = serde_json::from_str(&raw).map_err(|e| ChunkError::InvalidExport {
        path: metadata.to_path_buf(),
        detail: e.to_string(),
    })?;

    let records = extract_skus(&doc, page_offset);
    write_jsonl(output, &records).await?;
    info!("Extracted {} SKU record(s) → {}", records.len(), output.display());
    Ok(records)
}

/// Write one JSON object per line.
pub async fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), ChunkError> {
    let mut out = String::new();
    for item in items {
        let line = serde_json::to_string(item).map_err(|e| ChunkError::io(path, e))?;
        out.push_str(&line);
        out.push('\n');
    }
    tokio::fs::write(path, out)
        .await
        .map_err(|e| ChunkError::io(path, e))
}

/// Read JSON lines written by [`write_jsonl`]; blank lines are skipped.
pub async fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, ChunkError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ChunkError::io(path, e))?;
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str(l).map_err(|e| ChunkError::InvalidExport {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::document::{ProvenanceItem, RefItem, TableData};

    fn header(texts: &[&str]) -> Vec<TableCell> {
        texts
            .iter()
            .map(|t| TableCell { text: t.to_string(), column_header: true, row_header: false })
            .collect()
    }

    fn row(texts: &[&str]) -> Vec<TableCell> {
        texts
            .iter()
            .map(|t| TableCell { text: t.to_string(), ..Default::default() })
            .collect()
    }

    fn table(self_ref: &str, page: usize, top: f64, grid: Vec<Vec<TableCell>>) -> DocItem {
        DocItem {
            self_ref: self_ref.into(),
            label: "table".into(),
            prov: vec![ProvenanceItem {
                page_no: page,
                bbox: BoundingBox { l: 0.0, t: top, r: 100.0, b: top + 10.0, coord_origin: "TOPLEFT".into() },
            }],
            data: Some(TableData { grid }),
            ..Default::default()
        }
    }

    fn text(self_ref: &str, label: &str, text: &str) -> DocItem {
        DocItem { self_ref: self_ref.into(), label: label.into(), text: text.into(), ..Default::default() }
    }

    fn body(children: &[&str]) -> DocItem {
        DocItem {
            self_ref: "#/body".into(),
            children: children.iter().map(|c| RefItem::new(*c)).collect(),
            ..Default::default()
        }
    }

    fn record(keys: &[&str], values: &[&str], sku: Option<&str>) -> SkuRecord {
        let mut td = TechnicalData::default();
        for (k, v) in keys.iter().zip(values) {
            td.insert(k.to_string(), v.to_string());
        }
        SkuRecord {
            kind: "product_spec".into(),
            sku: sku.map(String::from),
            series: "Hook-Up Wire".into(),
            gauge: "22 AWG".into(),
            catalog_family_context: "Hook-Up Wire".into(),
            series_context: "22 AWG".into(),
            page_no: Some(9),
            bbox: None,
            technical_data: td,
            content: String::new(),
        }
    }

    #[test]
    fn technical_filter() {
        assert!(is_technical(&["Part No".into(), "mm".into()]));
        assert!(is_technical(&["Conductor Size".into()]));
        assert!(!is_technical(&["Color".into(), "Code".into()]));
        assert!(!is_technical(&[]));
    }

    #[test]
    fn candidate_rules() {
        let v = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(sku_candidate(&v(&["22", "5856", "0.5"])), Some("5856".into()));
        assert_eq!(sku_candidate(&v(&["1/0 AWG", "x"])), Some("1/0 AWG".into()));
        assert_eq!(sku_candidate(&v(&["12", "M2000"])), Some("M2000".into()));
        assert_eq!(sku_candidate(&v(&["1234", "0.25"])), None);
        assert_eq!(sku_candidate(&v(&[])), None);
    }

    #[test]
    fn orphan_numeral_moves_to_first_column() {
        let mut rec = record(&["Part No", "mm", "AWG"], &["0.51", "22", "5920"], None);
        assert!(correct_column_shift(&mut rec));
        assert_eq!(rec.sku.as_deref(), Some("5920"));
        assert_eq!(rec.technical_data.get("Part No"), Some("5920"));
        assert_eq!(rec.technical_data.get("mm"), Some("0.51"));
        assert_eq!(rec.technical_data.get("AWG"), Some("22"));
        assert!(rec.content.contains("Part Number: 5920"));
        assert!(rec.content.contains("Part No: 5920"));
    }

    #[test]
    fn orphan_numeral_with_decimal_candidate() {
        let mut rec = record(&["Part No", "mm", "AWG"], &["5.03", "22", "5671"], Some("5.03"));
        assert!(correct_column_shift(&mut rec));
        assert_eq!(rec.sku.as_deref(), Some("5671"));
    }

    #[test]
    fn sku_match_triggers_shift() {
        let mut rec = record(&["Part No", "AWG", "Color"], &["22", "Black", "5856"], Some("5856"));
        assert!(correct_column_shift(&mut rec));
        assert_eq!(rec.technical_data.0[0], ("Part No".to_string(), "5856".to_string()));
    }

    #[test]
    fn mm_column_integer_triggers_shift() {
        let mut rec = record(&["Part No", "AWG", "Dia mm"], &["0.51", "22", "3051"], Some("M2000/1"));
        assert!(correct_column_shift(&mut rec));
        assert_eq!(rec.sku.as_deref(), Some("3051"));
    }

    #[test]
    fn aligned_row_is_untouched() {
        let mut rec = record(&["Part No", "AWG", "mm"], &["5856", "22", "0.51"], Some("5856"));
        assert!(!correct_column_shift(&mut rec));
        assert_eq!(rec.sku.as_deref(), Some("5856"));

        let mut rec = record(&["Part No", "mm", "Length"], &["M2000", "0.5", "1000"], Some("M2000"));
        assert!(!correct_column_shift(&mut rec));
    }

    #[test]
    fn header_rows_merge() {
        let grid = vec![
            header(&["Part", "Conductor", "OD"]),
            header(&["No", "Conductor", "mm"]),
            row(&["5856", "7/30", "1.2"]),
        ];
        let (headers, start) = merge_header_rows(&grid);
        assert_eq!(headers, ["Part No", "Conductor", "OD mm"]);
        assert_eq!(start, 2);
    }

    #[test]
    fn walk_tracks_context_and_sorts() {
        let doc = DoclingDocument {
            body: body(&["#/texts/0", "#/texts/1", "#/tables/0", "#/texts/2", "#/tables/1", "#/tables/2"]),
            texts: vec![
                text("#/texts/0", "section_header", "Hook-Up Wire"),
                text("#/texts/1", "section_header", "22 AWG"),
                text("#/texts/2", "section_header", "Multi-Conductor"),
            ],
            tables: vec![
                table("#/tables/0", 2, 400.0, vec![header(&["Part No", "AWG"]), row(&["5856", "22"]), row(&["", ""])]),
                table("#/tables/1", 1, 50.0, vec![header(&["Part No", "Pairs"]), row(&["M1001", "2"])]),
                table("#/tables/2", 1, 10.0, vec![header(&["Color", "Code"]), row(&["Red", "2"])]),
            ],
            ..Default::default()
        };

        let records = extract_skus(&doc, 7);
        assert_eq!(records.len(), 3);

        // Sorted by page: the Multi-Conductor table (page 1 + 7) comes first.
        assert_eq!(records[0].sku.as_deref(), Some("M1001"));
        assert_eq!(records[0].page_no, Some(8));
        assert_eq!(records[0].series, "Multi-Conductor");
        assert_eq!(records[0].gauge, "22 AWG");

        assert_eq!(records[1].sku.as_deref(), Some("5856"));
        assert_eq!(records[1].series, "Hook-Up Wire");
        assert_eq!(records[1].page_no, Some(9));
        assert!(records[1].content.starts_with("Product: Hook-Up Wire. Category: 22 AWG. Part Number: 5856."));
        assert!(!records[1].content.contains("Part No:"));

        // Empty data row: no specs, no candidate.
        assert!(records[2].technical_data.is_empty());
        assert_eq!(records[2].sku, None);
    }

    #[test]
    fn initial_context() {
        let doc = DoclingDocument {
            body: body(&["#/tables/0"]),
            tables: vec![table("#/tables/0", 1, 0.0, vec![header(&["SKU"]), row(&["ABCD"])])],
            ..Default::default()
        };
        let records = extract_skus(&doc, 0);
        assert_eq!(records[0].series, "General Catalog");
        assert_eq!(records[0].gauge, "N/A");
    }

    #[test]
    fn technical_data_keeps_column_order_in_json() {
        let rec = record(&["Part No", "AWG", "Color"], &["5856", "22", "Black"], Some("5856"));
        let json = serde_json::to_string(&rec).unwrap();
        let p = json.find("\"Part No\"").unwrap();
        let a = json.find("\"AWG\"").unwrap();
        let c = json.find("\"Color\"").unwrap();
        assert!(p < a && a < c);
        assert!(json.contains("\"type\":\"product_spec\""));

        let back: SkuRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.technical_data, rec.technical_data);
    }
}
