//! Structural document export (`metadata.json`).
//!
//! The converter writes a DoclingDocument-shaped tree: flat arrays of
//! `texts`, `tables`, `pictures` and `groups`, linked into reading order by
//! `$ref` pointers starting from `body`. Only the fields the pipeline reads
//! are modelled; everything else in a real Docling export is ignored on load.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A `{"$ref": "#/texts/3"}` pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefItem {
    #[serde(rename = "$ref")]
    pub target: String,
}

impl RefItem {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub l: f64,
    pub t: f64,
    pub r: f64,
    pub b: f64,
    #[serde(default = "default_origin")]
    pub coord_origin: String,
}

fn default_origin() -> String {
    "TOPLEFT".to_string()
}

impl BoundingBox {
    pub fn as_tuple(&self) -> [f64; 4] {
        [self.l, self.t, self.r, self.b]
    }

    /// Sort key placing boxes nearer the top of the page first.
    pub fn top_key(&self) -> f64 {
        if self.coord_origin.eq_ignore_ascii_case("BOTTOMLEFT") {
            -self.t
        } else {
            self.t
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceItem {
    pub page_no: usize,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableCell {
    pub text: String,
    pub column_header: bool,
    pub row_header: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableData {
    pub grid: Vec<Vec<TableCell>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRef {
    pub mimetype: String,
    pub uri: String,
}

static DATA_URI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^data:([^;,]+)?(;base64)?,(.*)$").expect("valid regex"));

impl ImageRef {
    /// Decode an embedded `data:` URI. Returns `None` for referenced images.
    pub fn decode(&self) -> Option<Vec<u8>> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let caps = DATA_URI.captures(&self.uri)?;
        caps.get(2)?;
        STANDARD.decode(caps[3].trim()).ok()
    }
}

/// Any node of the tree. Which fields are populated depends on `label`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocItem {
    pub self_ref: String,
    pub label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub children: Vec<RefItem>,
    pub prov: Vec<ProvenanceItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<TableData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub captions: Vec<RefItem>,
}

impl DocItem {
    pub fn first_prov(&self) -> Option<&ProvenanceItem> {
        self.prov.first()
    }

    /// Last path segment of `self_ref`, e.g. `"3"` for `#/pictures/3`.
    pub fn short_id(&self) -> &str {
        self.self_ref.rsplit('/').next().unwrap_or(&self.self_ref)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageItem {
    pub page_no: usize,
    pub size: PageSize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoclingDocument {
    pub name: String,
    pub body: DocItem,
    pub texts: Vec<DocItem>,
    pub tables: Vec<DocItem>,
    pub pictures: Vec<DocItem>,
    pub groups: Vec<DocItem>,
    /// Keyed by page number as a string, the way Docling serialises it.
    pub pages: BTreeMap<String, PageItem>,
}

impl DoclingDocument {
    /// Map every spelling of a reference to its item: `self_ref`,
    /// `#/{kind}/{idx}` and `#{kind}/{idx}`.
    pub fn index(&self) -> HashMap<String, &DocItem> {
        let mut map = HashMap::new();
        for (kind, items) in [
            ("texts", &self.texts),
            ("tables", &self.tables),
            ("pictures", &self.pictures),
            ("groups", &self.groups),
        ] {
            for (idx, item) in items.iter().enumerate() {
                map.insert(format!("#{kind}/{idx}"), item);
                map.insert(format!("#/{kind}/{idx}"), item);
                if !item.self_ref.is_empty() {
                    map.insert(item.self_ref.clone(), item);
                }
            }
        }
        map
    }

    /// Depth-first walk from `body` in reading order.
    ///
    /// Each reference is visited at most once; dangling references are
    /// skipped. `visit` returns whether to descend into the item's children.
    pub fn walk<'a>(&'a self, mut visit: impl FnMut(&'a DocItem) -> bool) {
        let index = self.index();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = self
            .body
            .children
            .iter()
            .rev()
            .map(|r| r.target.as_str())
            .collect();

        while let Some(target) = stack.pop() {
            if !seen.insert(target) {
                continue;
            }
            let Some(item) = index.get(target).copied() else {
                continue;
            };
            if visit(item) {
                stack.extend(item.children.iter().rev().map(|r| r.target.as_str()));
            }
        }
    }
}
