//! Catalog bundle loading: turns a side's JSON export into a frozen `Catalog`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csync_core::{fields, Catalog, CoreError, Fields, Kind, Links, Record, Side};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "csync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("bundle holds {found} records, expected {expected}")]
    WrongSide { expected: Side, found: Side },
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Export of one side as produced by the upstream parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogBundle {
    pub side: Side,
    #[serde(default)]
    pub records: Vec<RawRecord>,
}

/// Record shapes accepted in a bundle. Unknown `type` tags are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawRecord {
    Product(RawProduct),
    Category(RawCategory),
    Variation(RawVariation),
    Image(RawImage),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCommon {
    pub key: String,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: Fields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProduct {
    #[serde(flatten)]
    pub common: RawCommon,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCategory {
    #[serde(flatten)]
    pub common: RawCommon,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawVariation {
    #[serde(flatten)]
    pub common: RawCommon,
    pub parent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawImage {
    #[serde(flatten)]
    pub common: RawCommon,
}

impl RawRecord {
    pub fn kind(&self) -> Kind {
        match self {
            RawRecord::Product(_) => Kind::Product,
            RawRecord::Category(_) => Kind::Category,
            RawRecord::Variation(_) => Kind::Variation,
            RawRecord::Image(_) => Kind::Image,
        }
    }

    pub fn common(&self) -> &RawCommon {
        match self {
            RawRecord::Product(p) => &p.common,
            RawRecord::Category(c) => &c.common,
            RawRecord::Variation(v) => &v.common,
            RawRecord::Image(i) => &i.common,
        }
    }

    fn images(&self) -> &[String] {
        match self {
            RawRecord::Product(p) => &p.images,
            RawRecord::Category(c) => &c.images,
            RawRecord::Variation(_) | RawRecord::Image(_) => &[],
        }
    }
}

pub fn load_bundle(path: impl AsRef<Path>) -> Result<CatalogBundle> {
    read_json_file(path)
}

/// Load and freeze the catalog for `side`.
pub fn load_catalog(path: impl AsRef<Path>, side: Side) -> Result<Catalog> {
    let path = path.as_ref();
    let bundle = load_bundle(path)?;
    let catalog = build_catalog(bundle, side)
        .with_context(|| format!("building {side} catalog from {}", path.display()))?;
    debug!(%side, records = catalog.len(), path = %path.display(), "catalog loaded");
    Ok(catalog)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

struct CategoryNode {
    title: String,
    parent: Option<usize>,
}

/// Category titles joined root-first, one arena walk per category.
fn full_name_sums(categories: &[&RawCategory]) -> Vec<String> {
    let positions: BTreeMap<&str, usize> = categories
        .iter()
        .enumerate()
        .map(|(idx, c)| (c.common.key.as_str(), idx))
        .collect();
    let arena: Vec<CategoryNode> = categories
        .iter()
        .map(|c| CategoryNode {
            title: text_field(&c.common.fields, fields::TITLE).unwrap_or_default(),
            parent: c
                .parent
                .as_deref()
                .and_then(|p| positions.get(p).copied()),
        })
        .collect();

    (0..arena.len())
        .map(|start| {
            let mut chain = Vec::new();
            let mut visited = vec![false; arena.len()];
            let mut cursor = Some(start);
            while let Some(idx) = cursor {
                if visited[idx] {
                    warn!(key = %categories[start].common.key, "category parent chain loops");
                    break;
                }
                visited[idx] = true;
                chain.push(arena[idx].title.as_str());
                cursor = arena[idx].parent;
            }
            chain.reverse();
            chain.join(" > ")
        })
        .collect()
}

fn text_field(values: &Fields, name: &str) -> Option<String> {
    values
        .get(name)
        .filter(|v| !v.is_blank())
        .map(|v| v.render().trim().to_string())
}

fn owner_label(raw: &RawRecord) -> Option<String> {
    let values = &raw.common().fields;
    text_field(values, fields::SKU).or_else(|| text_field(values, fields::TITLE))
}

/// Build a frozen catalog. Fails on duplicate keys or a bundle for the wrong side.
pub fn build_catalog(bundle: CatalogBundle, side: Side) -> Result<Catalog, AdapterError> {
    if bundle.side != side {
        return Err(AdapterError::WrongSide {
            expected: side,
            found: bundle.side,
        });
    }

    let mut attachees: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut product_skus: BTreeMap<String, String> = BTreeMap::new();
    for raw in &bundle.records {
        if let RawRecord::Product(p) = raw {
            if let Some(sku) = text_field(&p.common.fields, fields::SKU) {
                product_skus.insert(p.common.key.clone(), sku);
            }
        }
        let Some(owner) = owner_label(raw) else {
            continue;
        };
        for image in raw.images() {
            attachees.entry(image.clone()).or_default().push(owner.clone());
        }
    }

    let categories = bundle
        .records
        .iter()
        .filter_map(|raw| match raw {
            RawRecord::Category(c) => Some(c),
            _ => None,
        })
        .collect::<Vec<_>>();
    let mut name_sums: BTreeMap<String, String> = categories
        .iter()
        .map(|c| c.common.key.clone())
        .zip(full_name_sums(&categories))
        .collect();

    let mut catalog = Catalog::new(side);
    for raw in bundle.records {
        let record = match raw {
            RawRecord::Product(p) => base(Kind::Product, p.common)
                .with_categories(p.categories)
                .with_images(p.images),
            RawRecord::Category(c) => {
                let key = c.common.key.clone();
                let mut record = base(Kind::Category, c.common)
                    .with_links(Links {
                        parent: c.parent,
                        images: c.images,
                        ..Links::default()
                    });
                if record.get_text(fields::FULL_NAME_SUM).is_none() {
                    if let Some(sum) = name_sums.remove(&key) {
                        record = record.with_field(fields::FULL_NAME_SUM, sum);
                    }
                }
                record
            }
            RawRecord::Variation(v) => {
                let mut record = base(Kind::Variation, v.common);
                match product_skus.get(&v.parent) {
                    Some(parent_sku) if record.get_text(fields::PARENT_SKU).is_none() => {
                        record = record.with_field(fields::PARENT_SKU, parent_sku.clone());
                    }
                    Some(_) => {}
                    None => warn!(key = %record.key(), parent = %v.parent, "variation parent not in bundle"),
                }
                record.with_parent(v.parent)
            }
            RawRecord::Image(i) => {
                let owners = attachees.remove(&i.common.key).unwrap_or_default();
                base(Kind::Image, i.common).with_attachees(owners)
            }
        };
        catalog.insert(record.into_ref())?;
    }
    Ok(catalog)
}

fn base(kind: Kind, common: RawCommon) -> Record {
    let mut record = Record::new(kind, common.key).with_fields(common.fields);
    if let Some(modified) = common.modified {
        record = record.with_modified(modified);
    }
    if let Some(remote_id) = common.remote_id {
        record = record.with_remote_id(remote_id);
    }
    record
}
