//! Core record model, sync handles and role strategies for csync.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "csync-core";

/// Well-known field identifiers shared by parsers, strategies and sync handles.
pub mod fields {
    pub const SKU: &str = "sku";
    pub const TITLE: &str = "title";
    pub const FILE_NAME: &str = "file_name";
    pub const FULL_NAME_SUM: &str = "full_name_sum";
    pub const PARENT_SKU: &str = "parent_sku";
    pub const PARENT_ID: &str = "parent_id";
    pub const CATEGORY_IDS: &str = "category_ids";
    pub const IMAGE_IDS: &str = "image_ids";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Master,
    Slave,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Side::Master => Side::Slave,
            Side::Slave => Side::Master,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Master => "master",
            Side::Slave => "slave",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry kind. Also names the reconciliation phase for that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Image,
    Category,
    Product,
    Variation,
}

impl Kind {
    /// Dependency order: attachments first, variations last.
    pub const PHASE_ORDER: [Kind; 4] = [Kind::Image, Kind::Category, Kind::Product, Kind::Variation];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Image => "image",
            Kind::Category => "category",
            Kind::Product => "product",
            Kind::Variation => "variation",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Capability flags carried by a record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Roles: u8 {
        const PRODUCT = 1 << 0;
        const CATEGORY = 1 << 1;
        const VARIATION = 1 << 2;
        const IMAGE = 1 << 3;
    }
}

impl Roles {
    pub fn for_kind(kind: Kind) -> Self {
        match kind {
            Kind::Image => Roles::IMAGE,
            Kind::Category => Roles::CATEGORY,
            Kind::Product => Roles::PRODUCT,
            // a variation is a product that belongs to a parent product
            Kind::Variation => Roles::PRODUCT | Roles::VARIATION,
        }
    }

    /// Most specific kind named by the flag set.
    pub fn primary_kind(self) -> Option<Kind> {
        if self.contains(Roles::VARIATION) {
            Some(Kind::Variation)
        } else if self.contains(Roles::IMAGE) {
            Some(Kind::Image)
        } else if self.contains(Roles::CATEGORY) {
            Some(Kind::Category)
        } else if self.contains(Roles::PRODUCT) {
            Some(Kind::Product)
        } else {
            None
        }
    }
}

/// A single field value as produced by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    /// Blank text and empty lists carry no information and compare as absent.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Text(s) => s.trim().is_empty(),
            Value::List(items) => items.iter().all(|s| s.trim().is_empty()),
            Value::Bool(_) | Value::Number(_) => false,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => render_number(*n),
            Value::Text(s) => s.clone(),
            Value::List(items) => items.join("|"),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => {
                let cleaned = s.trim().trim_start_matches('$').replace(',', "");
                cleaned.trim().parse::<f64>().ok()
            }
            Value::Bool(_) | Value::List(_) => None,
        }
    }

    /// Members of a multi-valued field, normalized for set comparison.
    pub fn as_set(&self) -> BTreeSet<String> {
        let raw: Vec<String> = match self {
            Value::List(items) => items.clone(),
            Value::Text(s) => s.split('|').map(ToString::to_string).collect(),
            other => vec![other.render()],
        };
        raw.iter()
            .map(|s| normalize_text(s))
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// The empty value of the same shape, used when the winning side has nothing.
    pub fn cleared(&self) -> Value {
        match self {
            Value::List(_) => Value::List(Vec::new()),
            _ => Value::Text(String::new()),
        }
    }
}

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::List(value)
    }
}

pub type Fields = BTreeMap<String, Value>;

/// Lowercase, collapse whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercase, replace punctuation with spaces, collapse whitespace.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("record {key} already carries remote id {existing}; refusing to stamp {attempted}")]
    AlreadyStamped {
        key: String,
        existing: String,
        attempted: String,
    },
    #[error("duplicate registry key {0}")]
    DuplicateKey(String),
}

/// References from a record to other records of the same side, by registry key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Links {
    /// Parent category (categories) or parent product (variations).
    pub parent: Option<String>,
    pub categories: Vec<String>,
    pub images: Vec<String>,
    /// SKUs of the products/categories that own an image.
    pub attachees: Vec<String>,
}

/// One parsed business record.
///
/// Records are frozen once registered. The only permitted mutation is stamping the
/// remote id assigned by a successful create, which every holder of the `Arc` sees.
#[derive(Debug, Clone)]
pub struct Record {
    key: String,
    roles: Roles,
    fields: Fields,
    links: Links,
    modified: Option<DateTime<Utc>>,
    remote_id: OnceLock<String>,
}

pub type RecordRef = Arc<Record>;

impl Record {
    pub fn new(kind: Kind, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            roles: Roles::for_kind(kind),
            fields: Fields::new(),
            links: Links::default(),
            modified: None,
            remote_id: OnceLock::new(),
        }
    }

    pub fn with_roles(mut self, roles: Roles) -> Self {
        self.roles |= roles;
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn with_links(mut self, links: Links) -> Self {
        self.links = links;
        self
    }

    pub fn with_parent(mut self, parent_key: impl Into<String>) -> Self {
        self.links.parent = Some(parent_key.into());
        self
    }

    pub fn with_categories<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links.categories = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_images<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links.images = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attachees<I, S>(mut self, skus: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links.attachees = skus.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_remote_id(self, id: impl Into<String>) -> Self {
        let id = id.into();
        if id.trim().is_empty() {
            return self;
        }
        let _ = self.remote_id.set(id);
        self
    }

    pub fn into_ref(self) -> RecordRef {
        Arc::new(self)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn roles(&self) -> Roles {
        self.roles
    }

    pub fn kind(&self) -> Kind {
        self.roles.primary_kind().unwrap_or(Kind::Product)
    }

    pub fn is_product(&self) -> bool {
        self.roles.contains(Roles::PRODUCT)
    }

    pub fn is_category(&self) -> bool {
        self.roles.contains(Roles::CATEGORY)
    }

    pub fn is_variation(&self) -> bool {
        self.roles.contains(Roles::VARIATION)
    }

    pub fn is_image(&self) -> bool {
        self.roles.contains(Roles::IMAGE)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_text(&self, field: &str) -> Option<String> {
        self.get(field)
            .filter(|v| !v.is_blank())
            .map(|v| v.render().trim().to_string())
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn links(&self) -> &Links {
        &self.links
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.get().map(String::as_str)
    }

    /// Mirror the id assigned by the remote store after a successful create.
    pub fn stamp_remote_id(&self, id: impl Into<String>) -> Result<(), CoreError> {
        let id = id.into();
        match self.remote_id.set(id) {
            Ok(()) => Ok(()),
            Err(attempted) => {
                let existing = self.remote_id.get().cloned().unwrap_or_default();
                if existing == attempted {
                    return Ok(());
                }
                Err(CoreError::AlreadyStamped {
                    key: self.key.clone(),
                    existing,
                    attempted,
                })
            }
        }
    }

    /// Short human-readable identity used in logs and reports.
    pub fn identifier(&self) -> String {
        let label = self
            .get_text(fields::SKU)
            .or_else(|| self.get_text(fields::TITLE))
            .or_else(|| self.get_text(fields::FILE_NAME))
            .unwrap_or_default();
        match self.remote_id() {
            Some(id) => format!("{}:{} <{}> #{}", self.kind(), self.key, label, id),
            None => format!("{}:{} <{}>", self.kind(), self.key, label),
        }
    }
}

/// Ordered mapping registry key -> record for one side and one kind.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    records: Vec<RecordRef>,
    by_key: BTreeMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = RecordRef>) -> Result<Self, CoreError> {
        let mut registry = Self::new();
        for record in records {
            registry.insert(record)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, record: RecordRef) -> Result<(), CoreError> {
        if self.by_key.contains_key(record.key()) {
            return Err(CoreError::DuplicateKey(record.key().to_string()));
        }
        self.by_key.insert(record.key().to_string(), self.records.len());
        self.records.push(record);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&RecordRef> {
        self.by_key.get(key).map(|idx| &self.records[*idx])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn records(&self) -> &[RecordRef] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordRef> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn filtered(&self, keep: impl Fn(&Record) -> bool) -> Self {
        let mut out = Self::new();
        for record in self.records.iter().filter(|r| keep(r)) {
            out.by_key.insert(record.key().to_string(), out.records.len());
            out.records.push(Arc::clone(record));
        }
        out
    }
}

/// All registries parsed for one side of the sync.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub side: Side,
    pub images: Registry,
    pub categories: Registry,
    pub products: Registry,
    pub variations: Registry,
}

impl Catalog {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            images: Registry::new(),
            categories: Registry::new(),
            products: Registry::new(),
            variations: Registry::new(),
        }
    }

    pub fn registry(&self, kind: Kind) -> &Registry {
        match kind {
            Kind::Image => &self.images,
            Kind::Category => &self.categories,
            Kind::Product => &self.products,
            Kind::Variation => &self.variations,
        }
    }

    pub fn registry_mut(&mut self, kind: Kind) -> &mut Registry {
        match kind {
            Kind::Image => &mut self.images,
            Kind::Category => &mut self.categories,
            Kind::Product => &mut self.products,
            Kind::Variation => &mut self.variations,
        }
    }

    /// Route a record into the registry matching its role flags.
    pub fn insert(&mut self, record: RecordRef) -> Result<(), CoreError> {
        let kind = record.kind();
        self.registry_mut(kind).insert(record)
    }

    pub fn lookup(&self, kind: Kind, key: &str) -> Option<&RecordRef> {
        self.registry(kind).get(key)
    }

    /// Resolve link keys, silently skipping keys that name nothing.
    pub fn resolve(&self, kind: Kind, keys: &[String]) -> Vec<RecordRef> {
        keys.iter()
            .filter_map(|key| self.lookup(kind, key).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        Kind::PHASE_ORDER
            .iter()
            .map(|kind| self.registry(*kind).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Equality rule applied to one field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    #[default]
    Exact,
    /// Case and whitespace insensitive.
    Normalized,
    Numeric {
        tolerance: f64,
    },
    /// Unordered multi-valued field.
    Set,
}

impl Comparator {
    pub fn equal(&self, a: Option<&Value>, b: Option<&Value>) -> bool {
        let a = a.filter(|v| !v.is_blank());
        let b = b.filter(|v| !v.is_blank());
        let (a, b) = match (a, b) {
            (None, None) => return true,
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        match self {
            Comparator::Exact => a == b || a.render() == b.render(),
            Comparator::Normalized => normalize_text(&a.render()) == normalize_text(&b.render()),
            Comparator::Numeric { tolerance } => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => (x - y).abs() <= tolerance.abs(),
                _ => normalize_text(&a.render()) == normalize_text(&b.render()),
            },
            Comparator::Set => a.as_set() == b.as_set(),
        }
    }
}

/// Which side wins when a non-static field differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    #[default]
    MasterWins,
    LatestWins,
}

/// Native key and write permission of a field on one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRule {
    #[serde(default)]
    pub native: Option<String>,
    #[serde(default = "default_writable")]
    pub writable: bool,
}

fn default_writable() -> bool {
    true
}

impl Default for ColumnRule {
    fn default() -> Self {
        Self {
            native: None,
            writable: true,
        }
    }
}

/// One field's identifier plus its comparison, authority and translation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHandle {
    pub handle: String,
    #[serde(default)]
    pub comparator: Comparator,
    #[serde(default)]
    pub authority: Option<Authority>,
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default)]
    pub track_delta: bool,
    #[serde(default)]
    pub master: ColumnRule,
    #[serde(default)]
    pub slave: ColumnRule,
}

impl SyncHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            comparator: Comparator::Exact,
            authority: None,
            is_static: false,
            track_delta: false,
            master: ColumnRule::default(),
            slave: ColumnRule::default(),
        }
    }

    pub fn comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn authority(mut self, authority: Authority) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn static_field(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn tracked(mut self) -> Self {
        self.track_delta = true;
        self
    }

    pub fn column(mut self, side: Side, native: Option<&str>, writable: bool) -> Self {
        let rule = ColumnRule {
            native: native.map(ToString::to_string),
            writable,
        };
        match side {
            Side::Master => self.master = rule,
            Side::Slave => self.slave = rule,
        }
        self
    }

    pub fn effective_authority(&self) -> Authority {
        self.authority.unwrap_or_default()
    }

    pub fn rule(&self, side: Side) -> &ColumnRule {
        match side {
            Side::Master => &self.master,
            Side::Slave => &self.slave,
        }
    }

    pub fn native_key(&self, side: Side) -> &str {
        self.rule(side).native.as_deref().unwrap_or(&self.handle)
    }

    pub fn writable_on(&self, side: Side) -> bool {
        self.rule(side).writable
    }
}

/// Named deterministic mapping from a record to its matching key.
#[derive(Clone, Copy)]
pub struct IndexFn {
    name: &'static str,
    f: fn(&Record) -> Option<String>,
}

impl IndexFn {
    pub const fn new(name: &'static str, f: fn(&Record) -> Option<String>) -> Self {
        Self { name, f }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Empty keys are reported as `None` (unindexable).
    pub fn apply(&self, record: &Record) -> Option<String> {
        (self.f)(record).filter(|key| !key.trim().is_empty())
    }
}

impl fmt::Debug for IndexFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IndexFn").field(&self.name).finish()
    }
}

pub mod index {
    use super::{fields, normalize_key_fragment, IndexFn, Record};

    pub const PRODUCT_SKU: IndexFn = IndexFn::new("sku", product_sku);
    pub const CATEGORY_TITLE: IndexFn = IndexFn::new("title", category_title);
    pub const VARIATION_KEY: IndexFn = IndexFn::new("variation", variation_key);
    pub const IMAGE_FILE_NAME: IndexFn = IndexFn::new("file_name", image_file_name);
    pub const ATTACHEE_SKU: IndexFn = IndexFn::new("attachee_sku", attachee_sku);

    fn sku_of(record: &Record, field: &str) -> Option<String> {
        record.get_text(field).map(|s| s.to_uppercase())
    }

    pub fn product_sku(record: &Record) -> Option<String> {
        sku_of(record, fields::SKU)
    }

    pub fn category_title(record: &Record) -> Option<String> {
        record
            .get_text(fields::TITLE)
            .map(|t| normalize_key_fragment(&t))
    }

    pub fn variation_key(record: &Record) -> Option<String> {
        let sku = sku_of(record, fields::SKU)?;
        Some(match sku_of(record, fields::PARENT_SKU) {
            Some(parent) => format!("{parent}::{sku}"),
            None => sku,
        })
    }

    pub fn image_file_name(record: &Record) -> Option<String> {
        let name = record.get_text(fields::FILE_NAME)?;
        let base = name.rsplit(['/', '\\']).next().unwrap_or(&name);
        Some(base.trim().to_lowercase())
    }

    pub fn attachee_sku(record: &Record) -> Option<String> {
        let mut skus = record
            .links()
            .attachees
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        skus.sort();
        skus.dedup();
        if skus.is_empty() {
            None
        } else {
            Some(skus.join("|"))
        }
    }
}

/// Remote ids borrowed from matched counterparts, keyed by (kind, master key).
#[derive(Debug, Clone, Default)]
pub struct RemoteIdLinks {
    links: BTreeMap<(Kind, String), String>,
    aliases: BTreeMap<(Kind, String), String>,
}

impl RemoteIdLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, kind: Kind, key: impl Into<String>, remote_id: impl Into<String>) {
        self.links.insert((kind, key.into()), remote_id.into());
    }

    pub fn get(&self, kind: Kind, key: &str) -> Option<&str> {
        self.links
            .get(&(kind, key.to_string()))
            .map(String::as_str)
    }

    /// Resolve `key` through the record it was merged into.
    pub fn alias(&mut self, kind: Kind, key: impl Into<String>, primary: impl Into<String>) {
        self.aliases.insert((kind, key.into()), primary.into());
    }

    pub fn primary_of(&self, kind: Kind, key: &str) -> Option<&str> {
        self.aliases
            .get(&(kind, key.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Looks up remote ids of linked records on one side.
pub struct Resolver<'a> {
    catalog: &'a Catalog,
    mirrored: &'a RemoteIdLinks,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a Catalog, mirrored: &'a RemoteIdLinks) -> Self {
        Self { catalog, mirrored }
    }

    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    pub fn remote_id(&self, kind: Kind, key: &str) -> Option<String> {
        let record = self.catalog.lookup(kind, key)?;
        if let Some(id) = record.remote_id().or_else(|| self.mirrored.get(kind, key)) {
            return Some(id.to_string());
        }
        let primary = self.mirrored.primary_of(kind, key)?;
        let record = self.catalog.lookup(kind, primary)?;
        record
            .remote_id()
            .or_else(|| self.mirrored.get(kind, primary))
            .map(ToString::to_string)
    }

    fn remote_ids(&self, kind: Kind, keys: &[String]) -> Vec<String> {
        let mut ids = keys
            .iter()
            .filter_map(|key| self.remote_id(kind, key))
            .collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Per-role behaviour selected by the record's capability flags.
pub trait RoleStrategy: Send + Sync {
    fn kind(&self) -> Kind;

    fn index(&self) -> IndexFn;

    /// Kind of the record named by `Links::parent`, if this role has parents.
    fn parent_kind(&self) -> Option<Kind> {
        None
    }

    /// Fields computed from links, overlaid on the record's own fields when diffing.
    fn derive(&self, record: &Record, resolver: &Resolver<'_>) -> Fields;
}

struct ProductStrategy;
struct CategoryStrategy;
struct VariationStrategy;
struct ImageStrategy;

impl RoleStrategy for ProductStrategy {
    fn kind(&self) -> Kind {
        Kind::Product
    }

    fn index(&self) -> IndexFn {
        index::PRODUCT_SKU
    }

    fn derive(&self, record: &Record, resolver: &Resolver<'_>) -> Fields {
        let mut out = Fields::new();
        out.insert(
            fields::CATEGORY_IDS.to_string(),
            Value::List(resolver.remote_ids(Kind::Category, &record.links().categories)),
        );
        out.insert(
            fields::IMAGE_IDS.to_string(),
            Value::List(resolver.remote_ids(Kind::Image, &record.links().images)),
        );
        out
    }
}

impl RoleStrategy for CategoryStrategy {
    fn kind(&self) -> Kind {
        Kind::Category
    }

    fn index(&self) -> IndexFn {
        index::CATEGORY_TITLE
    }

    fn parent_kind(&self) -> Option<Kind> {
        Some(Kind::Category)
    }

    fn derive(&self, record: &Record, resolver: &Resolver<'_>) -> Fields {
        let mut out = Fields::new();
        if let Some(parent) = &record.links().parent {
            if let Some(id) = resolver.remote_id(Kind::Category, parent) {
                out.insert(fields::PARENT_ID.to_string(), Value::Text(id));
            }
        }
        out.insert(
            fields::IMAGE_IDS.to_string(),
            Value::List(resolver.remote_ids(Kind::Image, &record.links().images)),
        );
        out
    }
}

impl RoleStrategy for VariationStrategy {
    fn kind(&self) -> Kind {
        Kind::Variation
    }

    fn index(&self) -> IndexFn {
        index::VARIATION_KEY
    }

    fn parent_kind(&self) -> Option<Kind> {
        Some(Kind::Product)
    }

    fn derive(&self, record: &Record, resolver: &Resolver<'_>) -> Fields {
        let mut out = Fields::new();
        if let Some(parent) = &record.links().parent {
            if let Some(id) = resolver.remote_id(Kind::Product, parent) {
                out.insert(fields::PARENT_ID.to_string(), Value::Text(id));
            }
        }
        out
    }
}

impl RoleStrategy for ImageStrategy {
    fn kind(&self) -> Kind {
        Kind::Image
    }

    fn index(&self) -> IndexFn {
        index::IMAGE_FILE_NAME
    }

    fn derive(&self, _record: &Record, _resolver: &Resolver<'_>) -> Fields {
        Fields::new()
    }
}

pub fn strategy_for(kind: Kind) -> &'static dyn RoleStrategy {
    match kind {
        Kind::Product => &ProductStrategy,
        Kind::Category => &CategoryStrategy,
        Kind::Variation => &VariationStrategy,
        Kind::Image => &ImageStrategy,
    }
}

pub fn strategy_for_record(record: &Record) -> &'static dyn RoleStrategy {
    strategy_for(record.kind())
}
