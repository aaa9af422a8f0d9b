//! Pairs records from a master and a slave registry by index and classifies the result.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use csync_core::{IndexFn, Record, RecordRef, Registry, Side, Value};
use serde::Serialize;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "csync-match";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MatchError {
    #[error("ambiguous match: {} unresolved duplicate index(es): {}\n{detail}", indices.len(), indices.join(", "))]
    AmbiguousMatch { indices: Vec<String>, detail: String },
    #[error("{label}: {} anomalous match(es): {}\n{detail}", indices.len(), indices.join(", "))]
    Anomalous {
        label: String,
        indices: Vec<String>,
        detail: String,
    },
}

/// Records from both sides sharing one index value.
#[derive(Debug, Clone)]
pub struct Match {
    index: String,
    m_objects: Vec<RecordRef>,
    s_objects: Vec<RecordRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Globals,
    Masterless,
    Slaveless,
    Duplicate,
}

/// Per-side union records of a match, for reporting only.
#[derive(Debug, Clone)]
pub struct MergedMatch {
    pub master: Option<Record>,
    pub slave: Option<Record>,
}

impl Match {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            m_objects: Vec::new(),
            s_objects: Vec::new(),
        }
    }

    pub fn pair(index: impl Into<String>, master: RecordRef, slave: RecordRef) -> Self {
        let mut out = Self::new(index);
        out.push(Side::Master, master);
        out.push(Side::Slave, slave);
        out
    }

    /// Adds a record, keeping each side sorted by key and free of repeats.
    pub fn push(&mut self, side: Side, record: RecordRef) {
        let objects = match side {
            Side::Master => &mut self.m_objects,
            Side::Slave => &mut self.s_objects,
        };
        match objects.binary_search_by(|probe| probe.key().cmp(record.key())) {
            Ok(_) => {}
            Err(pos) => objects.insert(pos, record),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn m_objects(&self) -> &[RecordRef] {
        &self.m_objects
    }

    pub fn s_objects(&self) -> &[RecordRef] {
        &self.s_objects
    }

    pub fn objects(&self, side: Side) -> &[RecordRef] {
        match side {
            Side::Master => &self.m_objects,
            Side::Slave => &self.s_objects,
        }
    }

    pub fn singular_m_object(&self) -> Option<&RecordRef> {
        match self.m_objects.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    pub fn singular_s_object(&self) -> Option<&RecordRef> {
        match self.s_objects.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.m_objects.len() + self.s_objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_two_sided(&self) -> bool {
        !self.m_objects.is_empty() && !self.s_objects.is_empty()
    }

    pub fn bucket(&self) -> Option<Bucket> {
        match (self.m_objects.len(), self.s_objects.len()) {
            (0, 0) => None,
            (1, 1) => Some(Bucket::Globals),
            (m, s) if m > 1 || s > 1 => Some(Bucket::Duplicate),
            (0, _) => Some(Bucket::Masterless),
            _ => Some(Bucket::Slaveless),
        }
    }

    fn absorb(&mut self, other: Match) {
        for record in other.m_objects {
            self.push(Side::Master, record);
        }
        for record in other.s_objects {
            self.push(Side::Slave, record);
        }
    }

    fn without(&self, taken: &BTreeSet<(Side, String)>) -> Match {
        let keep = |side: Side, records: &[RecordRef]| {
            records
                .iter()
                .filter(|r| !taken.contains(&(side, r.key().to_string())))
                .cloned()
                .collect::<Vec<_>>()
        };
        Match {
            index: self.index.clone(),
            m_objects: keep(Side::Master, &self.m_objects),
            s_objects: keep(Side::Slave, &self.s_objects),
        }
    }

    pub fn merge(&self) -> MergedMatch {
        MergedMatch {
            master: union_record(&self.m_objects),
            slave: union_record(&self.s_objects),
        }
    }

    pub fn tabulate(&self) -> String {
        let mut out = format!("index {}\n", self.index);
        for record in &self.m_objects {
            out.push_str(&format!("  master: {}\n", record.identifier()));
        }
        for record in &self.s_objects {
            out.push_str(&format!("  slave:  {}\n", record.identifier()));
        }
        out
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tabulate())
    }
}

fn union_record(records: &[RecordRef]) -> Option<Record> {
    let first = records.first()?;
    if records.len() == 1 {
        return Some(Record::clone(first));
    }
    let key = records
        .iter()
        .map(|r| r.key())
        .collect::<Vec<_>>()
        .join("+");
    let mut seen: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for record in records {
        for (field, value) in record.fields() {
            if value.is_blank() {
                continue;
            }
            let values = seen.entry(field.clone()).or_default();
            if !values.iter().any(|v| v.render() == value.render()) {
                values.push(value.clone());
            }
        }
    }
    let fields = seen.into_iter().map(|(field, mut values)| {
        let value = if values.len() == 1 {
            values.remove(0)
        } else {
            Value::Text(values.iter().map(Value::render).collect::<Vec<_>>().join(" | "))
        };
        (field, value)
    });
    Some(Record::new(first.kind(), key).with_fields(fields))
}

/// A duplicate match judged unsafe to merge.
#[derive(Debug, Clone)]
pub struct InvalidMatch {
    pub matched: Match,
    pub reason: String,
}

/// Outcome of a caller-supplied disambiguation for one duplicate group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Valid,
    Invalid(String),
    /// The records share an index by coincidence; release them as one-sided.
    Unrelated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub globals: usize,
    pub masterless: usize,
    pub slaveless: usize,
    pub duplicate: usize,
    pub valid: usize,
    pub invalid: usize,
    pub unindexable: usize,
}

/// Disjoint classification of every index produced by one matcher run.
#[derive(Debug, Clone, Default)]
pub struct MatchNamespace {
    pub globals: BTreeMap<String, Match>,
    pub masterless: BTreeMap<String, Match>,
    pub slaveless: BTreeMap<String, Match>,
    pub duplicate: BTreeMap<String, Match>,
    /// Pure matches plus duplicates that disambiguation accepted.
    pub valid: BTreeMap<String, Match>,
    pub invalid: BTreeMap<String, InvalidMatch>,
    pub unindexable_master: Vec<RecordRef>,
    pub unindexable_slave: Vec<RecordRef>,
    /// Primary duplicate indices whose records the secondary pass claimed.
    pub resolved_by_secondary: BTreeSet<String>,
}

impl MatchNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, bucket: Bucket) -> &BTreeMap<String, Match> {
        match bucket {
            Bucket::Globals => &self.globals,
            Bucket::Masterless => &self.masterless,
            Bucket::Slaveless => &self.slaveless,
            Bucket::Duplicate => &self.duplicate,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut BTreeMap<String, Match> {
        match bucket {
            Bucket::Globals => &mut self.globals,
            Bucket::Masterless => &mut self.masterless,
            Bucket::Slaveless => &mut self.slaveless,
            Bucket::Duplicate => &mut self.duplicate,
        }
    }

    fn take(&mut self, index: &str) -> Option<Match> {
        for bucket in [
            Bucket::Globals,
            Bucket::Masterless,
            Bucket::Slaveless,
            Bucket::Duplicate,
        ] {
            if let Some(found) = self.bucket_mut(bucket).remove(index) {
                if bucket == Bucket::Globals {
                    self.valid.remove(index);
                }
                return Some(found);
            }
        }
        None
    }

    fn place(&mut self, matched: Match) {
        let Some(bucket) = matched.bucket() else {
            return;
        };
        if bucket == Bucket::Globals {
            self.valid.insert(matched.index.clone(), matched.clone());
        }
        self.bucket_mut(bucket).insert(matched.index.clone(), matched);
    }

    fn place_as(&mut self, bucket: Bucket, matched: Match) {
        self.bucket_mut(bucket).insert(matched.index.clone(), matched);
    }

    /// Index-keyed union; adding the same matches again changes nothing.
    pub fn add_matches(&mut self, matches: impl IntoIterator<Item = Match>) {
        for incoming in matches {
            let merged = match self.take(&incoming.index) {
                Some(mut existing) => {
                    existing.absorb(incoming);
                    existing
                }
                None => incoming,
            };
            self.place(merged);
        }
    }

    pub fn summary(&self) -> MatchSummary {
        MatchSummary {
            globals: self.globals.len(),
            masterless: self.masterless.len(),
            slaveless: self.slaveless.len(),
            duplicate: self.duplicate.len(),
            valid: self.valid.len(),
            invalid: self.invalid.len(),
            unindexable: self.unindexable_master.len() + self.unindexable_slave.len(),
        }
    }

    /// Matches whose records may be reconciled pairwise.
    pub fn valid_pairs(&self) -> impl Iterator<Item = &Match> {
        self.valid.values()
    }
}

pub type PairGuard = fn(&Record, &Record) -> bool;
pub type Disambiguator = Box<dyn Fn(&Match) -> Resolution + Send + Sync>;

/// Configurable matching pass over two registries.
pub struct Matcher {
    primary: IndexFn,
    secondary: Option<IndexFn>,
    pair_guard: Option<PairGuard>,
    disambiguator: Option<Disambiguator>,
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("pair_guard", &self.pair_guard.is_some())
            .field("disambiguator", &self.disambiguator.is_some())
            .finish()
    }
}

impl Matcher {
    pub fn new(primary: IndexFn) -> Self {
        Self {
            primary,
            secondary: None,
            pair_guard: None,
            disambiguator: None,
        }
    }

    pub fn with_secondary(mut self, secondary: IndexFn) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Demotes a 1:1 primary group to duplicate when the guard rejects the pair.
    pub fn with_pair_guard(mut self, guard: PairGuard) -> Self {
        self.pair_guard = Some(guard);
        self
    }

    pub fn with_disambiguator(
        mut self,
        disambiguator: impl Fn(&Match) -> Resolution + Send + Sync + 'static,
    ) -> Self {
        self.disambiguator = Some(Box::new(disambiguator));
        self
    }

    fn resolves_duplicates(&self) -> bool {
        self.secondary.is_some() || self.disambiguator.is_some()
    }

    pub fn run(&self, slave: &Registry, master: &Registry) -> Result<MatchNamespace, MatchError> {
        let mut namespace = MatchNamespace::new();
        let mut groups: BTreeMap<String, Match> = BTreeMap::new();

        for (side, registry) in [(Side::Master, master), (Side::Slave, slave)] {
            for record in registry.iter() {
                match self.primary.apply(record) {
                    Some(key) => groups
                        .entry(key.clone())
                        .or_insert_with(|| Match::new(key))
                        .push(side, Arc::clone(record)),
                    None => match side {
                        Side::Master => namespace.unindexable_master.push(Arc::clone(record)),
                        Side::Slave => namespace.unindexable_slave.push(Arc::clone(record)),
                    },
                }
            }
        }
        namespace.unindexable_master.sort_by(|a, b| a.key().cmp(b.key()));
        namespace.unindexable_slave.sort_by(|a, b| a.key().cmp(b.key()));

        let mut primary_duplicates = BTreeSet::new();
        for (index, group) in groups {
            let guarded = match (self.pair_guard, group.singular_m_object(), group.singular_s_object()) {
                (Some(guard), Some(m), Some(s)) => !guard(m.as_ref(), s.as_ref()),
                _ => false,
            };
            if guarded {
                debug!(index = %index, indexer = self.primary.name(), "pair guard demoted pure match");
                primary_duplicates.insert(index);
                namespace.place_as(Bucket::Duplicate, group);
            } else {
                if group.bucket() == Some(Bucket::Duplicate) {
                    primary_duplicates.insert(index);
                }
                namespace.place(group);
            }
        }

        if let Some(secondary) = self.secondary {
            self.secondary_pass(secondary, &mut namespace, &primary_duplicates);
        }

        let mut unresolved = Vec::new();
        let pending = namespace
            .duplicate
            .keys()
            .filter(|index| primary_duplicates.contains(*index))
            .cloned()
            .collect::<Vec<_>>();
        for index in pending {
            let Some(residual) = namespace.duplicate.get(&index).cloned() else {
                continue;
            };
            let resolution = match &self.disambiguator {
                Some(disambiguate) => disambiguate(&residual),
                None => {
                    unresolved.push(residual);
                    continue;
                }
            };
            debug!(index = %index, ?resolution, "duplicate resolved");
            match resolution {
                Resolution::Valid => {
                    namespace.valid.insert(index, residual);
                }
                Resolution::Invalid(reason) => {
                    namespace.invalid.insert(
                        index,
                        InvalidMatch {
                            matched: residual,
                            reason,
                        },
                    );
                }
                Resolution::Unrelated => {
                    namespace.duplicate.remove(&index);
                    release(&mut namespace, residual);
                }
            }
        }

        if self.resolves_duplicates() && !unresolved.is_empty() {
            return Err(MatchError::AmbiguousMatch {
                indices: unresolved.iter().map(|m| m.index.clone()).collect(),
                detail: unresolved.iter().map(Match::tabulate).collect::<String>(),
            });
        }

        Ok(namespace)
    }

    fn secondary_pass(
        &self,
        secondary: IndexFn,
        namespace: &mut MatchNamespace,
        primary_duplicates: &BTreeSet<String>,
    ) {
        let mut origin: BTreeMap<(Side, String), String> = BTreeMap::new();
        let mut groups: BTreeMap<String, Match> = BTreeMap::new();
        for bucket in [Bucket::Masterless, Bucket::Slaveless, Bucket::Duplicate] {
            for (index, leftover) in namespace.bucket(bucket) {
                for side in [Side::Master, Side::Slave] {
                    for record in leftover.objects(side) {
                        origin.insert((side, record.key().to_string()), index.clone());
                        if let Some(value) = secondary.apply(record) {
                            let key = format!("{}:{}", secondary.name(), value);
                            groups
                                .entry(key.clone())
                                .or_insert_with(|| Match::new(key))
                                .push(side, Arc::clone(record));
                        }
                    }
                }
            }
        }

        let mut taken: BTreeSet<(Side, String)> = BTreeSet::new();
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut found = Vec::new();
        for (_, group) in groups {
            if group.bucket() != Some(Bucket::Globals) {
                continue;
            }
            for side in [Side::Master, Side::Slave] {
                for record in group.objects(side) {
                    let record_key = (side, record.key().to_string());
                    if let Some(prior) = origin.get(&record_key) {
                        touched.insert(prior.clone());
                    }
                    taken.insert(record_key);
                }
            }
            found.push(group);
        }
        if found.is_empty() {
            return;
        }
        debug!(indexer = secondary.name(), matches = found.len(), "secondary pass");

        for prior in &touched {
            let Some(previous) = namespace.take(prior) else {
                continue;
            };
            let residual = previous.without(&taken);
            if primary_duplicates.contains(prior) {
                if residual.is_two_sided() {
                    namespace.place_as(Bucket::Duplicate, residual);
                    continue;
                }
                namespace.resolved_by_secondary.insert(prior.clone());
            }
            namespace.place(residual);
        }
        for group in found {
            namespace.place(group);
        }
    }
}

fn release(namespace: &mut MatchNamespace, residual: Match) {
    for side in [Side::Master, Side::Slave] {
        for record in residual.objects(side) {
            let mut single = Match::new(format!("{}#{}", residual.index, record.key()));
            single.push(side, Arc::clone(record));
            namespace.place(single);
        }
    }
}

/// Match two registries, with an optional secondary index for leftovers.
pub fn match_registries(
    slave: &Registry,
    master: &Registry,
    index: IndexFn,
    secondary: Option<IndexFn>,
) -> Result<MatchNamespace, MatchError> {
    let mut matcher = Matcher::new(index);
    if let Some(secondary) = secondary {
        matcher = matcher.with_secondary(secondary);
    }
    matcher.run(slave, master)
}

/// Promote a bucket to an error when the phase requires 1:1 correspondence.
pub fn deny_anomalous<'a>(
    label: &str,
    matches: impl IntoIterator<Item = &'a Match>,
    allow_duplicates: bool,
) -> Result<(), MatchError> {
    let offending = matches
        .into_iter()
        .filter(|m| !(allow_duplicates && m.is_two_sided()))
        .collect::<Vec<_>>();
    if offending.is_empty() {
        return Ok(());
    }
    Err(MatchError::Anomalous {
        label: label.to_string(),
        indices: offending.iter().map(|m| m.index.clone()).collect(),
        detail: offending.iter().map(|m| m.tabulate()).collect::<String>(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearMiss {
    pub master_index: String,
    pub slave_index: String,
    pub score: f64,
}

/// Pairs of one-sided indices that look like renames of each other.
pub fn suggest_near_misses(namespace: &MatchNamespace, threshold: f64) -> Vec<NearMiss> {
    let mut out = Vec::new();
    for master_index in namespace.slaveless.keys() {
        let best = namespace
            .masterless
            .keys()
            .map(|slave_index| (slave_index, jaro_winkler(master_index, slave_index)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)));
        if let Some((slave_index, score)) = best {
            out.push(NearMiss {
                master_index: master_index.clone(),
                slave_index: slave_index.clone(),
                score,
            });
        }
    }
    out
}
