//! Merge orchestration: phase matching, update planning, apply and run reports.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csync_adapters::load_catalog;
use csync_core::{
    fields, index, normalize_text, strategy_for, Authority, Catalog, Comparator, Fields, Kind,
    Record, RecordRef, Registry, RemoteIdLinks, Resolver, Side, SyncHandle, Value,
};
use csync_match::{
    deny_anomalous, match_registries, suggest_near_misses, Match, MatchError, MatchNamespace,
    MatchSummary, Matcher, NearMiss, Resolution,
};
use csync_transport::{
    rest_transports, BackoffPolicy, HttpClientConfig, RestConfig, Transport, TransportError,
    TransportFactory,
};
use csync_update::{
    Action, ApplyError, FailureReport, IdentityConflict, ResultsNamespace, ResultsSummary,
    SyncUpdate, UpdateError, UpdateNamespace, UpdateSummary,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "csync-sync";

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub master_path: PathBuf,
    pub slave_path: PathBuf,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub auto_create: bool,
    pub include_problematic: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("CSYNC_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            master_path: std::env::var("CSYNC_MASTER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("master.json")),
            slave_path: std::env::var("CSYNC_SLAVE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("slave.json")),
            api_url: std::env::var("CSYNC_API_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            api_key: std::env::var("CSYNC_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("CSYNC_USER_AGENT")
                .unwrap_or_else(|_| "csync/0.1".to_string()),
            http_timeout_secs: std::env::var("CSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            auto_create: env_flag("CSYNC_AUTO_CREATE"),
            include_problematic: env_flag("CSYNC_INCLUDE_PROBLEMATIC"),
            workspace_root,
        }
    }

    /// Defaults rooted at `root`, without consulting the environment.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        Self {
            master_path: workspace_root.join("master.json"),
            slave_path: workspace_root.join("slave.json"),
            api_url: None,
            api_key: None,
            user_agent: "csync/0.1".to_string(),
            http_timeout_secs: 20,
            auto_create: false,
            include_problematic: false,
            workspace_root,
        }
    }
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandleOverrides {
    #[serde(default)]
    pub image: Option<Vec<SyncHandle>>,
    #[serde(default)]
    pub category: Option<Vec<SyncHandle>>,
    #[serde(default)]
    pub product: Option<Vec<SyncHandle>>,
    #[serde(default)]
    pub variation: Option<Vec<SyncHandle>>,
}

/// Contents of `sync.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRulesFile {
    #[serde(default)]
    pub merge_mode: Authority,
    #[serde(default)]
    pub auto_create_new: bool,
    #[serde(default)]
    pub include_problematic: bool,
    #[serde(default = "enabled")]
    pub do_images: bool,
    #[serde(default = "enabled")]
    pub do_categories: bool,
    #[serde(default = "enabled")]
    pub do_products: bool,
    #[serde(default = "enabled")]
    pub do_variations: bool,
    #[serde(default)]
    pub handles: HandleOverrides,
}

impl Default for SyncRulesFile {
    fn default() -> Self {
        Self {
            merge_mode: Authority::MasterWins,
            auto_create_new: false,
            include_problematic: false,
            do_images: true,
            do_categories: true,
            do_products: true,
            do_variations: true,
            handles: HandleOverrides::default(),
        }
    }
}

/// Built-in handles used when `sync.yaml` does not list a kind.
pub fn default_handles(kind: Kind) -> Vec<SyncHandle> {
    let derived = |name: &str, comparator: Comparator| {
        SyncHandle::new(name)
            .comparator(comparator)
            .column(Side::Master, None, false)
    };
    match kind {
        Kind::Image => vec![
            SyncHandle::new(fields::FILE_NAME)
                .comparator(Comparator::Normalized)
                .static_field(),
            SyncHandle::new(fields::TITLE).comparator(Comparator::Normalized),
            SyncHandle::new("alt_text").comparator(Comparator::Normalized),
        ],
        Kind::Category => vec![
            SyncHandle::new(fields::TITLE)
                .comparator(Comparator::Normalized)
                .column(Side::Slave, Some("name"), true),
            SyncHandle::new("description").comparator(Comparator::Normalized),
            derived(fields::PARENT_ID, Comparator::Exact),
            derived(fields::IMAGE_IDS, Comparator::Set),
        ],
        Kind::Product => vec![
            SyncHandle::new(fields::SKU).static_field(),
            SyncHandle::new(fields::TITLE)
                .comparator(Comparator::Normalized)
                .column(Side::Slave, Some("name"), true),
            SyncHandle::new("description").comparator(Comparator::Normalized),
            SyncHandle::new("price")
                .comparator(Comparator::Numeric { tolerance: 0.001 })
                .tracked()
                .column(Side::Slave, Some("regular_price"), true),
            SyncHandle::new("sale_price").comparator(Comparator::Numeric { tolerance: 0.001 }),
            SyncHandle::new("stock_quantity")
                .comparator(Comparator::Numeric { tolerance: 0.0 })
                .tracked()
                .column(Side::Master, None, false),
            derived(fields::CATEGORY_IDS, Comparator::Set),
            derived(fields::IMAGE_IDS, Comparator::Set),
        ],
        Kind::Variation => vec![
            SyncHandle::new(fields::SKU).static_field(),
            SyncHandle::new("price")
                .comparator(Comparator::Numeric { tolerance: 0.001 })
                .tracked()
                .column(Side::Slave, Some("regular_price"), true),
            SyncHandle::new("stock_quantity")
                .comparator(Comparator::Numeric { tolerance: 0.0 })
                .column(Side::Master, None, false),
            derived(fields::PARENT_ID, Comparator::Exact),
        ],
    }
}

/// Resolved run settings: every handle carries an explicit authority.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub merge_mode: Authority,
    pub auto_create_new: bool,
    pub include_problematic: bool,
    pub phases: BTreeSet<Kind>,
    pub handles: BTreeMap<Kind, Vec<SyncHandle>>,
    pub near_miss_threshold: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_rules(SyncRulesFile::default())
    }
}

impl SyncSettings {
    pub fn from_rules(rules: SyncRulesFile) -> Self {
        let toggles = [
            (Kind::Image, rules.do_images, rules.handles.image),
            (Kind::Category, rules.do_categories, rules.handles.category),
            (Kind::Product, rules.do_products, rules.handles.product),
            (Kind::Variation, rules.do_variations, rules.handles.variation),
        ];
        let mut phases = BTreeSet::new();
        let mut handles = BTreeMap::new();
        for (kind, on, configured) in toggles {
            if on {
                phases.insert(kind);
            }
            let list = configured
                .unwrap_or_else(|| default_handles(kind))
                .into_iter()
                .map(|mut handle| {
                    handle.authority.get_or_insert(rules.merge_mode);
                    handle
                })
                .collect::<Vec<_>>();
            handles.insert(kind, list);
        }
        Self {
            merge_mode: rules.merge_mode,
            auto_create_new: rules.auto_create_new,
            include_problematic: rules.include_problematic,
            phases,
            handles,
            near_miss_threshold: 0.9,
        }
    }

    /// Read `sync.yaml` from the workspace root; a missing file means defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("sync.yaml");
        if !path.exists() {
            debug!(path = %path.display(), "no sync rules file; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rules: SyncRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_rules(rules))
    }

    pub fn handles(&self, kind: Kind) -> &[SyncHandle] {
        self.handles.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn phase_enabled(&self, kind: Kind) -> bool {
        self.phases.contains(&kind)
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error("invalid category matches: {}\n{detail}", indices.join(", "))]
    InvalidCategories { indices: Vec<String>, detail: String },
    #[error("image file name collisions not separated by attachee sku: {}\n{detail}", indices.join(", "))]
    ImageIntegrity { indices: Vec<String>, detail: String },
}

/// Why `apply` stopped before draining its queues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "halt", rename_all = "snake_case")]
pub enum ApplyHalt {
    #[error("interrupted")]
    Interrupted,
    #[error("dependency cycle: parent chain cannot be resolved for {}", pending.join(", "))]
    DependencyCycle { pending: Vec<String> },
    #[error("no {side} transport for {kind}")]
    TransportUnavailable { side: Side, kind: Kind },
}

/// Record context threaded through matching and merging.
pub struct MergeContext<'a> {
    master: &'a Catalog,
    slave: &'a Catalog,
    settings: &'a SyncSettings,
    links: RemoteIdLinks,
    slave_links: RemoteIdLinks,
    /// Master product key to the category ids its membership match resolved.
    memberships: BTreeMap<String, Vec<String>>,
}

impl<'a> MergeContext<'a> {
    pub fn new(master: &'a Catalog, slave: &'a Catalog, settings: &'a SyncSettings) -> Self {
        Self {
            master,
            slave,
            settings,
            links: RemoteIdLinks::new(),
            slave_links: RemoteIdLinks::new(),
            memberships: BTreeMap::new(),
        }
    }

    pub fn master(&self) -> &'a Catalog {
        self.master
    }

    pub fn slave(&self) -> &'a Catalog {
        self.slave
    }

    pub fn settings(&self) -> &'a SyncSettings {
        self.settings
    }

    pub fn links(&self) -> &RemoteIdLinks {
        &self.links
    }

    /// Derived fields of `record`, resolved against its own side.
    pub fn derive_extra(&self, side: Side, record: &Record) -> Fields {
        let strategy = strategy_for(record.kind());
        match side {
            Side::Master => {
                let mut extra = strategy.derive(record, &Resolver::new(self.master, &self.links));
                if let Some(ids) = self.memberships.get(record.key()) {
                    extra.insert(fields::CATEGORY_IDS.to_string(), Value::List(ids.clone()));
                }
                extra
            }
            Side::Slave => strategy.derive(record, &Resolver::new(self.slave, &self.slave_links)),
        }
    }

    /// Category ids a matched product should carry. Title pairs keep the slave
    /// category's id and master-only categories contribute their own id when
    /// they have one. Slave-only categories are dropped.
    fn membership_ids(&self, membership: &MatchNamespace) -> Vec<String> {
        let master = Resolver::new(self.master, &self.links);
        let slave = Resolver::new(self.slave, &self.slave_links);
        let paired = membership
            .globals
            .values()
            .chain(membership.duplicate.values().filter(|m| m.is_two_sided()))
            .flat_map(|matched| matched.s_objects())
            .filter_map(|category| slave.remote_id(Kind::Category, category.key()));
        let unpaired = membership
            .slaveless
            .values()
            .flat_map(|matched| matched.m_objects())
            .chain(membership.unindexable_master.iter())
            .filter_map(|category| master.remote_id(Kind::Category, category.key()));
        let ids = paired.chain(unpaired).collect::<BTreeSet<_>>();
        ids.into_iter().collect()
    }

    pub fn master_remote_id(&self, kind: Kind, key: &str) -> Option<String> {
        Resolver::new(self.master, &self.links).remote_id(kind, key)
    }

    fn mirror(&mut self, kind: Kind, matched: &Match) {
        let Some(slave) = matched.singular_s_object() else {
            return;
        };
        let Some(id) = slave.remote_id() else {
            return;
        };
        for master in matched.m_objects() {
            if master.remote_id().is_none() {
                self.links.link(kind, master.key(), id);
            }
        }
    }
}

fn attachee_set(record: &Record) -> BTreeSet<String> {
    record
        .links()
        .attachees
        .iter()
        .map(|a| a.trim().to_uppercase())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Same-named images are only the same image when they share an owner.
fn shares_attachee(master: &Record, slave: &Record) -> bool {
    let theirs = attachee_set(slave);
    attachee_set(master).iter().any(|a| theirs.contains(a))
}

/// Only a lone pair rejected by the attachee guard may be split apart.
fn disambiguate_images(matched: &Match) -> Resolution {
    match (matched.singular_m_object(), matched.singular_s_object()) {
        (Some(m), Some(s)) if !shares_attachee(m, s) => Resolution::Unrelated,
        (Some(_), Some(_)) => {
            Resolution::Invalid("file name pair shares attachees but was not matched".to_string())
        }
        _ => Resolution::Invalid(format!(
            "file name collision left {} master and {} slave images unmatched by sku",
            matched.m_objects().len(),
            matched.s_objects().len()
        )),
    }
}

/// File names used by more than one image on either side whose images were
/// not all paired through their attachee SKU.
fn unresolved_collisions(
    master: &Registry,
    slave: &Registry,
    matches: &MatchNamespace,
) -> BTreeMap<String, Match> {
    let prefix = format!("{}:", index::ATTACHEE_SKU.name());
    let paired = matches
        .globals
        .iter()
        .filter(|(key, _)| key.starts_with(&prefix))
        .flat_map(|(_, pair)| {
            [Side::Master, Side::Slave].into_iter().flat_map(move |side| {
                pair.objects(side)
                    .iter()
                    .map(move |record| (side, record.key().to_string()))
            })
        })
        .collect::<BTreeSet<_>>();

    let mut groups: BTreeMap<String, Match> = BTreeMap::new();
    for (side, registry) in [(Side::Master, master), (Side::Slave, slave)] {
        for record in registry.iter() {
            if let Some(key) = index::IMAGE_FILE_NAME.apply(record) {
                groups
                    .entry(key.clone())
                    .or_insert_with(|| Match::new(key))
                    .push(side, Arc::clone(record));
            }
        }
    }
    groups.retain(|_, group| {
        let collides = group.m_objects().len() > 1 || group.s_objects().len() > 1;
        collides
            && [Side::Master, Side::Slave].into_iter().any(|side| {
                group
                    .objects(side)
                    .iter()
                    .any(|record| !paired.contains(&(side, record.key().to_string())))
            })
    });
    groups
}

fn name_sum(record: &Record) -> String {
    record
        .get_text(fields::FULL_NAME_SUM)
        .map(|s| normalize_text(&s))
        .unwrap_or_default()
}

fn disambiguate_categories(matched: &Match) -> Resolution {
    if matched.s_objects().len() > 1 {
        return Resolution::Invalid(format!(
            "{} slave categories share this title",
            matched.s_objects().len()
        ));
    }
    let sums = matched
        .m_objects()
        .iter()
        .map(|r| name_sum(r))
        .collect::<BTreeSet<_>>();
    if sums.len() > 1 {
        return Resolution::Invalid(format!(
            "master full name sums differ: {}",
            sums.into_iter().collect::<Vec<_>>().join(" / ")
        ));
    }
    Resolution::Valid
}

fn invalid_detail(matches: &MatchNamespace) -> (Vec<String>, String) {
    let indices = matches.invalid.keys().cloned().collect();
    let detail = matches
        .invalid
        .values()
        .map(|invalid| format!("{}: {}\n{}", invalid.matched.index(), invalid.reason, invalid.matched.tabulate()))
        .collect::<String>();
    (indices, detail)
}

/// Images attached to at least one owner, filename first, attachee SKU second.
pub fn match_images(ctx: &MergeContext<'_>) -> Result<MatchNamespace, MergeError> {
    let master = ctx.master.images.filtered(|r| !r.links().attachees.is_empty());
    let slave = ctx.slave.images.filtered(|r| !r.links().attachees.is_empty());
    debug!(
        skipped_master = ctx.master.images.len() - master.len(),
        skipped_slave = ctx.slave.images.len() - slave.len(),
        "unattached images skipped"
    );

    let matches = Matcher::new(index::IMAGE_FILE_NAME)
        .with_secondary(index::ATTACHEE_SKU)
        .with_pair_guard(shares_attachee)
        .with_disambiguator(disambiguate_images)
        .run(&slave, &master)?;

    if !matches.invalid.is_empty() {
        let (indices, detail) = invalid_detail(&matches);
        return Err(MergeError::ImageIntegrity { indices, detail });
    }
    let collisions = unresolved_collisions(&master, &slave, &matches);
    if !collisions.is_empty() {
        return Err(MergeError::ImageIntegrity {
            indices: collisions.keys().cloned().collect(),
            detail: collisions.values().map(Match::tabulate).collect(),
        });
    }
    Ok(matches)
}

/// Categories by title. Any duplicate that cannot be merged safely aborts the phase.
pub fn match_categories(ctx: &MergeContext<'_>) -> Result<MatchNamespace, MergeError> {
    let matches = Matcher::new(index::CATEGORY_TITLE)
        .with_disambiguator(disambiguate_categories)
        .run(&ctx.slave.categories, &ctx.master.categories)?;

    if !matches.invalid.is_empty() {
        let (indices, detail) = invalid_detail(&matches);
        return Err(MergeError::InvalidCategories { indices, detail });
    }
    Ok(matches)
}

#[derive(Debug, Clone, Default)]
pub struct ProductMatches {
    pub matches: MatchNamespace,
    /// Category memberships of each matched product, keyed by product index.
    pub memberships: BTreeMap<String, MatchNamespace>,
}

fn linked_registry(catalog: &Catalog, kind: Kind, keys: &[String]) -> Registry {
    let mut registry = Registry::new();
    for record in catalog.resolve(kind, keys) {
        if registry.insert(record).is_err() {
            debug!(%kind, "repeated link ignored");
        }
    }
    registry
}

pub fn match_products(ctx: &MergeContext<'_>) -> Result<ProductMatches, MergeError> {
    let matches = match_registries(
        &ctx.slave.products,
        &ctx.master.products,
        index::PRODUCT_SKU,
        None,
    )?;
    deny_anomalous("product duplicates", matches.duplicate.values(), false)?;

    let mut memberships = BTreeMap::new();
    for (product, pair) in &matches.globals {
        let (Some(m), Some(s)) = (pair.singular_m_object(), pair.singular_s_object()) else {
            continue;
        };
        let master_categories = linked_registry(ctx.master, Kind::Category, &m.links().categories);
        let slave_categories = linked_registry(ctx.slave, Kind::Category, &s.links().categories);
        let membership = match_registries(
            &slave_categories,
            &master_categories,
            index::CATEGORY_TITLE,
            None,
        )?;
        memberships.insert(product.clone(), membership);
    }
    Ok(ProductMatches {
        matches,
        memberships,
    })
}

/// Merge the product phase with each matched product's category ids taken
/// from its membership match.
pub fn merge_products(
    products: &ProductMatches,
    ctx: &mut MergeContext<'_>,
) -> Result<UpdateNamespace, MergeError> {
    for (index, membership) in &products.memberships {
        let Some(master) = products
            .matches
            .globals
            .get(index)
            .and_then(Match::singular_m_object)
        else {
            continue;
        };
        let ids = ctx.membership_ids(membership);
        ctx.memberships.insert(master.key().to_string(), ids);
    }
    merge(Kind::Product, &products.matches, ctx)
}

pub fn match_variations(ctx: &MergeContext<'_>) -> Result<MatchNamespace, MergeError> {
    let matches = match_registries(
        &ctx.slave.variations,
        &ctx.master.variations,
        index::VARIATION_KEY,
        None,
    )?;
    deny_anomalous("variation duplicates", matches.duplicate.values(), false)?;
    Ok(matches)
}

fn queue_create(
    ctx: &MergeContext<'_>,
    handles: &[SyncHandle],
    master: &RecordRef,
    updates: &mut UpdateNamespace,
) -> Result<(), MergeError> {
    if !ctx.settings.auto_create_new {
        info!(record = %master.identifier(), "needs to be created");
        return Ok(());
    }
    let mut update = SyncUpdate::new(Some(Arc::clone(master)), None)?;
    update.set_extra(Side::Master, ctx.derive_extra(Side::Master, master));
    update.update(handles);
    updates.new_slaves.push(update);
    Ok(())
}

/// Turn one phase's matches into pending updates.
pub fn merge(
    kind: Kind,
    matches: &MatchNamespace,
    ctx: &mut MergeContext<'_>,
) -> Result<UpdateNamespace, MergeError> {
    for matched in matches.valid.values() {
        ctx.mirror(kind, matched);
    }
    let handles = ctx.settings.handles(kind).to_vec();
    let mut updates = UpdateNamespace::new();

    for matched in matches.valid.values() {
        let Some(master) = matched.m_objects().first() else {
            continue;
        };
        for twin in matched.m_objects().iter().skip(1) {
            ctx.links.alias(kind, twin.key(), master.key());
        }
        match matched.singular_s_object() {
            Some(slave) => {
                let mut update = SyncUpdate::new(Some(Arc::clone(master)), Some(Arc::clone(slave)))?;
                update.set_extra(Side::Master, ctx.derive_extra(Side::Master, master));
                update.set_extra(Side::Slave, ctx.derive_extra(Side::Slave, slave));
                update.update(&handles);
                updates.enqueue(update)?;
            }
            None => queue_create(ctx, &handles, master, &mut updates)?,
        }
    }

    for matched in matches.slaveless.values() {
        for master in matched.m_objects() {
            queue_create(ctx, &handles, master, &mut updates)?;
        }
    }

    for matched in matches.masterless.values() {
        for slave in matched.s_objects() {
            let mut update = SyncUpdate::new(None, Some(Arc::clone(slave)))?;
            update.set_extra(Side::Slave, ctx.derive_extra(Side::Slave, slave));
            update.update(&handles);
            debug!(subject = %update.subject(), "slave record has no master");
            updates.new_masters.push(update);
        }
    }

    info!(phase = %kind, summary = ?updates.summary(), "merge planned");
    Ok(updates)
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub include_problematic: bool,
    pub interrupt: Arc<AtomicBool>,
}

impl ApplyOptions {
    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub results: ResultsNamespace,
    pub halted: Option<ApplyHalt>,
    /// Master updates left unapplied because no master transport exists.
    pub pending_master: usize,
}

fn transport_failure(err: TransportError) -> ApplyError {
    ApplyError::Transport {
        endpoint: err.endpoint().to_string(),
        status: err.status(),
        message: err.to_string(),
    }
}

fn record_failure(
    results: &mut ResultsNamespace,
    update: SyncUpdate,
    side: Side,
    action: Action,
    error: ApplyError,
) {
    error!(subject = %update.subject(), %side, error = %error, "update failed\n{}", update.tabulate());
    results.record_failure(update, side, action, error);
}

/// Apply one phase's updates through the transports, one at a time.
///
/// Creates run first (parent-first for categories), then slave changes, then master
/// write-back. Failures are collected per update; a halt keeps everything recorded so far.
pub async fn apply(
    kind: Kind,
    updates: UpdateNamespace,
    factory: &dyn TransportFactory,
    ctx: &MergeContext<'_>,
    options: &ApplyOptions,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let needs_slave = !updates.new_slaves.is_empty()
        || !updates.slave.is_empty()
        || (options.include_problematic && !updates.problematic.is_empty());

    match factory.transport(Side::Slave, kind) {
        Some(transport) => {
            let created = create_slaves(
                kind,
                updates.new_slaves,
                transport.as_ref(),
                ctx,
                options,
                &mut outcome.results,
            )
            .await;
            if let Err(halt) = created {
                outcome.halted = Some(halt);
                return outcome;
            }

            let mut queue = updates.slave;
            if options.include_problematic {
                queue.extend(updates.problematic);
            }
            let uploaded =
                upload_all(Side::Slave, queue, transport.as_ref(), options, &mut outcome.results).await;
            if let Err(halt) = uploaded {
                outcome.halted = Some(halt);
                return outcome;
            }
        }
        None if needs_slave => {
            outcome.halted = Some(ApplyHalt::TransportUnavailable {
                side: Side::Slave,
                kind,
            });
            return outcome;
        }
        None => {}
    }

    match factory.transport(Side::Master, kind) {
        Some(transport) => {
            let uploaded = upload_all(
                Side::Master,
                updates.master,
                transport.as_ref(),
                options,
                &mut outcome.results,
            )
            .await;
            if let Err(halt) = uploaded {
                outcome.halted = Some(halt);
            }
        }
        None => {
            if !updates.master.is_empty() {
                info!(phase = %kind, pending = updates.master.len(), "master write-back pending; no master transport");
            }
            outcome.pending_master = updates.master.len();
        }
    }
    outcome
}

async fn create_slaves(
    kind: Kind,
    new_slaves: Vec<SyncUpdate>,
    transport: &dyn Transport,
    ctx: &MergeContext<'_>,
    options: &ApplyOptions,
    results: &mut ResultsNamespace,
) -> Result<(), ApplyHalt> {
    let strategy = strategy_for(kind);
    let mut pending = new_slaves
        .iter()
        .filter_map(|u| u.old_m_object())
        .map(|r| r.key().to_string())
        .collect::<BTreeSet<_>>();
    let mut queue: VecDeque<SyncUpdate> = new_slaves.into();
    let mut stalled = 0usize;

    while let Some(mut update) = queue.pop_front() {
        if options.interrupted() {
            warn!(remaining = queue.len() + 1, "interrupted before create");
            return Err(ApplyHalt::Interrupted);
        }
        let Some(master) = update.old_m_object().cloned() else {
            continue;
        };

        if let (Some(parent_kind), Some(parent_key)) =
            (strategy.parent_kind(), master.links().parent.as_deref())
        {
            if parent_kind == kind && pending.contains(parent_key) {
                debug!(key = master.key(), parent = parent_key, "parent pending; requeued");
                queue.push_back(update);
                stalled += 1;
                if stalled > queue.len() {
                    let mut keys = queue
                        .iter()
                        .filter_map(|u| u.old_m_object())
                        .map(|r| r.key().to_string())
                        .collect::<Vec<_>>();
                    keys.sort();
                    error!(pending = ?keys, "parent chain cannot be resolved");
                    return Err(ApplyHalt::DependencyCycle { pending: keys });
                }
                continue;
            }
            if parent_kind == kind && ctx.master.lookup(parent_kind, parent_key).is_none() {
                error!(key = master.key(), parent = parent_key, "parent is not in the catalog");
                return Err(ApplyHalt::DependencyCycle {
                    pending: vec![format!("{} (missing parent {parent_key})", master.key())],
                });
            }
            if ctx.master_remote_id(parent_kind, parent_key).is_none() {
                stalled = 0;
                pending.remove(master.key());
                let error = ApplyError::ParentUnavailable {
                    key: master.key().to_string(),
                    parent: parent_key.to_string(),
                };
                record_failure(results, update, Side::Slave, Action::Create, error);
                continue;
            }
        }

        stalled = 0;
        pending.remove(master.key());
        // the parent may have been created since this update was planned
        update.set_extra(Side::Master, ctx.derive_extra(Side::Master, &master));
        let payload = match update.get_slave_updates() {
            Ok(payload) => payload,
            Err(err) => {
                record_failure(results, update, Side::Slave, Action::Create, err.into());
                continue;
            }
        };

        match transport.create_item(&payload).await {
            Ok(response) => {
                let Some(id) = response.id else {
                    let error = ApplyError::MissingRemoteId {
                        subject: update.subject(),
                    };
                    record_failure(results, update, Side::Slave, Action::Create, error);
                    continue;
                };
                match master.stamp_remote_id(id.clone()) {
                    Ok(()) => {
                        info!(record = %master.identifier(), "created");
                        results.record_success(update, Side::Slave, Action::Create, Some(id));
                    }
                    Err(err) => {
                        record_failure(results, update, Side::Slave, Action::Create, err.into())
                    }
                }
            }
            Err(err) => record_failure(
                results,
                update,
                Side::Slave,
                Action::Create,
                transport_failure(err),
            ),
        }
    }
    Ok(())
}

async fn upload_all(
    side: Side,
    queue: Vec<SyncUpdate>,
    transport: &dyn Transport,
    options: &ApplyOptions,
    results: &mut ResultsNamespace,
) -> Result<(), ApplyHalt> {
    let total = queue.len();
    for (position, update) in queue.into_iter().enumerate() {
        if options.interrupted() {
            warn!(remaining = total - position, %side, "interrupted before upload");
            return Err(ApplyHalt::Interrupted);
        }
        let changes = match update.updates_for(side) {
            Ok(changes) => changes,
            Err(err) => {
                record_failure(results, update, side, Action::Update, err.into());
                continue;
            }
        };
        if changes.is_empty() {
            continue;
        }
        let Some(pkey) = update.pkey(side) else {
            let error = ApplyError::MissingPrimaryKey {
                subject: update.subject(),
                side,
            };
            record_failure(results, update, side, Action::Update, error);
            continue;
        };
        match transport.upload_changes(&pkey, &changes).await {
            Ok(_) => {
                debug!(%side, pkey = %pkey, fields = changes.len(), "uploaded");
                results.record_success(update, side, Action::Update, Some(pkey));
            }
            Err(err) => record_failure(results, update, side, Action::Update, transport_failure(err)),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Apply,
    /// Match and merge only.
    Plan,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Apply => "apply",
            RunMode::Plan => "plan",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MembershipSummary {
    pub products: usize,
    pub added: usize,
    pub removed: usize,
    /// Memberships whose category has no remote id yet.
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: Kind,
    pub matches: MatchSummary,
    pub updates: UpdateSummary,
    pub results: ResultsSummary,
    pub pending_master: usize,
    pub near_misses: Vec<NearMiss>,
    pub membership: Option<MembershipSummary>,
    pub conflicts: Vec<IdentityConflict>,
    pub failures: Vec<FailureReport>,
    pub halted: Option<ApplyHalt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseAbort {
    pub phase: Kind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: RunMode,
    pub master_records: usize,
    pub slave_records: usize,
    pub phases: Vec<PhaseReport>,
    pub aborted: Option<PhaseAbort>,
    pub reports_dir: String,
    pub manifest: String,
}

impl SyncRunSummary {
    pub fn failure_count(&self) -> usize {
        self.phases.iter().map(|p| p.failures.len()).sum()
    }

    pub fn phase(&self, kind: Kind) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub files: Vec<RunManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn summarize_memberships(
    ctx: &MergeContext<'_>,
    memberships: &BTreeMap<String, MatchNamespace>,
) -> MembershipSummary {
    let mut summary = MembershipSummary {
        products: memberships.len(),
        ..MembershipSummary::default()
    };
    for (product, membership) in memberships {
        summary.added += membership.slaveless.len();
        summary.removed += membership.masterless.len();
        for matched in membership.slaveless.values() {
            for category in matched.m_objects() {
                if ctx.master_remote_id(Kind::Category, category.key()).is_none() {
                    summary
                        .unresolved
                        .push(format!("{product}: {}", category.identifier()));
                }
            }
        }
    }
    if !summary.unresolved.is_empty() {
        warn!(
            count = summary.unresolved.len(),
            "product memberships reference categories without a remote id"
        );
    }
    summary
}

pub struct SyncPipeline {
    config: SyncConfig,
    settings: SyncSettings,
    transports: Option<Arc<dyn TransportFactory>>,
    interrupt: Arc<AtomicBool>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let mut settings = SyncSettings::load(&config.workspace_root)?;
        settings.auto_create_new |= config.auto_create;
        settings.include_problematic |= config.include_problematic;

        let transports = match &config.api_url {
            Some(base_url) => {
                let map = rest_transports(&RestConfig {
                    base_url: base_url.clone(),
                    api_key: config.api_key.clone(),
                    http: HttpClientConfig {
                        timeout: Duration::from_secs(config.http_timeout_secs),
                        user_agent: Some(config.user_agent.clone()),
                        backoff: BackoffPolicy::default(),
                    },
                })?;
                Some(Arc::new(map) as Arc<dyn TransportFactory>)
            }
            None => None,
        };

        Ok(Self {
            config,
            settings,
            transports,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Setting the flag stops `apply` before its next update.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub async fn run_once(&self, mode: RunMode) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let master = load_catalog(&self.config.master_path, Side::Master)?;
        let slave = load_catalog(&self.config.slave_path, Side::Slave)?;

        let mode = match (mode, &self.transports) {
            (RunMode::Apply, None) => {
                warn!("no transport configured; running in plan mode");
                RunMode::Plan
            }
            (mode, _) => mode,
        };
        info!(%run_id, master = master.len(), slave = slave.len(), mode = mode.as_str(), "sync run started");

        let (phases, aborted) = self.reconcile(&master, &slave, mode).await;

        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            mode,
            master_records: master.len(),
            slave_records: slave.len(),
            phases,
            aborted,
            reports_dir: reports_dir.display().to_string(),
            manifest: reports_dir.join("manifest.json").display().to_string(),
        };
        write_reports(&reports_dir, &summary).await?;
        info!(%run_id, failures = summary.failure_count(), aborted = summary.aborted.is_some(), "sync run finished");
        Ok(summary)
    }

    async fn reconcile(
        &self,
        master: &Catalog,
        slave: &Catalog,
        mode: RunMode,
    ) -> (Vec<PhaseReport>, Option<PhaseAbort>) {
        let mut ctx = MergeContext::new(master, slave, &self.settings);
        let options = ApplyOptions {
            include_problematic: self.settings.include_problematic,
            interrupt: Arc::clone(&self.interrupt),
        };
        let mut phases = Vec::new();

        for kind in Kind::PHASE_ORDER {
            if !self.settings.phase_enabled(kind) {
                debug!(phase = %kind, "phase disabled");
                continue;
            }
            if self.interrupt.load(Ordering::SeqCst) {
                return (
                    phases,
                    Some(PhaseAbort {
                        phase: kind,
                        error: ApplyHalt::Interrupted.to_string(),
                    }),
                );
            }

            let span = info_span!("phase", phase = %kind);
            match self
                .run_phase(kind, &mut ctx, mode, &options)
                .instrument(span)
                .await
            {
                Ok(report) => {
                    let halted = report.halted.clone();
                    phases.push(report);
                    if let Some(halt) = halted {
                        error!(phase = %kind, error = %halt, "phase halted");
                        return (
                            phases,
                            Some(PhaseAbort {
                                phase: kind,
                                error: halt.to_string(),
                            }),
                        );
                    }
                }
                Err(err) => {
                    error!(phase = %kind, error = %err, "phase aborted");
                    return (
                        phases,
                        Some(PhaseAbort {
                            phase: kind,
                            error: err.to_string(),
                        }),
                    );
                }
            }
        }
        (phases, None)
    }

    async fn run_phase(
        &self,
        kind: Kind,
        ctx: &mut MergeContext<'_>,
        mode: RunMode,
        options: &ApplyOptions,
    ) -> Result<PhaseReport, MergeError> {
        let products = match kind {
            Kind::Product => Some(match_products(ctx)?),
            _ => None,
        };
        let matches = match &products {
            Some(products) => products.matches.clone(),
            None => match kind {
                Kind::Image => match_images(ctx)?,
                Kind::Category => match_categories(ctx)?,
                _ => match_variations(ctx)?,
            },
        };
        info!(summary = ?matches.summary(), "matched");

        let near_misses = suggest_near_misses(&matches, self.settings.near_miss_threshold);
        for hint in &near_misses {
            warn!(master = %hint.master_index, slave = %hint.slave_index, score = hint.score, "possible rename");
        }

        let updates = match &products {
            Some(products) => merge_products(products, ctx)?,
            None => merge(kind, &matches, ctx)?,
        };
        let membership = products
            .as_ref()
            .map(|p| summarize_memberships(ctx, &p.memberships));
        let conflicts = updates
            .problematic
            .iter()
            .flat_map(SyncUpdate::identity_conflicts)
            .collect();

        let mut report = PhaseReport {
            phase: kind,
            matches: matches.summary(),
            updates: updates.summary(),
            results: ResultsSummary::default(),
            pending_master: 0,
            near_misses,
            membership,
            conflicts,
            failures: Vec::new(),
            halted: None,
        };

        match (mode, &self.transports) {
            (RunMode::Apply, Some(factory)) => {
                let outcome = apply(kind, updates, factory.as_ref(), ctx, options).await;
                report.results = outcome.results.summary();
                report.failures = outcome.results.failures().map(|f| f.report()).collect();
                report.pending_master = outcome.pending_master;
                report.halted = outcome.halted;
            }
            _ => report.pending_master = report.updates.master,
        }
        Ok(report)
    }
}

async fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<RunManifestFile> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(RunManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json_path = reports_dir.join("summary.json");
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&json_path, json)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    let md_path = reports_dir.join("summary.md");
    fs::write(&md_path, render_summary_markdown(summary))
        .await
        .with_context(|| format!("writing {}", md_path.display()))?;

    let manifest = RunManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("summary", reports_dir, &json_path).await?,
            manifest_entry("summary_markdown", reports_dir, &md_path).await?,
        ],
    };
    let manifest_path = reports_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(())
}

/// Operator-facing run summary. Failures come first.
pub fn render_summary_markdown(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Catalog Sync Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Mode: {}", summary.mode.as_str()),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Records: master {}, slave {}", summary.master_records, summary.slave_records),
        String::new(),
    ];

    if let Some(aborted) = &summary.aborted {
        lines.push(format!("## Aborted in {} phase", aborted.phase));
        lines.push(String::new());
        lines.push("```".to_string());
        lines.push(aborted.error.clone());
        lines.push("```".to_string());
        lines.push(String::new());
    }

    let failures = summary
        .phases
        .iter()
        .flat_map(|p| p.failures.iter().map(move |f| (p.phase, f)))
        .collect::<Vec<_>>();
    if !failures.is_empty() {
        lines.push(format!("## Failures ({})", failures.len()));
        lines.push(String::new());
        for (phase, failure) in failures {
            lines.push(format!(
                "- [{phase}] {} {:?}: {} ({})",
                failure.side, failure.action, failure.subject, failure.error
            ));
        }
        lines.push(String::new());
    }

    lines.push("## Phases".to_string());
    lines.push(String::new());
    lines.push("| phase | pure | masterless | slaveless | duplicate | invalid | slave updates | master updates | problematic | new slaves | applied | failed |".to_string());
    lines.push("|---|---|---|---|---|---|---|---|---|---|---|---|".to_string());
    for phase in &summary.phases {
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} |",
            phase.phase,
            phase.matches.globals,
            phase.matches.masterless,
            phase.matches.slaveless,
            phase.matches.duplicate,
            phase.matches.invalid,
            phase.updates.slave,
            phase.updates.master,
            phase.updates.problematic,
            phase.updates.new_slaves,
            phase.results.successes,
            phase.results.fails_master + phase.results.fails_slave,
        ));
    }
    lines.push(String::new());

    let conflicts = summary
        .phases
        .iter()
        .flat_map(|p| p.conflicts.iter().map(move |c| (p.phase, c)))
        .collect::<Vec<_>>();
    if !conflicts.is_empty() {
        lines.push("## Identity Conflicts".to_string());
        lines.push(String::new());
        for (phase, conflict) in conflicts {
            let render = |v: &Option<Value>| {
                v.as_ref().map(|v| v.render()).unwrap_or_else(|| "-".into())
            };
            lines.push(format!(
                "- [{phase}] {}: master {} = `{}`, slave {} = `{}`",
                conflict.handle,
                conflict.master_key.as_deref().unwrap_or("-"),
                render(&conflict.master_value),
                conflict.slave_key.as_deref().unwrap_or("-"),
                render(&conflict.slave_value),
            ));
        }
        lines.push(String::new());
    }

    let hints = summary
        .phases
        .iter()
        .flat_map(|p| p.near_misses.iter().map(move |h| (p.phase, h)))
        .collect::<Vec<_>>();
    if !hints.is_empty() {
        lines.push("## Possible Renames".to_string());
        lines.push(String::new());
        for (phase, hint) in hints {
            lines.push(format!(
                "- [{phase}] `{}` ~ `{}` ({:.3})",
                hint.master_index, hint.slave_index, hint.score
            ));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

pub async fn run_sync_once_from_env(mode: RunMode) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once(mode).await
}

/// Digest of the most recent runs under `<root>/reports`.
pub fn report_runs_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Catalog Sync Reports".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("summary.json");
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        let phases = summary
            .get("phases")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let failures = phases
            .iter()
            .filter_map(|p| p.get("failures").and_then(|f| f.as_array()))
            .map(|f| f.len())
            .sum::<usize>();
        let mode = summary
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- mode: {mode}"));
        lines.push(format!("- phases: {}", phases.len()));
        lines.push(format!("- failures: {failures}"));
        if let Some(error) = summary
            .get("aborted")
            .and_then(|a| a.get("error"))
            .and_then(|e| e.as_str())
        {
            lines.push(format!("- aborted: {}", error.lines().next().unwrap_or_default()));
        }
        lines.push(format!("- summary: `{}`", dir.path().join("summary.md").display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(key: &str, title: &str, sum: &str) -> RecordRef {
        Record::new(Kind::Category, key)
            .with_field(fields::TITLE, title)
            .with_field(fields::FULL_NAME_SUM, sum)
            .into_ref()
    }

    #[test]
    fn rules_file_fills_missing_authorities_from_merge_mode() {
        let yaml = r#"
merge_mode: latest_wins
auto_create_new: true
do_variations: false
handles:
  product:
    - handle: sku
      static: true
    - handle: price
      authority: master_wins
      comparator:
        numeric:
          tolerance: 0.01
"#;
        let rules: SyncRulesFile = serde_yaml::from_str(yaml).unwrap();
        let settings = SyncSettings::from_rules(rules);
        assert!(settings.auto_create_new);
        assert!(!settings.phase_enabled(Kind::Variation));
        assert!(settings.phase_enabled(Kind::Image));

        let product = settings.handles(Kind::Product);
        assert_eq!(product.len(), 2);
        assert_eq!(product[0].authority, Some(Authority::LatestWins));
        assert_eq!(product[1].authority, Some(Authority::MasterWins));
        assert!(settings
            .handles(Kind::Category)
            .iter()
            .all(|h| h.authority == Some(Authority::LatestWins)));
    }

    #[test]
    fn missing_rules_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SyncSettings::load(dir.path()).unwrap();
        assert_eq!(settings.phases.len(), 4);
        assert!(!settings.auto_create_new);
        assert!(settings
            .handles(Kind::Product)
            .iter()
            .any(|h| h.handle == fields::CATEGORY_IDS && !h.writable_on(Side::Master)));
    }

    #[test]
    fn category_duplicates_need_one_name_sum_and_one_slave() {
        let mut same = Match::new("tanning");
        same.push(Side::Master, category("m1", "Tanning", "Tanning"));
        same.push(Side::Master, category("m2", "Tanning", "tanning"));
        same.push(Side::Slave, category("s1", "Tanning", "Tanning"));
        assert_eq!(disambiguate_categories(&same), Resolution::Valid);

        let mut differ = same.clone();
        differ.push(Side::Master, category("m3", "Tanning", "Outdoor > Tanning"));
        assert!(matches!(disambiguate_categories(&differ), Resolution::Invalid(_)));

        let mut two_slaves = Match::new("tanning");
        two_slaves.push(Side::Master, category("m1", "Tanning", "Tanning"));
        two_slaves.push(Side::Slave, category("s1", "Tanning", "Tanning"));
        two_slaves.push(Side::Slave, category("s2", "Tanning", "Tanning"));
        assert!(matches!(disambiguate_categories(&two_slaves), Resolution::Invalid(_)));
    }

    #[test]
    fn attachee_overlap_is_case_insensitive() {
        let m = Record::new(Kind::Image, "m").with_attachees(["sku1"]);
        let s = Record::new(Kind::Image, "s").with_attachees(["SKU1", "SKU9"]);
        let other = Record::new(Kind::Image, "o").with_attachees(["SKU2"]);
        assert!(shares_attachee(&m, &s));
        assert!(!shares_attachee(&m, &other));
    }

    fn summary_with_failure() -> SyncRunSummary {
        SyncRunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            mode: RunMode::Apply,
            master_records: 2,
            slave_records: 1,
            phases: vec![PhaseReport {
                phase: Kind::Product,
                matches: MatchSummary::default(),
                updates: UpdateSummary::default(),
                results: ResultsSummary::default(),
                pending_master: 0,
                near_misses: Vec::new(),
                membership: None,
                conflicts: Vec::new(),
                failures: vec![FailureReport {
                    side: Side::Slave,
                    action: Action::Create,
                    subject: "product master=p2".into(),
                    error: "http status 500".into(),
                    detail: String::new(),
                }],
                halted: None,
            }],
            aborted: None,
            reports_dir: String::new(),
            manifest: String::new(),
        }
    }

    #[test]
    fn markdown_summary_lists_failures_before_phases() {
        let text = render_summary_markdown(&summary_with_failure());
        let failures_at = text.find("## Failures (1)").unwrap();
        let phases_at = text.find("## Phases").unwrap();
        assert!(failures_at < phases_at);
        assert!(text.contains("http status 500"));
    }

    #[tokio::test]
    async fn reports_are_written_with_checksummed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let reports_dir = dir.path().join("reports").join("run");
        let summary = summary_with_failure();
        write_reports(&reports_dir, &summary).await.unwrap();

        let manifest: RunManifest = serde_json::from_str(
            &std::fs::read_to_string(reports_dir.join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.files.len(), 2);
        let bytes = std::fs::read(reports_dir.join("summary.json")).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        assert_eq!(manifest.files[0].sha256, hex::encode(hasher.finalize()));
        assert_eq!(manifest.files[0].path, "summary.json");

        let digest = report_runs_markdown(5, Some(dir.path().to_path_buf())).unwrap();
        assert!(digest.contains("## Run `run`"));
        assert!(digest.contains("- failures: 1"));
    }
}
