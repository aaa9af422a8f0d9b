use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csync_core::{fields, Authority, Catalog, Comparator, Fields, Kind, Record, RecordRef, Side, SyncHandle, Value};
use csync_sync::{
    apply, match_categories, match_images, match_products, merge, merge_products, ApplyHalt, ApplyOptions,
    MergeContext, MergeError, RunMode, SyncConfig, SyncPipeline, SyncSettings,
};
use csync_transport::{
    Operation, RecordingTransport, Transport, TransportError, TransportMap, TransportResponse,
};
use csync_update::{ApplyError, Reason};

fn catalog(side: Side, records: Vec<RecordRef>) -> Catalog {
    let mut catalog = Catalog::new(side);
    for record in records {
        catalog.insert(record).unwrap();
    }
    catalog
}

fn product(key: &str, sku: &str, price: f64) -> Record {
    Record::new(Kind::Product, key)
        .with_field(fields::SKU, sku)
        .with_field("price", price)
}

fn category(key: &str, title: &str, sum: &str) -> Record {
    Record::new(Kind::Category, key)
        .with_field(fields::TITLE, title)
        .with_field(fields::FULL_NAME_SUM, sum)
}

fn price_handles() -> Vec<SyncHandle> {
    vec![
        SyncHandle::new(fields::SKU).static_field(),
        SyncHandle::new("price").comparator(Comparator::Numeric { tolerance: 0.001 }),
    ]
}

fn settings(kind: Kind, handles: Option<Vec<SyncHandle>>, auto_create: bool) -> SyncSettings {
    let mut settings = SyncSettings::default();
    if let Some(handles) = handles {
        settings.handles.insert(kind, handles);
    }
    settings.auto_create_new = auto_create;
    settings
}

fn slave_route(kind: Kind, transport: &Arc<RecordingTransport>) -> TransportMap {
    let transport: Arc<dyn Transport> = transport.clone();
    TransportMap::new().with(Side::Slave, kind, transport)
}

fn at(stamp: &str) -> DateTime<Utc> {
    stamp.parse().unwrap()
}

#[tokio::test]
async fn price_difference_becomes_a_slave_upload() {
    let master = catalog(Side::Master, vec![product("m-1", "TT-001", 10.0).into_ref()]);
    let slave = catalog(
        Side::Slave,
        vec![product("s-1", "TT-001", 9.0).with_remote_id("7").into_ref()],
    );
    let settings = settings(Kind::Product, Some(price_handles()), false);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let products = match_products(&ctx).unwrap();
    assert_eq!(products.matches.globals.len(), 1);
    let updates = merge_products(&products, &mut ctx).unwrap();
    assert_eq!(updates.slave.len(), 1);
    assert!(updates.master.is_empty());

    let update = &updates.slave[0];
    let price = update
        .deltas()
        .unwrap()
        .iter()
        .find(|d| d.handle == "price")
        .unwrap();
    assert_eq!(price.reason, Reason::Updating);
    let mut expected = Fields::new();
    expected.insert("price".to_string(), Value::Number(10.0));
    assert_eq!(update.get_slave_updates().unwrap(), expected);

    let transport = Arc::new(RecordingTransport::new("memory://products", 1));
    let routes = slave_route(Kind::Product, &transport);
    let outcome = apply(Kind::Product, updates, &routes, &ctx, &ApplyOptions::default()).await;
    assert!(outcome.halted.is_none());
    assert_eq!(outcome.results.successes.len(), 1);

    let calls = transport.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].operation, Operation::Upload);
    assert_eq!(calls[0].pkey.as_deref(), Some("7"));
    assert_eq!(calls[0].payload, expected);
}

#[tokio::test]
async fn identical_category_twins_merge_into_one_update() {
    let master = catalog(
        Side::Master,
        vec![
            category("m1", "Tanning", "Tanning")
                .with_field("description", "Sun care")
                .into_ref(),
            category("m2", "Tanning", "Tanning")
                .with_field("description", "Sun care")
                .into_ref(),
        ],
    );
    let slave = catalog(
        Side::Slave,
        vec![category("s1", "Tanning", "Tanning")
            .with_field("description", "Old copy")
            .with_remote_id("55")
            .into_ref()],
    );
    let settings = settings(Kind::Category, None, true);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let matches = match_categories(&ctx).unwrap();
    assert_eq!(matches.valid.len(), 1);
    assert!(matches.invalid.is_empty());

    let updates = merge(Kind::Category, &matches, &mut ctx).unwrap();
    assert_eq!(updates.slave.len(), 1);
    assert!(updates.new_slaves.is_empty());
    assert_eq!(ctx.master_remote_id(Kind::Category, "m1").as_deref(), Some("55"));
    assert_eq!(ctx.master_remote_id(Kind::Category, "m2").as_deref(), Some("55"));

    let transport = Arc::new(RecordingTransport::new("memory://categories", 1));
    let routes = slave_route(Kind::Category, &transport);
    let outcome = apply(Kind::Category, updates, &routes, &ctx, &ApplyOptions::default()).await;
    assert_eq!(outcome.results.successes.len(), 1);

    let calls = transport.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].pkey.as_deref(), Some("55"));
    assert_eq!(
        calls[0].payload.get("description"),
        Some(&Value::text("Sun care"))
    );
}

#[test]
fn diverging_category_twins_abort_the_phase() {
    let master = catalog(
        Side::Master,
        vec![
            category("m1", "Tanning", "Tanning").into_ref(),
            category("m2", "Tanning", "Outdoor > Tanning").into_ref(),
        ],
    );
    let slave = catalog(
        Side::Slave,
        vec![category("s1", "Tanning", "Tanning").with_remote_id("55").into_ref()],
    );
    let settings = SyncSettings::default();
    let ctx = MergeContext::new(&master, &slave, &settings);

    match match_categories(&ctx) {
        Err(MergeError::InvalidCategories { indices, detail }) => {
            assert_eq!(indices, vec!["tanning".to_string()]);
            assert!(detail.contains("category:m1"));
            assert!(detail.contains("category:m2"));
        }
        other => panic!("expected invalid categories, got {other:?}"),
    }
}

#[test]
fn same_file_name_on_unrelated_owners_stays_apart() {
    let master = catalog(
        Side::Master,
        vec![Record::new(Kind::Image, "mi")
            .with_field(fields::FILE_NAME, "a.jpg")
            .with_attachees(["SKU1"])
            .into_ref()],
    );
    let slave = catalog(
        Side::Slave,
        vec![Record::new(Kind::Image, "si")
            .with_field(fields::FILE_NAME, "a.jpg")
            .with_attachees(["SKU2"])
            .with_remote_id("900")
            .into_ref()],
    );
    let settings = SyncSettings::default();
    let ctx = MergeContext::new(&master, &slave, &settings);

    let matches = match_images(&ctx).unwrap();
    assert!(matches.globals.is_empty());
    assert!(matches.duplicate.is_empty());
    assert_eq!(matches.masterless.len(), 1);
    assert_eq!(matches.slaveless.len(), 1);
}

#[test]
fn unattached_images_are_left_out_of_the_image_phase() {
    let master = catalog(
        Side::Master,
        vec![
            Record::new(Kind::Image, "loose")
                .with_field(fields::FILE_NAME, "loose.jpg")
                .into_ref(),
            Record::new(Kind::Image, "owned")
                .with_field(fields::FILE_NAME, "owned.jpg")
                .with_attachees(["SKU1"])
                .into_ref(),
        ],
    );
    let slave = catalog(Side::Slave, Vec::new());
    let settings = SyncSettings::default();
    let ctx = MergeContext::new(&master, &slave, &settings);

    let matches = match_images(&ctx).unwrap();
    assert_eq!(matches.slaveless.len(), 1);
    assert!(matches.slaveless.contains_key("owned.jpg"));
}

fn owned_image(key: &str, file: &str, owner: &str) -> RecordRef {
    Record::new(Kind::Image, key)
        .with_field(fields::FILE_NAME, file)
        .with_attachees([owner])
        .into_ref()
}

#[test]
fn colliding_file_names_pair_up_by_attachee_sku() {
    let master = catalog(
        Side::Master,
        vec![owned_image("mi1", "a.jpg", "SKU1"), owned_image("mi2", "a.jpg", "SKU2")],
    );
    let slave = catalog(
        Side::Slave,
        vec![owned_image("si1", "a.jpg", "SKU2"), owned_image("si2", "a.jpg", "SKU1")],
    );
    let settings = SyncSettings::default();
    let ctx = MergeContext::new(&master, &slave, &settings);

    let matches = match_images(&ctx).unwrap();
    assert_eq!(matches.globals.len(), 2);
    assert!(matches.globals.contains_key("attachee_sku:SKU1"));
    assert!(matches.masterless.is_empty());
    assert!(matches.slaveless.is_empty());
}

#[test]
fn collision_with_an_unpaired_leftover_is_an_integrity_error() {
    let master = catalog(
        Side::Master,
        vec![owned_image("mi1", "a.jpg", "SKU1"), owned_image("mi2", "a.jpg", "SKU2")],
    );
    let slave = catalog(Side::Slave, vec![owned_image("si1", "a.jpg", "SKU1")]);
    let settings = SyncSettings::default();
    let ctx = MergeContext::new(&master, &slave, &settings);

    match match_images(&ctx) {
        Err(MergeError::ImageIntegrity { indices, detail }) => {
            assert_eq!(indices, vec!["a.jpg".to_string()]);
            assert!(detail.contains("image:mi2"));
        }
        other => panic!("expected an image integrity error, got {other:?}"),
    }
}

#[test]
fn collision_on_unrelated_owners_is_an_integrity_error() {
    let master = catalog(
        Side::Master,
        vec![owned_image("mi1", "a.jpg", "SKU1"), owned_image("mi2", "a.jpg", "SKU3")],
    );
    let slave = catalog(
        Side::Slave,
        vec![owned_image("si1", "a.jpg", "SKU2"), owned_image("si2", "a.jpg", "SKU4")],
    );
    let settings = SyncSettings::default();
    let ctx = MergeContext::new(&master, &slave, &settings);

    match match_images(&ctx) {
        Err(MergeError::ImageIntegrity { indices, .. }) => {
            assert_eq!(indices, vec!["a.jpg".to_string()]);
        }
        other => panic!("expected an image integrity error, got {other:?}"),
    }
}

#[tokio::test]
async fn child_category_waits_for_its_parent() {
    let master = catalog(
        Side::Master,
        vec![
            category("c", "Tanning", "Tanning").into_ref(),
            category("d", "Accessories", "Tanning > Accessories")
                .with_parent("c")
                .into_ref(),
        ],
    );
    let slave = catalog(Side::Slave, Vec::new());
    let settings = settings(Kind::Category, None, true);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let matches = match_categories(&ctx).unwrap();
    let updates = merge(Kind::Category, &matches, &mut ctx).unwrap();
    assert_eq!(updates.new_slaves.len(), 2);

    let transport = Arc::new(RecordingTransport::new("memory://categories", 100));
    let routes = slave_route(Kind::Category, &transport);
    let outcome = apply(Kind::Category, updates, &routes, &ctx, &ApplyOptions::default()).await;
    assert!(outcome.halted.is_none());
    assert_eq!(outcome.results.successes.len(), 2);

    let calls = transport.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].payload.get("name"), Some(&Value::text("Tanning")));
    assert_eq!(calls[0].assigned_id.as_deref(), Some("100"));
    assert_eq!(calls[1].payload.get("name"), Some(&Value::text("Accessories")));
    assert_eq!(
        calls[1].payload.get(fields::PARENT_ID),
        Some(&Value::text("100"))
    );
    assert_eq!(master.categories.get("d").unwrap().remote_id(), Some("101"));
}

#[tokio::test]
async fn category_parent_cycle_halts_without_calls() {
    let master = catalog(
        Side::Master,
        vec![
            category("a", "Alpha", "Alpha").with_parent("b").into_ref(),
            category("b", "Beta", "Beta").with_parent("a").into_ref(),
        ],
    );
    let slave = catalog(Side::Slave, Vec::new());
    let settings = settings(Kind::Category, None, true);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let matches = match_categories(&ctx).unwrap();
    let updates = merge(Kind::Category, &matches, &mut ctx).unwrap();
    let transport = Arc::new(RecordingTransport::new("memory://categories", 1));
    let routes = slave_route(Kind::Category, &transport);
    let outcome = apply(Kind::Category, updates, &routes, &ctx, &ApplyOptions::default()).await;

    assert_eq!(
        outcome.halted,
        Some(ApplyHalt::DependencyCycle {
            pending: vec!["a".to_string(), "b".to_string()]
        })
    );
    assert!(transport.calls().await.is_empty());
}

#[test]
fn creates_are_skipped_without_auto_create() {
    let master = catalog(Side::Master, vec![product("p1", "P1", 5.0).into_ref()]);
    let slave = catalog(Side::Slave, Vec::new());
    let settings = settings(Kind::Product, None, false);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let products = match_products(&ctx).unwrap();
    let updates = merge_products(&products, &mut ctx).unwrap();
    assert!(updates.new_slaves.is_empty());
    assert!(updates.is_empty());
}

#[tokio::test]
async fn one_failed_create_does_not_stop_the_others() {
    let master = catalog(
        Side::Master,
        vec![
            product("p1", "P1", 5.0).into_ref(),
            product("p2", "P2", 6.0).into_ref(),
        ],
    );
    let slave = catalog(Side::Slave, Vec::new());
    let settings = settings(Kind::Product, None, true);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let products = match_products(&ctx).unwrap();
    let updates = merge_products(&products, &mut ctx).unwrap();
    assert_eq!(updates.new_slaves.len(), 2);

    let transport = Arc::new(RecordingTransport::new("memory://products", 500).failing_on("P2"));
    let routes = slave_route(Kind::Product, &transport);
    let outcome = apply(Kind::Product, updates, &routes, &ctx, &ApplyOptions::default()).await;

    assert!(outcome.halted.is_none());
    assert_eq!(outcome.results.successes.len(), 1);
    assert_eq!(outcome.results.fails_slave.len(), 1);
    assert!(matches!(
        outcome.results.fails_slave[0].error,
        ApplyError::Transport { .. }
    ));
    assert_eq!(master.products.get("p1").unwrap().remote_id(), Some("500"));
    assert_eq!(master.products.get("p2").unwrap().remote_id(), None);

    let calls = transport.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload.get(fields::SKU), Some(&Value::text("P1")));
    assert_eq!(calls[0].payload.get("regular_price"), Some(&Value::Number(5.0)));
}

fn membership_handles() -> Vec<SyncHandle> {
    let mut handles = price_handles();
    handles.push(
        SyncHandle::new(fields::CATEGORY_IDS)
            .comparator(Comparator::Set)
            .column(Side::Master, None, false),
    );
    handles
}

#[tokio::test]
async fn title_paired_membership_is_kept_without_the_category_phase() {
    let master = catalog(
        Side::Master,
        vec![
            category("mc", "Tanning", "Tanning").into_ref(),
            product("m-1", "TT-001", 10.0).with_categories(["mc"]).into_ref(),
        ],
    );
    let slave = catalog(
        Side::Slave,
        vec![
            category("11", "Tanning", "Tanning").with_remote_id("11").into_ref(),
            product("s-1", "TT-001", 9.0)
                .with_categories(["11"])
                .with_remote_id("7")
                .into_ref(),
        ],
    );
    let settings = settings(Kind::Product, Some(membership_handles()), false);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let products = match_products(&ctx).unwrap();
    let membership = products.memberships.values().next().unwrap();
    assert_eq!(membership.globals.len(), 1);
    let updates = merge_products(&products, &mut ctx).unwrap();
    assert_eq!(updates.slave.len(), 1);
    assert!(updates.master.is_empty());

    let transport = Arc::new(RecordingTransport::new("memory://products", 1));
    let routes = slave_route(Kind::Product, &transport);
    let outcome = apply(Kind::Product, updates, &routes, &ctx, &ApplyOptions::default()).await;
    assert!(outcome.halted.is_none());

    let calls = transport.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload.get(fields::CATEGORY_IDS), None);
    assert_eq!(calls[0].payload.get("price"), Some(&Value::Number(10.0)));
}

#[tokio::test]
async fn membership_change_uploads_with_the_price() {
    let master = catalog(
        Side::Master,
        vec![
            category("ma", "Tanning", "Tanning").into_ref(),
            category("mb", "Hats", "Hats").with_remote_id("12").into_ref(),
            product("m-1", "TT-001", 10.0)
                .with_categories(["ma", "mb"])
                .into_ref(),
        ],
    );
    let slave = catalog(
        Side::Slave,
        vec![
            category("11", "Tanning", "Tanning").with_remote_id("11").into_ref(),
            category("12", "Hats", "Hats").with_remote_id("12").into_ref(),
            category("13", "Towels", "Towels").with_remote_id("13").into_ref(),
            product("s-1", "TT-001", 9.0)
                .with_categories(["11", "13"])
                .with_remote_id("7")
                .into_ref(),
        ],
    );
    let settings = settings(Kind::Product, Some(membership_handles()), false);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let products = match_products(&ctx).unwrap();
    let membership = products.memberships.values().next().unwrap();
    assert_eq!(membership.globals.len(), 1);
    assert_eq!(membership.slaveless.len(), 1);
    assert_eq!(membership.masterless.len(), 1);

    let updates = merge_products(&products, &mut ctx).unwrap();
    assert_eq!(updates.slave.len(), 1);
    assert!(updates.new_slaves.is_empty());

    let transport = Arc::new(RecordingTransport::new("memory://products", 1));
    let routes = slave_route(Kind::Product, &transport);
    let outcome = apply(Kind::Product, updates, &routes, &ctx, &ApplyOptions::default()).await;
    assert_eq!(outcome.results.successes.len(), 1);

    let mut expected = Fields::new();
    expected.insert("price".to_string(), Value::Number(10.0));
    expected.insert(
        fields::CATEGORY_IDS.to_string(),
        Value::List(vec!["11".to_string(), "12".to_string()]),
    );
    let calls = transport.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].operation, Operation::Upload);
    assert_eq!(calls[0].pkey.as_deref(), Some("7"));
    assert_eq!(calls[0].payload, expected);
}

#[tokio::test]
async fn missing_slave_transport_halts_the_phase() {
    let master = catalog(Side::Master, vec![product("m-1", "TT-001", 10.0).into_ref()]);
    let slave = catalog(
        Side::Slave,
        vec![product("s-1", "TT-001", 9.0).with_remote_id("7").into_ref()],
    );
    let settings = settings(Kind::Product, Some(price_handles()), false);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let products = match_products(&ctx).unwrap();
    let updates = merge_products(&products, &mut ctx).unwrap();
    let outcome = apply(
        Kind::Product,
        updates,
        &TransportMap::new(),
        &ctx,
        &ApplyOptions::default(),
    )
    .await;
    assert_eq!(
        outcome.halted,
        Some(ApplyHalt::TransportUnavailable {
            side: Side::Slave,
            kind: Kind::Product
        })
    );
}

#[tokio::test]
async fn newer_slave_value_flows_back_to_master() {
    let master = catalog(
        Side::Master,
        vec![product("m-1", "TT-001", 10.0)
            .with_modified(at("2024-01-01T00:00:00Z"))
            .into_ref()],
    );
    let slave = catalog(
        Side::Slave,
        vec![product("s-1", "TT-001", 12.0)
            .with_modified(at("2024-06-01T00:00:00Z"))
            .with_remote_id("7")
            .into_ref()],
    );
    let handles = vec![
        SyncHandle::new(fields::SKU).static_field(),
        SyncHandle::new("price")
            .comparator(Comparator::Numeric { tolerance: 0.001 })
            .authority(Authority::LatestWins),
    ];
    let settings = settings(Kind::Product, Some(handles), false);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let products = match_products(&ctx).unwrap();
    let updates = merge_products(&products, &mut ctx).unwrap();
    assert_eq!(updates.master.len(), 1);
    assert!(updates.slave.is_empty());

    let slave_only = Arc::new(RecordingTransport::new("memory://products", 1));
    let routes = slave_route(Kind::Product, &slave_only);
    let outcome = apply(
        Kind::Product,
        updates.clone(),
        &routes,
        &ctx,
        &ApplyOptions::default(),
    )
    .await;
    assert_eq!(outcome.pending_master, 1);
    assert!(outcome.results.successes.is_empty());

    let master_side = Arc::new(RecordingTransport::new("memory://master", 1));
    let master_route: Arc<dyn Transport> = master_side.clone();
    let routes = routes.with(Side::Master, Kind::Product, master_route);
    let outcome = apply(Kind::Product, updates, &routes, &ctx, &ApplyOptions::default()).await;
    assert_eq!(outcome.pending_master, 0);
    assert_eq!(outcome.results.successes.len(), 1);

    let calls = master_side.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].pkey.as_deref(), Some("m-1"));
    assert_eq!(calls[0].payload.get("price"), Some(&Value::Number(12.0)));
}

/// Raises the interrupt flag on its first call.
struct TrippingTransport {
    inner: RecordingTransport,
    flag: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for TrippingTransport {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn create_item(&self, core_data: &Fields) -> Result<TransportResponse, TransportError> {
        self.flag.store(true, Ordering::SeqCst);
        self.inner.create_item(core_data).await
    }

    async fn upload_changes(
        &self,
        pkey: &str,
        changes: &Fields,
    ) -> Result<TransportResponse, TransportError> {
        self.flag.store(true, Ordering::SeqCst);
        self.inner.upload_changes(pkey, changes).await
    }

    async fn delete_item(&self, pkey: &str) -> Result<TransportResponse, TransportError> {
        self.inner.delete_item(pkey).await
    }
}

#[tokio::test]
async fn interrupt_stops_before_the_next_update() {
    let master = catalog(
        Side::Master,
        vec![
            product("m-1", "P1", 10.0).into_ref(),
            product("m-2", "P2", 20.0).into_ref(),
        ],
    );
    let slave = catalog(
        Side::Slave,
        vec![
            product("s-1", "P1", 9.0).with_remote_id("7").into_ref(),
            product("s-2", "P2", 19.0).with_remote_id("8").into_ref(),
        ],
    );
    let settings = settings(Kind::Product, Some(price_handles()), false);
    let mut ctx = MergeContext::new(&master, &slave, &settings);

    let products = match_products(&ctx).unwrap();
    let updates = merge_products(&products, &mut ctx).unwrap();
    assert_eq!(updates.slave.len(), 2);

    let options = ApplyOptions::default();
    let tripping: Arc<dyn Transport> = Arc::new(TrippingTransport {
        inner: RecordingTransport::new("memory://products", 1),
        flag: Arc::clone(&options.interrupt),
    });
    let routes = TransportMap::new().with(Side::Slave, Kind::Product, tripping);
    let outcome = apply(Kind::Product, updates, &routes, &ctx, &options).await;

    assert_eq!(outcome.halted, Some(ApplyHalt::Interrupted));
    assert_eq!(outcome.results.successes.len(), 1);
    assert_eq!(outcome.results.successes[0].remote_id.as_deref(), Some("7"));
}

const MASTER_BUNDLE: &str = r#"{
  "side": "master",
  "records": [
    {"type": "category", "key": "c1", "fields": {"title": "Tanning"}},
    {"type": "product", "key": "p1", "fields": {"sku": "TT-001", "title": "Bronzer", "price": 10}, "categories": ["c1"]}
  ]
}"#;

const SLAVE_BUNDLE: &str = r#"{
  "side": "slave",
  "records": [
    {"type": "category", "key": "31", "remote_id": "31", "fields": {"title": "Tanning"}},
    {"type": "product", "key": "7", "remote_id": "7", "fields": {"sku": "TT-001", "title": "Bronzer", "price": 9}, "categories": ["31"]}
  ]
}"#;

fn workspace(master: &str, slave: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("master.json"), master).unwrap();
    std::fs::write(dir.path().join("slave.json"), slave).unwrap();
    dir
}

#[tokio::test]
async fn pipeline_applies_and_writes_reports() {
    let dir = workspace(MASTER_BUNDLE, SLAVE_BUNDLE);
    let products = Arc::new(RecordingTransport::new("memory://products", 1));
    let routes = slave_route(Kind::Product, &products);

    let pipeline = SyncPipeline::new(SyncConfig::for_workspace(dir.path()))
        .unwrap()
        .with_transports(Arc::new(routes));
    let summary = pipeline.run_once(RunMode::Apply).await.unwrap();

    assert!(summary.aborted.is_none());
    assert_eq!(summary.mode, RunMode::Apply);
    assert_eq!(summary.phases.len(), 4);
    let product_phase = summary.phase(Kind::Product).unwrap();
    assert_eq!(product_phase.results.successes, 1);
    assert_eq!(summary.failure_count(), 0);
    let membership = product_phase.membership.as_ref().unwrap();
    assert_eq!(membership.products, 1);
    assert_eq!(membership.added, 0);

    let calls = products.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].pkey.as_deref(), Some("7"));
    let mut expected = Fields::new();
    expected.insert("regular_price".to_string(), Value::Number(10.0));
    assert_eq!(calls[0].payload, expected);

    let reports = std::path::PathBuf::from(&summary.reports_dir);
    assert!(reports.join("summary.json").exists());
    assert!(reports.join("summary.md").exists());
    assert!(reports.join("manifest.json").exists());
}

#[tokio::test]
async fn plan_mode_never_calls_the_transport() {
    let dir = workspace(MASTER_BUNDLE, SLAVE_BUNDLE);
    let products = Arc::new(RecordingTransport::new("memory://products", 1));
    let pipeline = SyncPipeline::new(SyncConfig::for_workspace(dir.path()))
        .unwrap()
        .with_transports(Arc::new(slave_route(Kind::Product, &products)));

    let summary = pipeline.run_once(RunMode::Plan).await.unwrap();
    assert_eq!(summary.mode, RunMode::Plan);
    assert_eq!(summary.phase(Kind::Product).unwrap().updates.slave, 1);
    assert!(products.calls().await.is_empty());
}

#[tokio::test]
async fn invalid_categories_abort_the_run_and_are_reported() {
    let master = r#"{
  "side": "master",
  "records": [
    {"type": "category", "key": "outdoor", "fields": {"title": "Outdoor"}},
    {"type": "category", "key": "m1", "fields": {"title": "Tanning"}},
    {"type": "category", "key": "m2", "fields": {"title": "Tanning"}, "parent": "outdoor"}
  ]
}"#;
    let slave = r#"{
  "side": "slave",
  "records": [
    {"type": "category", "key": "55", "remote_id": "55", "fields": {"title": "Tanning"}}
  ]
}"#;
    let dir = workspace(master, slave);
    let pipeline = SyncPipeline::new(SyncConfig::for_workspace(dir.path())).unwrap();
    let summary = pipeline.run_once(RunMode::Plan).await.unwrap();

    let aborted = summary.aborted.as_ref().unwrap();
    assert_eq!(aborted.phase, Kind::Category);
    assert!(aborted.error.contains("invalid category matches"));
    assert!(summary.phase(Kind::Product).is_none());

    let markdown =
        std::fs::read_to_string(std::path::Path::new(&summary.reports_dir).join("summary.md"))
            .unwrap();
    assert!(markdown.contains("## Aborted in category phase"));
}
