use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use kwd_adapters::{ResolveContext, ResolveError, ResolvedBatch, ResolverKind, VolumeResolver};
use kwd_core::{Anchor, CategoryConfig, IntentBucket, KeywordStatus, Lifecycle, VolumeRow};
use kwd_storage::{BackoffPolicy, SimpleTokenBucket, SnapshotStore};
use kwd_sync::catalog::{CategoryCatalog, PipelineSettings};
use kwd_sync::certification::HydrationThresholds;
use kwd_sync::gateway::{GatewayConfig, VolumeGateway};
use kwd_sync::growth::{GrowthEngine, GrowthError, GrowthSettings, LifecyclePolicy, Termination};
use kwd_sync::guard::GuardTables;
use kwd_sync::seeds::SeedTemplates;
use kwd_sync::{CategoryRunStatus, Engine, EngineConfig, StopRegistry, StopSignal};

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn anchor(id: &str, vocabulary: &[&str]) -> Anchor {
    Anchor {
        anchor_id: id.to_string(),
        label: id.to_string(),
        vocabulary: owned(vocabulary),
    }
}

fn shaving() -> CategoryConfig {
    CategoryConfig {
        id: "shaving".into(),
        display_name: "Shaving".into(),
        anchors: vec![anchor("razors", &["razor", "blade"]), anchor("trimmers", &["trimmer"])],
        curated_seeds: owned(&["razor", "trimmer", "gillette razor"]),
        head_terms: owned(&["razor", "trimmer"]),
        brand_packs: owned(&["gillette"]),
        problem_seeds: vec![],
        blocked_terms: vec![],
        benchmark: None,
    }
}

fn beard() -> CategoryConfig {
    CategoryConfig {
        id: "beard".into(),
        display_name: "Beard Care".into(),
        anchors: vec![anchor("oils", &["beard oil"]), anchor("grooming", &["comb"])],
        curated_seeds: owned(&["beard oil", "beard comb"]),
        head_terms: owned(&["beard"]),
        brand_packs: vec![],
        problem_seeds: vec![],
        blocked_terms: vec![],
        benchmark: None,
    }
}

fn curated_only() -> SeedTemplates {
    SeedTemplates {
        brand_head: vec![],
        head_only: vec![],
        ..SeedTemplates::default()
    }
}

fn catalog(categories: Vec<CategoryConfig>) -> CategoryCatalog {
    CategoryCatalog {
        guard: GuardTables::default(),
        seeds: curated_only(),
        categories,
    }
}

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.growth.max_attempts = 3;
    settings.growth.discovery_max_passes = 0;
    settings
}

fn engine_config(root: &Path) -> EngineConfig {
    EngineConfig {
        workspace_root: root.to_path_buf(),
        data_dir: root.join("snapshots"),
        resolver: ResolverKind::Fixture,
        dfs_base_url: "http://127.0.0.1:9".into(),
        credentials: None,
        fixture_path: root.join("unused.json"),
        location_code: 2356,
        language_code: "en".into(),
        http_timeout_secs: 5,
        resolver_interval_ms: 0,
        user_agent: "kwd-test".into(),
        scheduler_enabled: false,
        grow_cron: "0 0 3 * * *".into(),
        web_port: 0,
    }
}

fn row(keyword: &str, volume: u64) -> VolumeRow {
    VolumeRow {
        keyword: keyword.to_string(),
        volume: Some(volume),
        cpc: None,
        competition_index: None,
    }
}

/// Fixed volume table plus per-category scripted misbehaviour.
#[derive(Default)]
struct ScriptedResolver {
    volumes: HashMap<String, u64>,
    max_batch: usize,
    missing_credentials_for: Option<&'static str>,
    panic_for: Option<&'static str>,
    /// Every batch containing this keyword fails transiently.
    flaky_keyword: Option<&'static str>,
    /// Calls that sleep past the gateway timeout before answering.
    stalls: usize,
    stop_hook: Arc<OnceLock<StopRegistry>>,
    stop_for: Option<&'static str>,
    calls: AtomicUsize,
    /// Answer to every discovery call.
    related: Vec<VolumeRow>,
    discover_seeds: Mutex<Vec<Vec<String>>>,
}

impl ScriptedResolver {
    fn with_volumes(pairs: &[(&str, u64)]) -> Self {
        Self {
            volumes: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            max_batch: 100,
            ..Default::default()
        }
    }
}

#[async_trait]
impl VolumeResolver for ScriptedResolver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    async fn resolve_batch(
        &self,
        keywords: &[String],
        ctx: &ResolveContext,
    ) -> Result<ResolvedBatch, ResolveError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_for == Some(ctx.category_id.as_str()) {
            panic!("resolver blew up for {}", ctx.category_id);
        }
        if self.missing_credentials_for == Some(ctx.category_id.as_str()) {
            return Err(ResolveError::MissingCredentials("no login for this tenant".into()));
        }
        if let Some(flaky) = self.flaky_keyword {
            if keywords.iter().any(|k| k == flaky) {
                return Err(ResolveError::Transient("upstream 503".into()));
            }
        }
        if call < self.stalls {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        if self.stop_for == Some(ctx.category_id.as_str()) {
            if let Some(registry) = self.stop_hook.get() {
                registry.stop(&ctx.category_id);
            }
        }
        Ok(ResolvedBatch {
            rows: keywords
                .iter()
                .filter_map(|k| self.volumes.get(k).map(|v| row(k, *v)))
                .collect(),
            incomplete: None,
        })
    }

    async fn discover(
        &self,
        seeds: &[String],
        _ctx: &ResolveContext,
    ) -> Result<Vec<VolumeRow>, ResolveError> {
        self.discover_seeds
            .lock()
            .expect("discover log")
            .push(seeds.to_vec());
        Ok(self.related.clone())
    }
}

fn fast_gateway(resolver: Arc<dyn VolumeResolver>) -> Arc<VolumeGateway> {
    Arc::new(VolumeGateway::new(
        resolver,
        Arc::new(SimpleTokenBucket::new(1, Duration::ZERO)),
        GatewayConfig {
            timeout: Duration::from_millis(100),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            batch_size: None,
        },
    ))
}

fn growth_engine(resolver: Arc<dyn VolumeResolver>, store: SnapshotStore, max_attempts: usize) -> GrowthEngine {
    growth_engine_with(
        resolver,
        store,
        GrowthSettings {
            max_attempts,
            discovery_max_passes: 0,
            ..GrowthSettings::default()
        },
    )
}

fn growth_engine_with(
    resolver: Arc<dyn VolumeResolver>,
    store: SnapshotStore,
    settings: GrowthSettings,
) -> GrowthEngine {
    let catalog = catalog(vec![shaving()]);
    GrowthEngine::new(
        Arc::new(catalog.guard_filter()),
        Arc::new(catalog.seed_generator()),
        fast_gateway(resolver),
        store,
        settings,
        HydrationThresholds::default(),
    )
}

fn ctx(category_id: &str) -> ResolveContext {
    ResolveContext {
        category_id: category_id.to_string(),
        location_code: 2356,
        language_code: "en".into(),
    }
}

fn shaving_volumes() -> ScriptedResolver {
    ScriptedResolver::with_volumes(&[("razor", 1000), ("trimmer", 500), ("gillette razor", 0)])
}

#[tokio::test]
async fn shaving_curated_seeds_resolve_to_valid_and_zero_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(Engine::new(
        engine_config(dir.path()),
        catalog(vec![shaving()]),
        settings(),
        Arc::new(shaving_volumes()),
    ));

    let outcome = engine
        .run_batch(&owned(&["shaving"]), LifecyclePolicy::RefuseCertified)
        .await;
    let report = outcome.report.category("shaving").expect("shaving report");
    assert_eq!(report.status, CategoryRunStatus::Completed);
    assert_eq!(report.termination, Some(Termination::CandidatesExhausted));

    let snapshot = &outcome.snapshots[0];
    let status_of = |kw: &str| {
        snapshot
            .rows
            .iter()
            .find(|r| r.keyword_text == kw)
            .map(|r| r.status)
    };
    assert_eq!(status_of("razor"), Some(KeywordStatus::Valid));
    assert_eq!(status_of("trimmer"), Some(KeywordStatus::Valid));
    assert_eq!(status_of("gillette razor"), Some(KeywordStatus::Zero));
    assert_eq!(snapshot.tallies().valid, 2);

    let texts: HashSet<&str> = snapshot.rows.iter().map(|r| r.keyword_text.as_str()).collect();
    assert_eq!(texts.len(), snapshot.rows.len());

    let w1 = IntentBucket::infer("razor").weight();
    let w2 = IntentBucket::infer("trimmer").weight();
    let metrics = report.metrics.as_ref().expect("metrics");
    let expected = (1000.0 * w1 + 500.0 * w2) / 1_000_000.0;
    assert!((metrics.raw.demand_index.value - expected).abs() < 1e-12);
    assert_eq!(metrics.raw.inputs.keyword_count_validated, 2);
    assert!(metrics.raw.quality.is_partial);

    let stored = engine
        .store()
        .latest("shaving")
        .await
        .expect("latest")
        .expect("snapshot persisted");
    assert_eq!(stored.rows.len(), 3);
}

#[tokio::test]
async fn missing_credentials_fail_one_category_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut resolver = shaving_volumes();
    resolver.volumes.insert("beard oil".into(), 74_000);
    resolver.missing_credentials_for = Some("beard");
    let engine = Arc::new(Engine::new(
        engine_config(dir.path()),
        catalog(vec![shaving(), beard()]),
        settings(),
        Arc::new(resolver),
    ));

    let outcome = engine
        .run_batch(&owned(&["shaving", "beard"]), LifecyclePolicy::RefuseCertified)
        .await;
    let beard = outcome.report.category("beard").expect("beard");
    assert_eq!(beard.status, CategoryRunStatus::Failed);
    assert_eq!(beard.error_code.as_deref(), Some("CREDENTIALS_MISSING"));
    assert_eq!(
        outcome.report.category("shaving").expect("shaving").status,
        CategoryRunStatus::Completed
    );
}

#[tokio::test]
async fn a_panicking_category_task_is_reported_as_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut resolver = shaving_volumes();
    resolver.panic_for = Some("beard");
    let engine = Arc::new(Engine::new(
        engine_config(dir.path()),
        catalog(vec![shaving(), beard()]),
        settings(),
        Arc::new(resolver),
    ));

    let outcome = engine
        .run_batch(&owned(&["beard", "shaving"]), LifecyclePolicy::RefuseCertified)
        .await;
    let beard = outcome.report.category("beard").expect("beard");
    assert_eq!(beard.status, CategoryRunStatus::Failed);
    assert_eq!(beard.error_code.as_deref(), Some("TASK_ABORTED"));
    assert_eq!(
        outcome.report.category("shaving").expect("shaving").status,
        CategoryRunStatus::Completed
    );
}

#[tokio::test]
async fn stopping_one_category_leaves_its_sibling_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hook = Arc::new(OnceLock::new());
    let mut resolver = shaving_volumes();
    resolver.volumes.insert("beard oil".into(), 74_000);
    resolver.stop_for = Some("beard");
    resolver.stop_hook = Arc::clone(&hook);
    let engine = Arc::new(Engine::new(
        engine_config(dir.path()),
        catalog(vec![shaving(), beard()]),
        settings(),
        Arc::new(resolver),
    ));
    hook.set(engine.stops().clone()).expect("hook set once");

    let outcome = engine
        .run_batch(&owned(&["shaving", "beard"]), LifecyclePolicy::RefuseCertified)
        .await;
    let beard = outcome.report.category("beard").expect("beard");
    assert_eq!(beard.status, CategoryRunStatus::Stopped);
    assert_eq!(beard.passes.len(), 1);
    assert_eq!(
        outcome.report.category("shaving").expect("shaving").status,
        CategoryRunStatus::Completed
    );

    let persisted = engine
        .store()
        .latest("beard")
        .await
        .expect("latest")
        .expect("stopped run still persisted");
    assert_eq!(persisted.tallies().valid, 1);
}

#[tokio::test]
async fn lost_batches_leave_rows_unverified() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::new(dir.path());
    let mut resolver = shaving_volumes();
    resolver.max_batch = 1;
    resolver.flaky_keyword = Some("trimmer");
    let engine = growth_engine(Arc::new(resolver), store.clone(), 1);

    let snapshot = store.create_draft(&shaving(), chrono::Utc::now()).await.expect("draft");
    let outcome = engine
        .grow(&shaving(), snapshot, LifecyclePolicy::RefuseCertified, &ctx("shaving"), &StopSignal::default())
        .await
        .expect("grow");

    let trimmer = outcome
        .snapshot
        .rows
        .iter()
        .find(|r| r.keyword_text == "trimmer")
        .expect("trimmer row");
    assert_eq!(trimmer.status, KeywordStatus::Unverified);
    assert_eq!(outcome.passes[0].lost_batches.len(), 1);
    assert_eq!(outcome.snapshot.tallies().valid, 1);
    assert_eq!(outcome.snapshot.tallies().zero, 1);
}

#[tokio::test]
async fn timeouts_then_success_create_no_duplicate_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::new(dir.path());
    let mut resolver = shaving_volumes();
    resolver.stalls = 2;
    let resolver = Arc::new(resolver);
    let engine = growth_engine(resolver.clone(), store.clone(), 1);

    let snapshot = store.create_draft(&shaving(), chrono::Utc::now()).await.expect("draft");
    let outcome = engine
        .grow(&shaving(), snapshot, LifecyclePolicy::RefuseCertified, &ctx("shaving"), &StopSignal::default())
        .await
        .expect("grow");

    assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.passes[0].resolver_calls, 3);
    assert!(outcome.passes[0].lost_batches.is_empty());
    assert_eq!(outcome.snapshot.rows.len(), 3);
    assert_eq!(outcome.snapshot.tallies().valid, 2);
}

#[tokio::test]
async fn discovery_rows_are_guarded_deduplicated_and_stored_with_volumes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::new(dir.path());
    let mut resolver = ScriptedResolver::with_volumes(&[
        ("razor", 1000),
        ("trimmer", 500),
        ("gillette razor", 0),
        ("beard trimmer", 300),
    ]);
    resolver.related = vec![
        row("gillette mach3 razor", 900),
        row("Gillette  Mach3 Razor", 901),
        row("razor", 4),
        row("lipstick for women", 5000),
        VolumeRow {
            keyword: "beard trimmer".into(),
            volume: None,
            cpc: None,
            competition_index: None,
        },
    ];
    let resolver = Arc::new(resolver);
    let engine = growth_engine_with(
        resolver.clone(),
        store.clone(),
        GrowthSettings {
            max_attempts: 1,
            discovery_max_passes: 2,
            ..GrowthSettings::default()
        },
    );

    let snapshot = store.create_draft(&shaving(), chrono::Utc::now()).await.expect("draft");
    let outcome = engine
        .grow(&shaving(), snapshot, LifecyclePolicy::RefuseCertified, &ctx("shaving"), &StopSignal::default())
        .await
        .expect("grow");

    let seeds = resolver.discover_seeds.lock().expect("discover log").clone();
    assert_eq!(seeds.len(), 1);
    assert!(seeds[0].iter().any(|s| s == "razor"));

    let rows = &outcome.snapshot.rows;
    let texts: HashSet<&str> = rows.iter().map(|r| r.keyword_text.as_str()).collect();
    assert_eq!(texts.len(), rows.len());
    assert!(!texts.contains("lipstick for women"));

    let mach3 = rows
        .iter()
        .find(|r| r.keyword_text == "gillette mach3 razor")
        .expect("discovered row stored");
    assert_eq!(mach3.status, KeywordStatus::Valid);
    assert_eq!(mach3.volume, Some(900));
    assert_eq!(mach3.anchor_id, "razors");

    // A curated keyword keeps the resolver's volume, not the discovery echo.
    let razor = rows.iter().find(|r| r.keyword_text == "razor").expect("razor");
    assert_eq!(razor.volume, Some(1000));

    // Discovery rows without a volume go through the resolver like any candidate.
    let beard_trimmer = rows
        .iter()
        .find(|r| r.keyword_text == "beard trimmer")
        .expect("beard trimmer");
    assert_eq!(beard_trimmer.status, KeywordStatus::Valid);
    assert_eq!(beard_trimmer.volume, Some(300));

    let pass = &outcome.passes[0];
    assert_eq!(pass.discovered, 1);
    assert!(pass.rejected >= 1);
}

#[tokio::test]
async fn discovery_stops_after_the_configured_number_of_passes() {
    for max_passes in [0usize, 1, 2] {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let mut resolver = shaving_volumes();
        // "trimmer" never resolves, so every pass has pending work and runs to the end.
        resolver.max_batch = 1;
        resolver.flaky_keyword = Some("trimmer");
        resolver.related = vec![row("gillette mach3 razor", 900)];
        let resolver = Arc::new(resolver);
        let engine = growth_engine_with(
            resolver.clone(),
            store.clone(),
            GrowthSettings {
                max_attempts: 4,
                discovery_max_passes: max_passes,
                ..GrowthSettings::default()
            },
        );

        let snapshot = store.create_draft(&shaving(), chrono::Utc::now()).await.expect("draft");
        let outcome = engine
            .grow(&shaving(), snapshot, LifecyclePolicy::RefuseCertified, &ctx("shaving"), &StopSignal::default())
            .await
            .expect("grow");

        assert_eq!(outcome.passes.len(), 4, "max_passes={max_passes}");
        let calls = resolver.discover_seeds.lock().expect("discover log").len();
        assert_eq!(calls, max_passes, "max_passes={max_passes}");
        let discovered: usize = outcome.passes.iter().map(|p| p.discovered).sum();
        assert_eq!(discovered, usize::from(max_passes > 0));
    }
}

#[tokio::test]
async fn certified_snapshots_need_an_explicit_downgrade() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::new(dir.path());
    let engine = growth_engine(Arc::new(shaving_volumes()), store.clone(), 2);

    let mut snapshot = store.create_draft(&shaving(), chrono::Utc::now()).await.expect("draft");
    snapshot.transition(Lifecycle::CertifiedFull, "test fixture", chrono::Utc::now());

    let refused = engine
        .grow(
            &shaving(),
            snapshot.clone(),
            LifecyclePolicy::RefuseCertified,
            &ctx("shaving"),
            &StopSignal::default(),
        )
        .await;
    assert!(matches!(refused, Err(GrowthError::Certified { .. })));

    let outcome = engine
        .grow(
            &shaving(),
            snapshot,
            LifecyclePolicy::DowngradeAndGrow,
            &ctx("shaving"),
            &StopSignal::default(),
        )
        .await
        .expect("grow after downgrade");
    let downgrade = outcome
        .snapshot
        .lifecycle_log
        .iter()
        .find(|t| t.from == Lifecycle::CertifiedFull)
        .expect("downgrade logged");
    assert_eq!(downgrade.to, Lifecycle::Hydrated);
    assert!(downgrade.reason.contains("downgraded"));
    assert!(!outcome.snapshot.rows.is_empty());
}

#[tokio::test]
async fn workspace_configuration_drives_a_fixture_batch_with_reports() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let catalog = CategoryCatalog::from_workspace_root(&root).expect("categories.yaml");
    let mut settings = PipelineSettings::from_workspace_root(&root).expect("certification.yaml");
    settings.growth.max_attempts = 2;
    let resolver = kwd_adapters::FixtureResolver::from_path(root.join("fixtures/volumes/sample.json"))
        .expect("fixture");

    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(Engine::new(
        engine_config(dir.path()),
        catalog.clone(),
        settings,
        Arc::new(resolver),
    ));
    let outcome = engine
        .run_and_report(&catalog.ids(), LifecyclePolicy::RefuseCertified)
        .await
        .expect("batch");

    assert_eq!(outcome.report.categories.len(), catalog.categories.len());
    for category in &outcome.report.categories {
        assert_eq!(category.status, CategoryRunStatus::Completed, "{}", category.category_id);
        let metrics = category.metrics.as_ref().expect("metrics");
        assert!((1.0..=10.0).contains(&metrics.raw.spread_score.value));
        assert_eq!(metrics.policy, "blend");
    }
    let shaving = outcome.report.category("shaving").expect("shaving");
    assert!(shaving.metrics.as_ref().expect("metrics").raw.inputs.keyword_count_validated > 0);

    let reports_dir = Path::new(outcome.report.reports_dir.as_deref().expect("reports dir")).to_path_buf();
    for file in ["run_summary.json", "demand_brief.md", "keywords.parquet", "metrics.parquet", "manifest.json"] {
        assert!(reports_dir.join(file).exists(), "missing {file}");
    }
    let markdown = kwd_sync::reports::report_markdown(5, Some(dir.path().to_path_buf())).expect("markdown");
    assert!(markdown.contains(&outcome.report.run_id.to_string()));
}
