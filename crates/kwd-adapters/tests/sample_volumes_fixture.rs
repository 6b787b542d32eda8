use kwd_adapters::{
    load_volume_fixture, resolver_for, FixtureResolver, ResolveContext, ResolverKind,
    ResolverSettings, VolumeResolver,
};
use kwd_storage::HttpClientConfig;

fn fixture_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/volumes/sample.json")
}

fn ctx() -> ResolveContext {
    ResolveContext {
        category_id: "shaving".into(),
        location_code: 2356,
        language_code: "en".into(),
    }
}

#[test]
fn sample_fixture_has_unique_keywords_and_discovery_seeds() {
    let fixture = load_volume_fixture(fixture_path()).expect("fixture loads");
    let mut seen = std::collections::HashSet::new();
    for row in &fixture.volumes {
        assert!(seen.insert(row.keyword.clone()), "duplicate {}", row.keyword);
        assert!(row.volume.is_some(), "{} has no volume", row.keyword);
    }
    for seed in ["razor", "beard", "deodorant"] {
        assert!(fixture.discovery.contains_key(seed), "missing discovery seed {seed}");
    }
}

#[tokio::test]
async fn sample_fixture_resolves_the_shaving_seeds() {
    let resolver = FixtureResolver::from_path(fixture_path()).expect("fixture resolver");
    let keywords = vec![
        "razor".to_string(),
        "Trimmer".to_string(),
        "gillette razor".to_string(),
        "moon boots".to_string(),
    ];
    let batch = resolver.resolve_batch(&keywords, &ctx()).await.expect("batch");
    assert!(batch.incomplete.is_none());
    let volume = |kw: &str| batch.rows.iter().find(|r| r.keyword == kw).and_then(|r| r.volume);
    assert_eq!(volume("razor"), Some(1000));
    assert_eq!(volume("trimmer"), Some(500));
    assert_eq!(volume("gillette razor"), Some(0));
    assert_eq!(batch.rows.len(), 3);
}

#[tokio::test]
async fn sample_fixture_discovery_marks_unknown_volumes() {
    let resolver = FixtureResolver::from_path(fixture_path()).expect("fixture resolver");
    let rows = resolver
        .discover(&["razor".to_string()], &ctx())
        .await
        .expect("discover");
    assert_eq!(rows.len(), 3);
    let known = rows
        .iter()
        .find(|r| r.keyword == "bombay shaving company razor")
        .expect("known discovery row");
    assert_eq!(known.volume, Some(1600));
    let unknown = rows
        .iter()
        .find(|r| r.keyword == "razor for sensitive skin")
        .expect("unknown discovery row");
    assert_eq!(unknown.volume, None);
}

#[test]
fn resolver_factory_builds_the_fixture_resolver() {
    let settings = ResolverSettings {
        kind: ResolverKind::Fixture,
        base_url: "http://127.0.0.1:9".into(),
        credentials: None,
        fixture_path: fixture_path(),
        http: HttpClientConfig::default(),
    };
    let resolver = resolver_for(&settings).expect("resolver");
    assert_eq!(resolver.name(), "fixture");
}
