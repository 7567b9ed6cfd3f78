//! Granule ingest integration tests
//!
//! Covers checksum verification (embedded and sidecar), duplicate handling
//! against already-staged objects, and the lock-guarded sync over HTTP.

mod helpers;

use granary_common::types::{ChecksumType, DuplicateHandling};
use granary_ingest::config::LockConfig;
use granary_ingest::lock::{InMemoryLeases, ResourceLock};
use granary_ingest::models::{DiscoveredFile, GranuleManifest, Protocol, Provider};
use granary_ingest::protocol::ProtocolContext;
use granary_ingest::{GranuleIngester, GranuleSync, InMemoryObjectStore, ObjectStore};
use helpers::{cksum, init_tracing, mod09gq, provider, MockProvider};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

const DIR: &str = "/MODOPS/MOD09GQ";
const STAGING: &str = "granary-internal";
const ID: &str = "MOD09GQ.A2017025.h21v00.006.2017034065104";

fn hdf() -> String {
    format!("{}.hdf", ID)
}

fn staged_key(name: &str) -> String {
    format!("file-staging/MOD09GQ___006/{}", name)
}

fn manifest(files: Vec<DiscoveredFile>) -> GranuleManifest {
    GranuleManifest {
        granule_id: ID.to_string(),
        data_type: "MOD09GQ".to_string(),
        version: "006".to_string(),
        files,
    }
}

fn ingester(store: Arc<InMemoryObjectStore>) -> GranuleIngester {
    GranuleIngester::new(store, "file-staging")
}

// ============================================================================
// Checksums
// ============================================================================

#[tokio::test]
async fn test_cksum_round_trip() {
    init_tracing();
    let body = b"123456789".to_vec();
    assert_eq!(cksum(&body), "930766865");

    let mut mock = MockProvider::new().with_file(DIR, &hdf(), body.clone());
    let store = Arc::new(InMemoryObjectStore::new());
    let manifest = manifest(vec![DiscoveredFile::new(hdf(), DIR)
        .with_size(9)
        .with_checksum(ChecksumType::Cksum, "930766865")]);

    let granule = ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &mod09gq(), STAGING, None)
        .await
        .unwrap();

    let file = &granule.files[0];
    assert_eq!(file.size, 9);
    assert_eq!(file.checksum_type, Some(ChecksumType::Cksum));
    assert_eq!(file.checksum_value.as_deref(), Some("930766865"));
    assert_eq!(file.filename, format!("s3://{}/{}", STAGING, staged_key(&hdf())));
    assert_eq!(file.url_path.as_deref(), Some("{collection.name}___{collection.version}"));
    assert_eq!(store.get(STAGING, &staged_key(&hdf())).await.unwrap(), body);
}

#[tokio::test]
async fn test_unchecked_file_records_computed_cksum() {
    let body = b"hello world\n".to_vec();
    let mut mock = MockProvider::new().with_file(DIR, &hdf(), body.clone());
    let store = Arc::new(InMemoryObjectStore::new());
    let manifest = manifest(vec![DiscoveredFile::new(hdf(), DIR)]);

    let granule = ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &mod09gq(), STAGING, None)
        .await
        .unwrap();

    let file = &granule.files[0];
    assert_eq!(file.checksum_type, Some(ChecksumType::Cksum));
    assert_eq!(file.checksum_value.as_deref(), Some("3733384285"));
    assert_eq!(file.checksum_value.as_deref(), Some(cksum(&body).as_str()));
    assert_eq!(file.size, 12);
}

#[tokio::test]
async fn test_cksum_mismatch_stages_nothing() {
    init_tracing();
    let mut mock = MockProvider::new()
        .with_file(DIR, &hdf(), "123456789")
        .with_file(DIR, &format!("{}.met", hdf()), "met");
    let store = Arc::new(InMemoryObjectStore::new());
    let manifest = manifest(vec![
        DiscoveredFile::new(hdf(), DIR).with_checksum(ChecksumType::Cksum, "1"),
        DiscoveredFile::new(format!("{}.met", hdf()), DIR),
    ]);

    let err = ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &mod09gq(), STAGING, None)
        .await
        .unwrap_err();

    assert_eq!(err.name(), "InvalidChecksumError");
    assert!(!err.is_retryable());
    assert!(store.keys(STAGING).is_empty());
}

#[tokio::test]
async fn test_sidecar_checksum_is_used_and_not_staged() {
    let mut mock = MockProvider::new()
        .with_file(DIR, &hdf(), "hello")
        .with_file(DIR, &format!("{}.md5", hdf()), "5d41402abc4b2a76b9719d911017c592  granule.hdf\n");
    let store = Arc::new(InMemoryObjectStore::new());
    let manifest = manifest(vec![
        DiscoveredFile::new(hdf(), DIR),
        DiscoveredFile::new(format!("{}.md5", hdf()), DIR),
    ]);

    let granule = ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &mod09gq(), STAGING, None)
        .await
        .unwrap();

    assert_eq!(granule.files.len(), 1);
    assert_eq!(granule.files[0].checksum_type, Some(ChecksumType::Md5));
    assert_eq!(granule.files[0].checksum_value.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
    assert_eq!(store.keys(STAGING), vec![staged_key(&hdf())]);
}

#[tokio::test]
async fn test_bad_sidecar_checksum_rejected() {
    let mut mock = MockProvider::new()
        .with_file(DIR, &hdf(), "hello")
        .with_file(DIR, &format!("{}.md5", hdf()), "00000000000000000000000000000000");
    let store = Arc::new(InMemoryObjectStore::new());
    let manifest = manifest(vec![
        DiscoveredFile::new(hdf(), DIR),
        DiscoveredFile::new(format!("{}.md5", hdf()), DIR),
    ]);

    let err = ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &mod09gq(), STAGING, None)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "InvalidChecksumError");
    assert!(store.keys(STAGING).is_empty());
}

// ============================================================================
// Duplicate handling
// ============================================================================

async fn prestaged() -> (Arc<InMemoryObjectStore>, MockProvider, GranuleManifest) {
    let store = Arc::new(InMemoryObjectStore::new());
    store
        .put(STAGING, &staged_key(&hdf()), b"original".to_vec())
        .await
        .unwrap();
    let mock = MockProvider::new().with_file(DIR, &hdf(), "replacement");
    let manifest = manifest(vec![DiscoveredFile::new(hdf(), DIR)]);
    (store, mock, manifest)
}

#[tokio::test]
async fn test_skip_leaves_object_untouched() {
    let (store, mut mock, manifest) = prestaged().await;

    let granule = ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &mod09gq(), STAGING, Some(DuplicateHandling::Skip))
        .await
        .unwrap();

    assert_eq!(mock.fetches(), 0);
    assert_eq!(granule.files[0].size, 8);
    assert_eq!(store.get(STAGING, &staged_key(&hdf())).await.unwrap(), b"original");
}

#[tokio::test]
async fn test_skip_same_bytes_keeps_object_and_record() {
    let store = Arc::new(InMemoryObjectStore::new());
    let manifest = manifest(vec![DiscoveredFile::new(hdf(), DIR).with_checksum(ChecksumType::Cksum, "930766865")]);

    let mut first = MockProvider::new().with_file(DIR, &hdf(), "123456789");
    let staged = ingester(store.clone())
        .ingest(&mut first, &manifest, &provider(), &mod09gq(), STAGING, None)
        .await
        .unwrap();
    let before = store.head(STAGING, &staged_key(&hdf())).await.unwrap().unwrap();

    let mut second = MockProvider::new().with_file(DIR, &hdf(), "123456789");
    let skipped = ingester(store.clone())
        .ingest(&mut second, &manifest, &provider(), &mod09gq(), STAGING, Some(DuplicateHandling::Skip))
        .await
        .unwrap();

    assert_eq!(second.fetches(), 0);
    assert_eq!(skipped, staged);
    assert_eq!(store.head(STAGING, &staged_key(&hdf())).await.unwrap().unwrap(), before);
    assert_eq!(store.get(STAGING, &staged_key(&hdf())).await.unwrap(), b"123456789");
}

#[tokio::test]
async fn test_collection_policy_applies_when_not_overridden() {
    let (store, mut mock, manifest) = prestaged().await;
    let mut collection = mod09gq();
    collection.duplicate_handling = Some(DuplicateHandling::Skip);

    ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &collection, STAGING, None)
        .await
        .unwrap();
    assert_eq!(store.get(STAGING, &staged_key(&hdf())).await.unwrap(), b"original");
}

#[tokio::test]
async fn test_error_policy_fails() {
    let (store, mut mock, manifest) = prestaged().await;

    let err = ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &mod09gq(), STAGING, Some(DuplicateHandling::Error))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "DuplicateFile");
    assert_eq!(store.get(STAGING, &staged_key(&hdf())).await.unwrap(), b"original");
}

#[tokio::test]
async fn test_version_policy_keeps_previous_version() {
    let (store, mut mock, manifest) = prestaged().await;

    ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &mod09gq(), STAGING, Some(DuplicateHandling::Version))
        .await
        .unwrap();

    assert!(store.is_versioning_enabled(STAGING));
    assert_eq!(store.previous_versions(STAGING, &staged_key(&hdf())), 1);
    assert_eq!(store.get(STAGING, &staged_key(&hdf())).await.unwrap(), b"replacement");
}

#[tokio::test]
async fn test_replace_is_default() {
    let (store, mut mock, manifest) = prestaged().await;

    ingester(store.clone())
        .ingest(&mut mock, &manifest, &provider(), &mod09gq(), STAGING, None)
        .await
        .unwrap();
    assert_eq!(store.get(STAGING, &staged_key(&hdf())).await.unwrap(), b"replacement");
    assert!(!store.is_versioning_enabled(STAGING));
}

// ============================================================================
// Lock-guarded sync over HTTP
// ============================================================================

fn lock_config(max_attempts: u32) -> LockConfig {
    LockConfig {
        max_attempts,
        backoff_ms: 20,
        stale_after_secs: 900,
    }
}

fn http_provider(server: &MockServer) -> Provider {
    let url = url::Url::parse(&server.uri()).unwrap();
    let mut provider = Provider::new("HTTP_PROVIDER", Protocol::Http, url.host_str().unwrap());
    provider.port = url.port();
    provider
}

async fn http_server(granule_ids: &[&str]) -> MockServer {
    let server = MockServer::start().await;
    for id in granule_ids {
        Mock::given(method("GET"))
            .and(path(format!("/data/{}.hdf", id)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"123456789".to_vec())
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;
    }
    server
}

fn http_manifest(id: &str) -> GranuleManifest {
    GranuleManifest {
        granule_id: id.to_string(),
        data_type: "MOD09GQ".to_string(),
        version: "006".to_string(),
        files: vec![DiscoveredFile::new(format!("{}.hdf", id), "/data").with_checksum(ChecksumType::Cksum, "930766865")],
    }
}

#[tokio::test]
async fn test_sync_granules_over_http() {
    init_tracing();
    let ids = [ID, "MOD09GQ.A2017026.h21v00.006.2017034065105"];
    let server = http_server(&ids).await;
    let store = Arc::new(InMemoryObjectStore::new());
    let leases = Arc::new(InMemoryLeases::new());

    let sync = GranuleSync::new(
        GranuleIngester::new(store.clone(), "file-staging"),
        ResourceLock::new(leases.clone(), lock_config(5)),
        ProtocolContext::new(store.clone(), Duration::from_secs(5)),
        STAGING,
        2,
    );

    let manifests: Vec<_> = ids.iter().map(|id| http_manifest(id)).collect();
    let results = sync
        .sync_granules(&http_provider(&server), &mod09gq(), &manifests, None)
        .await;

    assert_eq!(results.len(), 2);
    for (result, id) in results.iter().zip(ids) {
        assert_eq!(result.as_ref().unwrap().granule_id, id);
    }
    assert_eq!(store.keys(STAGING).len(), 2);
    assert!(leases.is_empty());
}

#[tokio::test]
async fn test_sync_honours_provider_connection_limit() {
    let ids = [
        "MOD09GQ.A2017025.h21v00.006.2017034065101",
        "MOD09GQ.A2017025.h21v00.006.2017034065102",
        "MOD09GQ.A2017025.h21v00.006.2017034065103",
        "MOD09GQ.A2017025.h21v00.006.2017034065104",
    ];
    let server = http_server(&ids).await;
    let store = Arc::new(InMemoryObjectStore::new());
    let mut provider = http_provider(&server);
    provider.global_connection_limit = Some(1);

    let sync = GranuleSync::new(
        GranuleIngester::new(store.clone(), "file-staging"),
        ResourceLock::new(Arc::new(InMemoryLeases::new()), lock_config(1)),
        ProtocolContext::new(store.clone(), Duration::from_secs(5)),
        STAGING,
        4,
    );
    assert_eq!(sync.concurrency_for(&provider), 1);

    let manifests: Vec<_> = ids.iter().map(|id| http_manifest(id)).collect();
    let started = Instant::now();
    let results = sync.sync_granules(&provider, &mod09gq(), &manifests, None).await;

    assert!(results.iter().all(|r| r.is_ok()));
    // Each download is delayed 50ms; one connection at a time serializes them
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_sync_reports_locked_granule() {
    let server = http_server(&[ID]).await;
    let store = Arc::new(InMemoryObjectStore::new());
    let leases = Arc::new(InMemoryLeases::new());
    let provider = http_provider(&server);

    let holder = ResourceLock::new(leases.clone(), lock_config(1));
    let _held = holder.guard(&provider.id, ID).await.unwrap();

    let sync = GranuleSync::new(
        GranuleIngester::new(store.clone(), "file-staging"),
        ResourceLock::new(leases.clone(), lock_config(2)),
        ProtocolContext::new(store.clone(), Duration::from_secs(5)),
        STAGING,
        1,
    );

    let err = sync
        .sync_granule(&provider, &mod09gq(), &http_manifest(ID), None)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "ResourcesLockedError");
    assert!(err.is_retryable());
    assert!(store.keys(STAGING).is_empty());
}

#[tokio::test]
async fn test_sync_releases_lock_on_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let store = Arc::new(InMemoryObjectStore::new());
    let leases = Arc::new(InMemoryLeases::new());

    let sync = GranuleSync::new(
        GranuleIngester::new(store.clone(), "file-staging"),
        ResourceLock::new(leases.clone(), lock_config(1)),
        ProtocolContext::new(store.clone(), Duration::from_secs(5)),
        STAGING,
        1,
    );

    let err = sync
        .sync_granule(&http_provider(&server), &mod09gq(), &http_manifest(ID), None)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "RemoteResourceError");
    assert!(leases.is_empty());
}
