//! Concurrent requests share compilations; distinct keys do not wait on each other.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use hearth::application::assets::{AssetPolicy, AssetService, Converters};
use hearth::cache::{ArtifactCache, CacheConfig, CompilationContext};
use hearth::convert::{ConversionError, ConvertOptions, Converter, IncludeFetcher};
use hearth::resources::ResourceStore;
use tempfile::tempdir;

/// LESS stand-in that counts invocations and holds each one long enough for
/// concurrent callers to pile up behind it.
struct SlowCountingStylesheet {
    calls: Arc<AtomicUsize>,
}

impl Converter for SlowCountingStylesheet {
    fn convert(
        &self,
        source: &str,
        _options: &ConvertOptions,
        _includes: &mut dyn IncludeFetcher,
    ) -> Result<String, ConversionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
        Ok(format!("/* build {call} */{source}"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_requests_compile_once() {
    let dir = tempdir().expect("temp dir");
    fs::write(dir.path().join("style.less"), ".a{top:0}").expect("write");
    let calls = Arc::new(AtomicUsize::new(0));

    let store = ResourceStore::new(dir.path()).expect("store");
    let assets = AssetService::new(store, CacheConfig::default(), AssetPolicy::default())
        .with_converters(Converters::default().with_stylesheet(SlowCountingStylesheet {
            calls: Arc::clone(&calls),
        }));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let assets = assets.clone();
            tokio::spawn(async move { assets.get_artifact("style.less").await })
        })
        .collect();

    let mut bodies = Vec::new();
    for handle in handles {
        let asset = handle.await.expect("join").expect("artifact");
        bodies.push(asset.content());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(bodies.iter().all(|body| body == &bodies[0]));
    assert_eq!(&bodies[0][..], b"/* build 0 */.a{top:0}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_key_does_not_delay_another() {
    let dir = tempdir().expect("temp dir");
    fs::write(dir.path().join("slow.txt"), "slow").expect("write");
    fs::write(dir.path().join("fast.txt"), "fast").expect("write");

    let store = ResourceStore::new(dir.path()).expect("store");
    let cache: ArtifactCache<String> =
        ArtifactCache::new("test", store.clone(), CacheConfig::default());

    let (release, gate) = mpsc::channel::<()>();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

    let slow_cache = cache.clone();
    let slow_resource = store.resolve("slow.txt").expect("slow");
    let slow = tokio::spawn(async move {
        slow_cache
            .get(&slow_resource, move |context: &mut CompilationContext| {
                let _ = started_tx.send(());
                // Blocks until the sender is dropped.
                let _ = gate.recv();
                context.read_primary().map_err(ConversionError::from)
            })
            .await
    });
    started_rx.await.expect("slow compile started");

    let fast_resource = store.resolve("fast.txt").expect("fast");
    let fast = tokio::time::timeout(
        Duration::from_secs(5),
        cache.get(&fast_resource, |context: &mut CompilationContext| {
            context.read_primary().map_err(ConversionError::from)
        }),
    )
    .await
    .expect("fast key finished while slow key is blocked")
    .expect("fast artifact");
    assert_eq!(fast.artifact(), "fast");
    assert!(!slow.is_finished());

    drop(release);
    let slow = slow.await.expect("join").expect("slow artifact");
    assert_eq!(slow.artifact(), "slow");
}
