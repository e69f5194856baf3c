use std::collections::HashSet;
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::time::{Duration, SystemTime};

use hearth::cache::{ArtifactCache, CacheConfig, CacheError, CompilationContext};
use hearth::convert::ConversionError;
use hearth::infra::telemetry;
use hearth::resources::ResourceStore;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use tempfile::tempdir;

fn read_primary(context: &mut CompilationContext) -> Result<String, ConversionError> {
    context.read_primary().map_err(ConversionError::from)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let dir = tempdir().expect("temp dir");
    fs::write(dir.path().join("a.txt"), "a").expect("write");
    fs::write(dir.path().join("b.txt"), "b").expect("write");
    let store = ResourceStore::new(dir.path()).expect("store");
    let config = CacheConfig {
        workers: NonZeroUsize::MIN,
        queue_size: 0,
    };
    let cache: ArtifactCache<String> = ArtifactCache::new("metrics", store.clone(), config);
    let a = store.resolve("a.txt").expect("a");
    let b = store.resolve("b.txt").expect("b");

    // miss + compile, then hit
    cache.get(&a, read_primary).await.expect("compiled");
    cache.get(&a, read_primary).await.expect("cached");

    // stale
    File::options()
        .write(true)
        .open(dir.path().join("a.txt"))
        .expect("open")
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(42))
        .expect("set mtime");
    cache.get(&a, read_primary).await.expect("recompiled");

    // join + reject while a blocked compile holds the only slot
    let (release, gate) = mpsc::channel::<()>();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let blocked = {
        let cache = cache.clone();
        let b = b.clone();
        tokio::spawn(async move {
            cache
                .get(&b, move |context: &mut CompilationContext| {
                    let _ = started_tx.send(());
                    let _ = gate.recv();
                    read_primary(context)
                })
                .await
        })
    };
    started_rx.await.expect("blocked compile started");

    let joined = {
        let cache = cache.clone();
        let b = b.clone();
        tokio::spawn(async move { cache.get(&b, read_primary).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    cache.invalidate("a.txt");
    let rejected = cache.get(&a, read_primary).await;
    assert!(matches!(rejected, Err(CacheError::Rejected { .. })));

    drop(release);
    blocked.await.expect("join").expect("blocked artifact");
    joined.await.expect("join").expect("joined artifact");

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "hearth_artifact_cache_hit_total",
        "hearth_artifact_cache_miss_total",
        "hearth_artifact_cache_stale_total",
        "hearth_artifact_compile_ms",
        "hearth_flight_joined_total",
        "hearth_flight_rejected_total",
        "hearth_flight_in_flight",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let labelled = snapshot.iter().all(|(composite_key, _, _, _)| {
        composite_key
            .key()
            .labels()
            .any(|label| label.key() == "cache" && label.value() == "metrics")
    });
    assert!(labelled, "every metric carries the cache label");

    let in_flight = snapshot
        .iter()
        .find(|(composite_key, _, _, _)| composite_key.key().name() == "hearth_flight_in_flight")
        .map(|(_, _, _, value)| value.clone());
    assert!(matches!(in_flight, Some(DebugValue::Gauge(value)) if value.into_inner() == 0.0));
}
