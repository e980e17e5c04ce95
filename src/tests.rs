#[cfg(test)]
mod integration_tests {
    use crate::{
        ErrorSeverity, FailurePolicy, Fetcher, MemoryStore, Pipeline, PipelineConfig,
        PipelineError, Result, RetryConfig, RetryingFetcher, RunTimer, SourceLocation, Stage,
        Store, StoredArtifact, TransformKind, TransformRegistry, WorkerPool,
    };
    use async_trait::async_trait;
    use dashmap::DashMap;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    fn png(color: [u8; 4]) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba(color)))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn sources(urls: &[&str]) -> Vec<SourceLocation> {
        urls.iter().map(|u| SourceLocation::parse(u).unwrap()).collect()
    }

    fn stem(url: &str) -> String {
        SourceLocation::parse(url).unwrap().file_stem()
    }

    /// Serves a generated PNG for every location except the listed ones.
    #[derive(Default)]
    struct FakeFetcher {
        missing: HashSet<String>,
        garbage: HashSet<String>,
        delay: Option<Duration>,
    }

    impl FakeFetcher {
        fn missing(mut self, url: &str) -> Self {
            self.missing.insert(url.to_string());
            self
        }

        fn garbage(mut self, url: &str) -> Self {
            self.garbage.insert(url.to_string());
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, location: &SourceLocation) -> Result<Vec<u8>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.missing.contains(location.as_str()) {
                return Err(PipelineError::fetch(location, "404 Not Found"));
            }
            if self.garbage.contains(location.as_str()) {
                return Ok(b"definitely not an image".to_vec());
            }
            Ok(png([200, 120, 40, 255]))
        }
    }

    /// Delegates to a [`MemoryStore`] but rejects one transform's directory.
    struct RejectingStore {
        inner: Arc<MemoryStore>,
        rejected: &'static str,
    }

    #[async_trait]
    impl Store for RejectingStore {
        async fn write(&self, destination: &Path, bytes: &[u8]) -> Result<StoredArtifact> {
            if destination.components().any(|c| c.as_os_str() == self.rejected) {
                return Err(PipelineError::store(destination, "disk full"));
            }
            self.inner.write(destination, bytes).await
        }

        async fn remove(&self, destination: &Path) -> Result<()> {
            self.inner.remove(destination).await
        }

        async fn purge(&self, root: &Path) -> Result<usize> {
            self.inner.purge(root).await
        }
    }

    fn config(policy: FailurePolicy) -> PipelineConfig {
        PipelineConfig {
            output_dir: PathBuf::from("/out"),
            failure_policy: policy,
            ..Default::default()
        }
    }

    fn pipeline(config: PipelineConfig, fetcher: FakeFetcher, store: Arc<dyn Store>) -> Pipeline {
        let registry = config.registry().unwrap();
        Pipeline::new(
            config,
            registry,
            Arc::new(fetcher),
            store,
            WorkerPool::new(4).unwrap(),
        )
    }

    const THREE: [&str; 3] = [
        "https://example.com/a.png",
        "https://example.com/b.jpg",
        "https://example.com/c.gif",
    ];

    #[tokio::test]
    async fn test_three_sources_three_transforms_store_nine_variants() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            config(FailurePolicy::Isolate),
            FakeFetcher::default(),
            store.clone(),
        );

        let report = pipeline.run("default", &sources(&THREE)).await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.transformed, 9);
        assert_eq!(report.stored_count(), 9);
        assert!(report.is_clean());
        assert_eq!(store.len(), 9);
        assert!(report
            .summary()
            .starts_with("default: downloaded and stored 9 images using 4 threads"));

        for kind in TransformKind::ALL {
            let dir = Path::new("/out").join(kind.tag());
            let count = store.paths().iter().filter(|p| p.starts_with(&dir)).count();
            assert_eq!(count, 3, "expected three {kind} variants");
        }
        let sepia_a = Path::new("/out/sepia").join(format!("{}.png", stem(THREE[0])));
        let tint_b = Path::new("/out/tint").join(format!("{}.png", stem(THREE[1])));
        assert!(store.contains(&tint_b));
        let bytes = store.get(&sepia_a).unwrap();
        assert!(image::load_from_memory(&bytes).is_ok());
    }

    #[tokio::test]
    async fn test_similar_locations_never_share_a_destination() {
        let urls = [
            "https://example.com/cat",
            "https://example.com/cat.png",
            "https://example.com/a/b.png",
            "https://example.com/a_b.png",
            "http://example.com:8080/a/b.png",
        ];
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            config(FailurePolicy::Isolate),
            FakeFetcher::default(),
            store.clone(),
        );

        let report = pipeline.run("lookalikes", &sources(&urls)).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.stored_count(), 15);
        assert_eq!(store.len(), 15);
    }

    #[tokio::test]
    async fn test_variant_count_is_sources_times_transforms() {
        let urls: Vec<String> = (0..5).map(|i| format!("https://example.com/{i}.png")).collect();
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();

        let mut config = config(FailurePolicy::Isolate);
        config.transforms = vec!["grayscale".to_string(), "sepia".to_string()];
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(config, FakeFetcher::default(), store.clone());

        let report = pipeline.run("cardinality", &sources(&refs)).await.unwrap();
        assert_eq!(report.stored_count(), 10);

        let distinct: HashSet<_> = report.stored.iter().map(|a| a.path.clone()).collect();
        assert_eq!(distinct.len(), 10);
        assert!(report.stored.iter().all(|a| a.transform.is_some()));
    }

    #[tokio::test]
    async fn test_empty_source_list_is_a_clean_run() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            config(FailurePolicy::FailFast),
            FakeFetcher::default(),
            store.clone(),
        );

        let report = pipeline.run("empty", &[]).await.unwrap();
        assert_eq!(report.stored_count(), 0);
        assert!(report.is_clean());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_isolated_fetch_failure_only_drops_that_source() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            config(FailurePolicy::Isolate),
            FakeFetcher::default().missing("https://example.com/b.jpg"),
            store.clone(),
        );

        let report = pipeline.run("partial", &sources(&THREE)).await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.stored_count(), 6);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, Stage::Fetch);
        assert_eq!(report.failures[0].origin, "https://example.com/b.jpg");
        assert!(report.summary().ends_with("(1 units failed)"));
        assert!(store
            .paths()
            .iter()
            .all(|p| !p.to_string_lossy().contains("example.com_b.jpg")));
    }

    #[tokio::test]
    async fn test_isolated_decode_failure_fails_each_transform_unit() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            config(FailurePolicy::Isolate),
            FakeFetcher::default().garbage("https://example.com/c.gif"),
            store.clone(),
        );

        let report = pipeline.run("decode", &sources(&THREE)).await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.transformed, 6);
        assert_eq!(report.failures.len(), 3);
        assert!(report.failures.iter().all(|f| f.stage == Stage::Transform));

        let kinds: HashSet<_> = report.failures.iter().filter_map(|f| f.transform).collect();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(
            report.failures[0].cause,
            Some(PipelineError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_fast_fetch_failure_aborts_before_storing() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            config(FailurePolicy::FailFast),
            FakeFetcher::default().missing("https://example.com/a.png"),
            store.clone(),
        );

        let err = pipeline.run("abort", &sources(&THREE)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_store_failure_rolls_back_written_artifacts() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(RejectingStore {
            inner: inner.clone(),
            rejected: "sepia",
        });
        let pipeline = pipeline(config(FailurePolicy::FailFast), FakeFetcher::default(), store);

        let err = pipeline.run("rollback", &sources(&THREE)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store { .. }));
        assert!(inner.is_empty());
    }

    #[tokio::test]
    async fn test_isolated_store_failure_keeps_other_artifacts() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(RejectingStore {
            inner: inner.clone(),
            rejected: "sepia",
        });
        let pipeline = pipeline(config(FailurePolicy::Isolate), FakeFetcher::default(), store);

        let report = pipeline.run("isolate-store", &sources(&THREE)).await.unwrap();
        assert_eq!(report.stored_count(), 6);
        assert_eq!(inner.len(), 6);
        assert_eq!(report.failures.len(), 3);
        assert!(report
            .failures
            .iter()
            .all(|f| f.stage == Stage::Store && f.transform == Some(TransformKind::Sepia)));
    }

    #[tokio::test]
    async fn test_persist_raw_stores_unmodified_images() {
        let mut config = config(FailurePolicy::Isolate);
        config.persist_raw = true;
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(config, FakeFetcher::default(), store.clone());

        let report = pipeline.run("raw", &sources(&THREE)).await.unwrap();

        assert_eq!(report.stored_count(), 12);
        let raw: Vec<_> = report.stored.iter().filter(|a| a.transform.is_none()).collect();
        assert_eq!(raw.len(), 3);
        let raw_b = Path::new("/out/raw").join(format!("{}.jpg", stem(THREE[1])));
        assert!(store.contains(&raw_b));
    }

    #[tokio::test]
    async fn test_slow_fetch_is_reported_as_timeout() {
        let mut config = config(FailurePolicy::Isolate);
        config.fetch_timeout = Duration::from_millis(20);
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            config,
            FakeFetcher::default().slow(Duration::from_millis(500)),
            store.clone(),
        );

        let report = pipeline
            .run("slow", &sources(&["https://example.com/a.png"]))
            .await
            .unwrap();

        assert_eq!(report.stored_count(), 0);
        assert!(matches!(
            report.failures[0].cause,
            Some(PipelineError::Timeout { stage: Stage::Fetch, .. })
        ));
    }

    /// Each location's first attempt stalls and then times out; later attempts succeed.
    #[derive(Default)]
    struct StallingFetcher {
        attempts: DashMap<String, usize>,
        stall: Duration,
    }

    #[async_trait]
    impl Fetcher for StallingFetcher {
        async fn fetch(&self, location: &SourceLocation) -> Result<Vec<u8>> {
            let attempt = {
                let mut count = self.attempts.entry(location.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            if attempt == 1 {
                tokio::time::sleep(self.stall).await;
                return Err(PipelineError::Timeout {
                    stage: Stage::Fetch,
                    location: location.to_string(),
                    after: self.stall,
                });
            }
            Ok(png([10, 20, 30, 255]))
        }
    }

    #[tokio::test]
    async fn test_timed_out_attempt_is_retried_within_fetch_budget() {
        let config = PipelineConfig {
            fetch_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(50),
            ..config(FailurePolicy::FailFast)
        };
        let fetcher = RetryingFetcher::new(
            StallingFetcher {
                stall: config.request_timeout,
                ..Default::default()
            },
            RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
            },
        );
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(
            config.clone(),
            config.registry().unwrap(),
            Arc::new(fetcher),
            store.clone(),
            WorkerPool::new(4).unwrap(),
        );

        let report = pipeline.run("retry", &sources(&THREE)).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.stored_count(), 9);
    }

    #[tokio::test]
    async fn test_single_worker_pool_completes_run() {
        let config = config(FailurePolicy::Isolate);
        let registry = config.registry().unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(
            config,
            registry,
            Arc::new(FakeFetcher::default()),
            store.clone(),
            WorkerPool::new(1).unwrap(),
        );

        let report = pipeline.run("serial", &sources(&THREE)).await.unwrap();
        assert_eq!(report.stored_count(), 9);
        assert_eq!(report.pool_size, 1);
        assert_eq!(pipeline.pool().stats().peak_in_flight, 1);
    }

    #[tokio::test]
    async fn test_timed_runs_record_and_clean_up() {
        let mut config = config(FailurePolicy::Isolate);
        config.cleanup_after_run = true;
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(config, FakeFetcher::default(), store.clone());
        let timer = RunTimer::new();

        let first = pipeline.run_timed("first", &sources(&THREE), &timer).await.unwrap();
        let second = pipeline.run_timed("second", &sources(&THREE), &timer).await.unwrap();

        assert_eq!(first.stored_count(), 9);
        assert_eq!(second.stored_count(), 9);
        assert_ne!(first.run_id, second.run_id);
        assert!(store.is_empty());
        assert_eq!(timer.len(), 2);
        assert!(timer
            .report()
            .starts_with("Printing 2 results from fastest to slowest"));
    }

    #[tokio::test]
    async fn test_aborted_timed_run_records_nothing() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            config(FailurePolicy::FailFast),
            FakeFetcher::default().missing("https://example.com/c.gif"),
            store,
        );
        let timer = RunTimer::new();

        assert!(pipeline
            .run_timed("aborted", &sources(&THREE), &timer)
            .await
            .is_err());
        assert!(timer.is_empty());
    }

    #[test]
    fn test_report_serializes_without_causes() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            config(FailurePolicy::Isolate),
            FakeFetcher::default().missing("https://example.com/a.png"),
            store,
        );

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let report = runtime
            .block_on(pipeline.run("json", &sources(&THREE)))
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["name"], "json");
        assert_eq!(json["failures"][0]["stage"], "fetch");
        assert!(json["failures"][0].get("cause").is_none());
        assert_eq!(json["stored"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn test_registry_rejects_unknown_tag() {
        let err = TransformRegistry::from_tags(&["grayscale", "blur"]).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownTransformKind(tag) if tag == "blur"));
    }

    #[test]
    fn test_source_list_from_memory_fetcher() {
        let fetcher = FakeFetcher::default();
        let location = SourceLocation::parse("https://example.com/a.png").unwrap();
        let bytes = tokio_test::block_on(fetcher.fetch(&location)).unwrap();
        assert!(image::load_from_memory(&bytes).is_ok());
    }

    #[test]
    fn test_error_retryable() {
        assert!(PipelineError::fetch("https://example.com", "reset").is_retryable());
        assert!(PipelineError::Timeout {
            stage: Stage::Fetch,
            location: "https://example.com".to_string(),
            after: Duration::from_secs(1),
        }
        .is_retryable());
        assert!(!PipelineError::decode("https://example.com", "bad header").is_retryable());
        assert!(!PipelineError::InvalidLocation("nope".to_string()).is_retryable());
        assert!(!PipelineError::Configuration("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_severity() {
        assert!(matches!(
            PipelineError::InvalidLocation("test".to_string()).severity(),
            ErrorSeverity::Low
        ));
        assert!(matches!(
            PipelineError::decode("x", "y").severity(),
            ErrorSeverity::Medium
        ));
        assert!(matches!(
            PipelineError::Configuration("test".to_string()).severity(),
            ErrorSeverity::High
        ));
        assert!(matches!(
            PipelineError::WorkerPool("test".to_string()).severity(),
            ErrorSeverity::Critical
        ));
    }
}
