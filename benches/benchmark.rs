use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgba};
use screenshot_api::{
    EncodeOptions, Fingerprint, ImageEncoder, OutputFormat, RasterEncoder, RateLimitConfig,
    RateLimiter, SafetyGate, ScreenshotParams,
};
use std::io::Cursor;
use std::time::{Duration, Instant};

#[cfg(feature = "integration_benchmarks")]
use screenshot_api::{
    CacheDirective, CacheStore, CaptureCoordinator, CaptureRequest, ChromiumRenderer, Config,
    CoordinatorSettings, PageRenderer, StatsCollector,
};
#[cfg(feature = "integration_benchmarks")]
use std::sync::Arc;
#[cfg(feature = "integration_benchmarks")]
use tokio::runtime::Runtime;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn sample_capture(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
        .unwrap();
    out
}

// === UNIT BENCHMARKS ===

fn benchmark_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    configure_fast_group(&mut group);

    group.bench_function("compute", |b| {
        b.iter(|| {
            let key = Fingerprint::compute(
                black_box("https://example.com/some/long/path?with=query"),
                1200,
                630,
                false,
                OutputFormat::Webp,
                true,
            );
            black_box(key);
        });
    });

    group.bench_function("from_filename", |b| {
        let name = Fingerprint::compute("https://example.com/", 1200, 630, false, OutputFormat::Png, false)
            .filename();
        b.iter(|| black_box(Fingerprint::from_filename(black_box(&name))));
    });

    group.finish();
}

fn benchmark_safety_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("safety_gate");
    configure_fast_group(&mut group);

    let gate = SafetyGate::new();
    let test_urls = vec![
        "https://example.com",
        "http://example.com/path?q=1",
        "http://169.254.169.254/latest/meta-data",
        "https://example.com/%252e%252e/javascript%3Aalert(1)",
        "invalid-url",
    ];

    group.bench_function("evaluate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let _ = black_box(gate.evaluate(url));
            }
        });
    });

    group.finish();
}

fn benchmark_param_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("param_validation");
    configure_fast_group(&mut group);

    let params = ScreenshotParams {
        width: Some(1280),
        height: Some(720),
        format: Some("jpeg".to_string()),
        quality: Some(85),
        crop_x: Some(0),
        crop_y: Some(0),
        crop_width: Some(640),
        crop_height: Some(360),
        ..ScreenshotParams::for_url("https://example.com/")
    };

    group.bench_function("validate", |b| {
        b.iter(|| {
            let _ = black_box(screenshot_api::validate_params(black_box(&params)));
        });
    });

    group.finish();
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    configure_fast_group(&mut group);

    let limiter = RateLimiter::new(RateLimitConfig {
        max_requests: u32::MAX,
        ..Default::default()
    });
    let clients: Vec<String> = (0..256).map(|i| format!("10.0.{}.{}", i / 16, i % 16)).collect();

    group.bench_function("admit", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % clients.len();
            black_box(limiter.admit_at(&clients[i], Instant::now()));
        });
    });

    group.finish();
}

fn benchmark_encoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoder");
    configure_fast_group(&mut group);

    let raw = sample_capture(600, 315);
    for format in [OutputFormat::Jpeg, OutputFormat::Webp] {
        let options = EncodeOptions {
            format,
            quality: 80,
            crop: None,
        };
        group.bench_function(format.as_str(), |b| {
            b.iter(|| black_box(RasterEncoder.encode(&raw, &options).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    let test_durations = vec![Duration::from_millis(100), Duration::from_secs(5)];
    let test_byte_sizes: Vec<u64> = vec![1024, 1048576];

    group.bench_function("format_duration", |b| {
        b.iter(|| {
            for duration in &test_durations {
                let formatted = screenshot_api::format_duration(*duration);
                black_box(formatted);
            }
        });
    });

    group.bench_function("format_bytes", |b| {
        b.iter(|| {
            for size in &test_byte_sizes {
                let formatted = screenshot_api::format_bytes(*size);
                black_box(formatted);
            }
        });
    });

    group.finish();
}

// === INTEGRATION BENCHMARKS (require Chrome) ===

#[cfg(feature = "integration_benchmarks")]
fn benchmark_real_world_capture(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("real_world_capture");
    configure_fast_group(&mut group);

    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let (coordinator, renderer) = rt.block_on(async {
        let store = CacheStore::open(dir.path()).await.unwrap();
        let renderer = Arc::new(ChromiumRenderer::launch(config.browser.clone()).await.unwrap());
        let coordinator = CaptureCoordinator::new(
            store,
            renderer.clone(),
            Arc::new(StatsCollector::new()),
            CoordinatorSettings::from_config(&config),
        );
        (coordinator, renderer)
    });

    let url = url::Url::parse("https://example.com/").unwrap();

    group.bench_function("refresh", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut request = CaptureRequest::with_defaults(url.clone());
                request.cache = CacheDirective::Refresh;
                black_box(coordinator.resolve(&request).await.is_ok());
            })
        });
    });

    group.bench_function("cache_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let request = CaptureRequest::with_defaults(url.clone());
                black_box(coordinator.resolve(&request).await.is_ok());
            })
        });
    });

    rt.block_on(renderer.shutdown());
    group.finish();
}

// === BENCHMARK GROUPS ===

criterion_group!(
    unit_benches,
    benchmark_fingerprint,
    benchmark_safety_gate,
    benchmark_param_validation,
    benchmark_rate_limiter,
    benchmark_encoder,
    benchmark_format_utilities,
);

#[cfg(feature = "integration_benchmarks")]
criterion_group!(integration_benches, benchmark_real_world_capture);

#[cfg(feature = "integration_benchmarks")]
criterion_main!(unit_benches, integration_benches);

#[cfg(not(feature = "integration_benchmarks"))]
criterion_main!(unit_benches);
