use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pixcache::{
    Bitmap, BitmapDecoder, CacheConfig, CacheKey, CacheStats, CompressFormat, DecodeOptions,
    Handle, ImageDecoder, MemoryCache, PixelFormat, ResizingStrategy,
};
use std::sync::Arc;

fn bitmap(width: u32, height: u32) -> Bitmap {
    let pixels = (0..width * height * 4).map(|i| (i % 251) as u8).collect();
    Bitmap::new(width, height, PixelFormat::Rgba8, pixels).unwrap()
}

fn bench_memory_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_get");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_hit_64x64", |b| {
        let cache = MemoryCache::new(64 * 1024 * 1024, Arc::new(CacheStats::new()));
        let keys: Vec<CacheKey> = (0..100).map(|i| CacheKey::new(format!("/img/{}.png", i))).collect();
        for key in &keys {
            cache.put(key.clone(), &Handle::new(bitmap(64, 64))).unwrap();
        }

        let mut counter = 0;
        b.iter(|| {
            let handle = cache.get(&keys[counter % 100]).unwrap();
            black_box(handle.ref_count());
            counter += 1;
        });
    });

    group.finish();
}

fn bench_memory_put_evicting(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_put");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_evicting_64x64", |b| {
        // Room for 16 bitmaps, so steady state evicts on every put
        let cache = MemoryCache::new(16 * 64 * 64 * 4, Arc::new(CacheStats::new()));
        let handle = Handle::new(bitmap(64, 64));

        let mut counter = 0u64;
        b.iter(|| {
            cache
                .put(CacheKey::new(format!("/img/{}.png", counter)), &handle)
                .unwrap();
            counter += 1;
        });
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.sample_size(20);
    group.throughput(Throughput::Elements(1));

    let png = bitmap(512, 512).encode(CompressFormat::Png, 100).unwrap();
    let config = CacheConfig::default();

    group.bench_function("png_512_native", |b| {
        let decoder = ImageDecoder::new(ResizingStrategy::KeepOriginal);
        b.iter(|| {
            black_box(decoder.decode_bytes(&png, &DecodeOptions::default(), None).unwrap());
        });
    });

    group.bench_function("png_512_to_128", |b| {
        let decoder = ImageDecoder::new(config.resizing_strategy());
        let options = DecodeOptions {
            target_width: 128,
            target_height: 128,
            ..DecodeOptions::default()
        };
        b.iter(|| {
            black_box(decoder.decode_bytes(&png, &options, None).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_memory_get, bench_memory_put_evicting, bench_decode);
criterion_main!(benches);
