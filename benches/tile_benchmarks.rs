use std::collections::BTreeMap;

use biotiles::binning::{self, BinMode, BinningConfig};
use biotiles::codec::{self, AttrValue, Feature, Geometry, Layer};
use biotiles::projection::TileAddress;
use biotiles::regression;
use biotiles::tile_store::{SqliteTileStore, TileKey};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn generate_points(count: usize) -> Vec<Feature> {
    (0..count)
        .map(|i| {
            let mut attrs = BTreeMap::new();
            attrs.insert(
                (2015 + (i % 10)).to_string(),
                AttrValue::Int((i % 20 + 1) as i64),
            );
            Feature {
                id: Some(i as u64),
                geometry: Geometry::Point((i % 4096) as i32, ((i * 7) % 4096) as i32),
                attributes: attrs,
            }
        })
        .collect()
}

fn benchmark_codec_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    for size in [100, 2_000, 20_000].iter() {
        let layer = Layer {
            name: "occurrence".to_string(),
            extent: 512,
            features: generate_points(*size),
        };
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &layer, |b, layer| {
            b.iter(|| codec::encode(std::slice::from_ref(layer), 512, 64).unwrap());
        });

        let encoded = codec::encode(&[layer.clone()], 512, 64).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, bytes| {
            b.iter(|| codec::decode(bytes).unwrap());
        });
    }
    group.finish();
}

fn benchmark_binning(c: &mut Criterion) {
    let mut group = c.benchmark_group("binning");
    let tile = TileAddress::new(8, 40, 90).unwrap();

    for size in [1_000, 20_000].iter() {
        let features = generate_points(*size);
        group.throughput(Throughput::Elements(*size as u64));

        let square_config = BinningConfig {
            mode: BinMode::Square,
            hex_per_tile: 35,
            square_size: 64,
        };
        group.bench_with_input(BenchmarkId::new("square", size), &features, |b, features| {
            b.iter(|| binning::bin_features(features, tile, 512, &square_config).unwrap());
        });

        let hex_config = BinningConfig {
            mode: BinMode::Hex,
            hex_per_tile: 35,
            square_size: 64,
        };
        group.bench_with_input(BenchmarkId::new("hex", size), &features, |b, features| {
            b.iter(|| binning::bin_features(features, tile, 512, &hex_config).unwrap());
        });
    }
    group.finish();
}

fn benchmark_regression_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("regression");
    for size in [100, 5_000].iter() {
        let series: Vec<_> = (0..*size as i64)
            .map(|i| (2000 + i, (i % 50 + 1) as f64, (i % 40 + 1) as f64))
            .collect();
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &series, |b, series| {
            b.iter(|| regression::fit_cell(series, 2));
        });
    }
    group.finish();
}

fn benchmark_tile_store_fetch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    // A real file-backed database, not `:memory:`: the pooled fetches this
    // benchmark exercises need a database every connection in the pool can
    // see, which an in-memory SQLite database cannot offer beyond one
    // connection.
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("bench.db");
    let database_url = format!("sqlite:{}", db_path.display());

    let store = rt.block_on(async {
        let store = SqliteTileStore::connect(&database_url, 8).await.unwrap();
        let layer = Layer {
            name: "occurrence".to_string(),
            extent: 512,
            features: generate_points(500),
        };
        let bytes = codec::encode(&[layer], 512, 64).unwrap();
        let tile = TileAddress::new(6, 10, 20).unwrap();
        let key = TileKey::new("occurrence_tiles", tile);
        for salt in 0..8 {
            store.put_shard(&key, salt, &bytes).await.unwrap();
        }
        store
    });
    let tile = TileAddress::new(6, 10, 20).unwrap();
    let key = TileKey::new("occurrence_tiles", tile);

    let mut group = c.benchmark_group("tile_store");
    group.bench_function("fetch_sharded_layers", |b| {
        b.to_async(&rt)
            .iter(|| async { store.fetch_sharded_layers(&key).await.unwrap() });
    });
    group.finish();
    // temp_dir must outlive the benchmark group: dropping it deletes the db file.
    drop(temp_dir);
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(std::time::Duration::from_secs(1))
        .sample_size(10)
        .warm_up_time(std::time::Duration::from_millis(500));
    targets =
        benchmark_codec_round_trip,
        benchmark_binning,
        benchmark_regression_fit,
        benchmark_tile_store_fetch
}
criterion_main!(benches);
