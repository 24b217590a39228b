//! Benchmarks for grid partitioning and the stencil kernel

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spmd_stencil::partition::{balanced_split, describe_sectors, GridSpec};
use spmd_stencil::spmd::TileLayout;
use spmd_stencil::stencil::{TileField, Weights};

fn bench_sector_tables(c: &mut Criterion) {
    let mut group = c.benchmark_group("describe_sectors");

    for tiles in [2i64, 4, 8].iter() {
        let spec = GridSpec::new(4096, 2, *tiles, *tiles).unwrap();
        group.throughput(Throughput::Elements(spec.num_tiles() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tiles), &spec, |b, spec| {
            b.iter(|| {
                for tile in spec.tiles() {
                    black_box(describe_sectors(tile.private_box(), spec.n(), spec.radius()));
                }
            });
        });
    }

    group.finish();
}

fn bench_tile_layout(c: &mut Criterion) {
    let spec = GridSpec::new(4096, 2, 4, 4).unwrap();
    let tile = spec.tiles().nth(5).unwrap();

    c.bench_function("tile_layout_16_blocks", |b| {
        b.iter(|| black_box(TileLayout::build(&tile, 16).unwrap()));
    });

    c.bench_function("balanced_split_1024_rows", |b| {
        b.iter(|| black_box(balanced_split(tile.private_box(), black_box(48)).unwrap()));
    });
}

fn bench_kernel(c: &mut Criterion) {
    let mut group = c.benchmark_group("star_kernel");

    for radius in [1i64, 2, 4].iter() {
        let spec = GridSpec::new(512, *radius, 1, 1).unwrap();
        let rect = spec.global_box();
        let weights = Weights::star(*radius);
        let mut field = TileField::new(rect);
        group.throughput(Throughput::Elements(rect.volume()));
        group.bench_with_input(BenchmarkId::from_parameter(radius), radius, |b, _| {
            b.iter(|| {
                let (input, output) = field.split_mut();
                weights.apply(rect, input, output, rect.lo.y, rect, spec.n());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sector_tables, bench_tile_layout, bench_kernel);
criterion_main!(benches);
