use cellanneal_core::render::{ImageType, render_cells};
use cellanneal_core::{AnnealConfig, Annealer, Bacilli, Cell, Field, Lineage, RenderParams, Window};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use rand::{SeedableRng, rngs::SmallRng};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(fallback)
}

// A grid of rods, each slightly displaced from where the image shows it.
fn colony(cells: usize, frames: usize, params: RenderParams) -> Lineage {
    let columns = (cells as f64).sqrt().ceil() as usize;
    let size = 24 * columns + 16;
    let truth: Vec<Cell> = (0..cells)
        .map(|i| {
            let (col, row) = (i % columns, i / columns);
            Bacilli::new(
                format!("c{i}"),
                20.0 + 24.0 * col as f64,
                20.0 + 24.0 * row as f64,
                5.0,
                16.0,
                0.3 * i as f64,
            )
            .into()
        })
        .collect();
    let (real, _) = render_cells(truth.iter(), size, size, &params).expect("render");

    let mut lineage = Lineage::new(&AnnealConfig::default());
    lineage.forward(real.clone(), params).expect("frame");
    for cell in &truth {
        lineage
            .add_cell(0, cell.with_offset(Field::X, 1.0).with_offset(Field::Rotation, 0.1))
            .expect("cell");
    }
    lineage.render_frame(0).expect("render");
    for _ in 1..frames {
        lineage.copy_forward(real.clone()).expect("copy");
    }
    lineage
}

fn bench_anneal(c: &mut Criterion) {
    let mut group = c.benchmark_group("anneal_window");
    group.sample_size(env_or("CA_BENCH_SAMPLES", 20usize).max(10));
    group.warm_up_time(Duration::from_secs(env_or("CA_BENCH_WARMUP_SECS", 2u64)));
    group.measurement_time(Duration::from_secs(env_or("CA_BENCH_MEASURE_SECS", 8u64)));
    let iterations: usize = env_or("CA_BENCH_ITERATIONS_PER_CELL", 200);

    let gray = RenderParams {
        image_type: ImageType::GraySynthetic,
        diffraction_sigma: 1.5,
        ..RenderParams::default()
    };
    for (label, params) in [("binary", RenderParams::default()), ("gray", gray)] {
        for cells in [16usize, 64] {
            let mut config = AnnealConfig::default();
            config.schedule.iterations_per_cell = iterations;
            config.rng_seed = Some(0xBEEF);
            let base = colony(cells, 3, params);
            group.bench_function(format!("{label}_cells{cells}_frames3"), |b| {
                b.iter_batched(
                    || (base.clone(), SmallRng::seed_from_u64(0xBEEF)),
                    |(mut lineage, mut rng)| {
                        Annealer::new(&config, Window::new(0, 3))
                            .run(&mut lineage, &mut rng)
                            .expect("run")
                    },
                    BatchSize::LargeInput,
                );
            });
        }
    }
    group.finish();
}

fn bench_full_render(c: &mut Criterion) {
    let lineage = colony(64, 1, RenderParams::default());
    c.bench_function("total_cost_cells64", |b| {
        b.iter(|| lineage.total_cost(0..1));
    });
}

criterion_group!(benches, bench_anneal, bench_full_render);
criterion_main!(benches);
