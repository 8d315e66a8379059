//! Benchmarks for the per-bar hot path
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use forecast_supervisor::agent::{confidence_score, RiskGate};
use forecast_supervisor::config::RiskConfig;
use forecast_supervisor::control::DriftController;
use forecast_supervisor::utils::helpers::average_true_range;
use forecast_supervisor::utils::types::{AgentId, Bar, Direction, Forecast, Position, Quote};

fn warmed_drift(observations: usize) -> DriftController {
    let mut drift = DriftController::new();
    for i in 0..observations {
        drift.check(0.001 + (i % 7) as f64 * 0.0001, 0.0015);
    }
    drift
}

fn bars(count: usize) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            let close = 1.10 + (i as f64 * 0.1).sin() * 0.01;
            Bar {
                time: i as i64 * 3_600,
                open: close - 0.0005,
                high: close + 0.001,
                low: close - 0.001,
                close,
                volume: 1_000.0,
            }
        })
        .collect()
}

/// Benchmark drift classification against a full error history
fn bench_drift_check(c: &mut Criterion) {
    let mut drift = warmed_drift(500);

    c.bench_function("drift_check", |b| {
        b.iter(|| black_box(drift.check(black_box(0.0012), black_box(0.0015))))
    });
}

/// Benchmark entry evaluation for a tradeable forecast
fn bench_entry_evaluation(c: &mut Criterion) {
    let gate = RiskGate::new(AgentId::new("EURUSD", "H1"), &RiskConfig::default());
    let quote = Quote { bid: 1.1000, ask: 1.1002 };
    let forecast = Forecast::new(1.1030, 1.1040, 1.0990);

    c.bench_function("entry_evaluation", |b| {
        b.iter(|| black_box(gate.evaluate(black_box(&quote), black_box(&forecast), black_box(0.0012))))
    });
}

/// Benchmark trailing exit selection over open positions
fn bench_trailing_exits(c: &mut Criterion) {
    let agent = AgentId::new("EURUSD", "H1");
    let positions: Vec<Position> = (0..20)
        .map(|i| {
            let direction = if i % 2 == 0 { Direction::Long } else { Direction::Short };
            Position::new(agent.clone(), direction, 1.1000, 1.1030, 1.0990)
        })
        .collect();

    c.bench_function("trailing_exits", |b| {
        b.iter(|| black_box(RiskGate::trailing_exits(black_box(&positions), 1.1010, Some(1.1020))))
    });
}

/// Benchmark confidence scoring
fn bench_confidence(c: &mut Criterion) {
    let drift = warmed_drift(500);
    let baseline = drift.mean_error();

    c.bench_function("confidence_score", |b| {
        b.iter(|| black_box(confidence_score(black_box(0.0012), baseline, black_box(1.5))))
    });
}

/// Benchmark volatility over different window sizes
fn bench_volatility_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("volatility_window");

    for size in [60, 250, 1000, 5000].iter() {
        let data = bars(*size);
        group.bench_with_input(BenchmarkId::new("atr14", size), &data, |b, data| {
            b.iter(|| black_box(average_true_range(black_box(data), 14)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_drift_check,
    bench_entry_evaluation,
    bench_trailing_exits,
    bench_confidence,
    bench_volatility_window,
);

criterion_main!(benches);
