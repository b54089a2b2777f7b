//! Benchmarks for planning.

use anyhow::Context;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rstflow::core::{Artifact, ArtifactKey};
use rstflow::input::ExtensionValidator;
use rstflow::pipeline::Planner;
use rstflow::registry::{rst_descriptors, FitAlgorithm, StageRegistry};
use rstflow::store::ArtifactStore;
use std::path::PathBuf;
use std::sync::Arc;

struct Fixture {
    _dir: tempfile::TempDir,
    registry: Arc<StageRegistry>,
    planner: Planner,
    input: PathBuf,
    fresh: ArtifactKey,
    built: ArtifactKey,
}

fn fixture() -> anyhow::Result<Fixture> {
    let dir = tempfile::tempdir().context("creating bench directory")?;
    let registry = Arc::new(StageRegistry::from_descriptors(rst_descriptors(
        "/opt/rst/bin",
        FitAlgorithm::V3,
    )?)?);
    let store = Arc::new(ArtifactStore::new(Arc::clone(&registry), dir.path().join("out")));
    let planner = Planner::new(Arc::clone(&registry), Arc::clone(&store), Arc::new(ExtensionValidator::new()));

    let input = dir.path().join("20240115.0200.00.sas.rawacf");
    std::fs::write(&input, "raw").context("writing raw input")?;
    let fresh = ArtifactKey::parse("sas", "2024-01-15T02:00")?;

    let built = ArtifactKey::parse("sas", "2024-01-15T04:00")?;
    let despeck = store.output_path_for(&built, "despeck")?;
    let parent = despeck.parent().context("artifact path has no parent")?;
    std::fs::create_dir_all(parent).context("creating radar directory")?;
    std::fs::write(&despeck, "despeck").context("writing despeck artifact")?;
    store.record(Artifact::new(built.clone(), "despeck", despeck))?;

    Ok(Fixture {
        _dir: dir,
        registry,
        planner,
        input,
        fresh,
        built,
    })
}

fn planner_benchmark(c: &mut Criterion) {
    let f = match fixture() {
        Ok(f) => f,
        Err(e) => panic!("bench fixture: {e:#}"),
    };

    c.bench_function("dependency_chain", |b| {
        b.iter(|| f.registry.dependency_chain(black_box("grid")))
    });

    c.bench_function("plan_full_chain", |b| {
        b.iter(|| f.planner.plan(black_box(&f.input), &f.fresh, "grid"))
    });

    c.bench_function("plan_after_built_artifact", |b| {
        b.iter(|| f.planner.plan(black_box(&f.input), &f.built, "grid"))
    });
}

criterion_group!(benches, planner_benchmark);
criterion_main!(benches);
