use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use factor_hierarchy::clustering::{AgglomerativeLinkage, ClusterInput, DistanceMetric, HierarchicalClusterer};
use factor_hierarchy::entropy::EntropyProfiler;
use factor_hierarchy::extraction::{FactorExtractor, PrincipalAxisExtractor};
use factor_hierarchy::factor_tree::FactorTreeBuilder;
use factor_hierarchy::linalg_backends::{LinAlgBackend, NdarrayLinAlgBackend};
use factor_hierarchy::nesting::NestingQuantifier;
use factor_hierarchy::synthetic::LatentFactorDesign;
use std::sync::Arc;

// (n_observations, factors, variables per factor)
const SCENARIOS: &[(usize, usize, usize)] = &[(200, 3, 4), (500, 4, 6), (1000, 6, 8)];

fn bench_factor_hierarchy(c: &mut Criterion) {
    let backend: Arc<dyn LinAlgBackend> = Arc::new(NdarrayLinAlgBackend);
    let extractor: Arc<dyn FactorExtractor> = Arc::new(PrincipalAxisExtractor::with_backend(
        Default::default(),
        backend.clone(),
    ));
    let builder = FactorTreeBuilder::new(extractor);
    let quantifier = NestingQuantifier::new(backend, 0.5);
    let profiler = EntropyProfiler::default();

    let mut group = c.benchmark_group("factor_hierarchy");
    group.sample_size(10);
    for &(n_obs, n_factors, per_factor) in SCENARIOS {
        let data = LatentFactorDesign::block_structure(n_factors, per_factor, 0.7).generate(n_obs, 42);
        let max_c = (n_factors + 5).min(data.n_variables());
        let label = format!("{}x{}", n_obs, data.n_variables());
        group.throughput(Throughput::Elements((n_obs * data.n_variables()) as u64));

        group.bench_with_input(BenchmarkId::new("tree_build", &label), &data, |b, data| {
            b.iter(|| builder.build(data, max_c).expect("tree build failed"))
        });

        let tree = builder.build(&data, max_c).expect("tree build failed");
        group.bench_with_input(BenchmarkId::new("nesting", &label), &tree, |b, tree| {
            b.iter(|| quantifier.quantify(tree).expect("nesting failed"))
        });
        group.bench_with_input(BenchmarkId::new("entropy", &label), &tree, |b, tree| {
            b.iter(|| profiler.profile(tree, n_factors, 7).expect("entropy failed"))
        });
    }
    group.finish();
}

fn bench_clustering(c: &mut Criterion) {
    let data = LatentFactorDesign::block_structure(4, 10, 0.7).generate(300, 9);
    let variables = data.variables().to_vec();
    let mut group = c.benchmark_group("clustering");
    group.sample_size(10);
    for metric in [DistanceMetric::Correlation, DistanceMetric::DistanceCorrelation] {
        group.bench_function(metric.name().to_string(), |b| {
            b.iter(|| {
                let mut clusterer =
                    HierarchicalClusterer::new(metric.clone(), Arc::new(AgglomerativeLinkage::default()));
                clusterer
                    .cluster(ClusterInput::Data, &variables, data.values().t(), true)
                    .expect("clustering failed")
                    .dendrogram
                    .n_clusters()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_factor_hierarchy, bench_clustering);
criterion_main!(benches);
