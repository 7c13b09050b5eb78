use factor_hierarchy::synthetic::LatentFactorDesign;
use factor_hierarchy::{AnalysisConfig, AnalysisEngines, AnalysisSession, BootstrapConfig, DatasetPair, DirectoryStore};
use std::sync::Arc;

fn main() {
    let data = LatentFactorDesign::block_structure(3, 4, 0.75).generate(300, 11);
    let mut config = AnalysisConfig::default().with_seed(11);
    config.parallel_iterations = 30;
    let engines = AnalysisEngines::from_config(&config);
    let pair = DatasetPair::imputed_only(data).expect("synthetic data is complete");
    let mut session = AnalysisSession::new(pair, config, engines);

    session.run_factor_analysis(false).expect("factor analysis failed");
    println!("Chosen factor counts: {:?}", session.metric_counts());
    let nesting = session.nesting_matrix(0.5);
    println!("Nesting explained score:\n{:.2}", nesting.explained_score);

    let dir = tempfile::tempdir().expect("cannot create a scratch directory");
    let store = Arc::new(DirectoryStore::new(dir.path()).expect("cannot open the record store"));
    let controller = session
        .resample_controller(BootstrapConfig {
            seed: Some(11),
            ..BootstrapConfig::default()
        })
        .expect("cannot start the bootstrap");
    let persisted = controller.run_many(8, store.clone());
    println!("{} repetitions on {} workers", persisted, controller.workers());

    for summary in controller.reduce(store.as_ref()).expect("cannot read bootstrap records") {
        println!("{} -> {:?}", summary.id, summary.counts);
    }
}
