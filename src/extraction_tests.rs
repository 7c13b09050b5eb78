use crate::config::ExtractionConfig;
use crate::error::AnalysisError;
use crate::extraction::{model_dof, FactorExtractor, PrincipalAxisExtractor};
use crate::stats::correlation_matrix;
use crate::synthetic::LatentFactorDesign;
use approx::assert_abs_diff_eq;
use ndarray::Axis;

fn block_data(n_obs: usize, seed: u64) -> crate::dataset::Dataset {
    LatentFactorDesign::block_structure(3, 4, 0.8).generate(n_obs, seed)
}

#[test]
fn recovers_block_structure_after_rotation() {
    let data = block_data(2000, 21);
    let solution = PrincipalAxisExtractor::default().fit(&data, 3).unwrap();
    assert_eq!(solution.loadings.dim(), (12, 3));
    assert_eq!(solution.scores.dim(), (2000, 3));

    // Each block of four variables should load on exactly one factor, and the three blocks on
    // three different factors.
    let mut block_factor = Vec::new();
    for block in 0..3 {
        let rows = solution.loadings.slice(ndarray::s![block * 4..block * 4 + 4, ..]);
        let mean_abs = rows.map_axis(Axis(0), |c| c.mapv(f64::abs).mean().unwrap());
        let (best, &best_value) = mean_abs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert!(best_value > 0.7, "block {} mean |loading| = {}", block, best_value);
        for (f, &v) in mean_abs.iter().enumerate() {
            if f != best {
                assert!(v < 0.15, "block {} cross-loads {} on factor {}", block, v, f);
            }
        }
        block_factor.push(best);
    }
    block_factor.sort_unstable();
    block_factor.dedup();
    assert_eq!(block_factor.len(), 3);

    for &h in solution.communalities().iter() {
        assert_abs_diff_eq!(h, 0.64, epsilon = 0.1);
    }
}

#[test]
fn factors_are_ordered_and_signed() {
    let data = block_data(500, 4);
    let solution = PrincipalAxisExtractor::default().fit(&data, 3).unwrap();
    let variance = solution.explained_variance();
    assert!(variance[0] >= variance[1] && variance[1] >= variance[2]);
    for column in solution.loadings.axis_iter(Axis(1)) {
        assert!(column.sum() > 0.0);
    }
}

#[test]
fn extraction_is_deterministic() {
    let data = block_data(300, 9);
    let extractor = PrincipalAxisExtractor::default();
    let a = extractor.fit(&data, 4).unwrap();
    let b = extractor.fit(&data, 4).unwrap();
    assert_eq!(a, b);
}

#[test]
fn information_criteria_prefer_the_generating_order() {
    let data = block_data(1000, 13);
    let corr = correlation_matrix(data.values().view()).unwrap();
    let extractor = PrincipalAxisExtractor::default();
    let bic: Vec<f64> = (1..=5)
        .map(|k| extractor.fit_correlation(&corr, 1000, k).unwrap().raw.bic())
        .collect();
    assert!(bic[2] < bic[0], "BIC(3) = {} vs BIC(1) = {}", bic[2], bic[0]);
    assert!(bic[2] < bic[1], "BIC(3) = {} vs BIC(2) = {}", bic[2], bic[1]);
    assert!(bic[2] < bic[4], "BIC(3) = {} vs BIC(5) = {}", bic[2], bic[4]);
}

#[test]
fn degrees_of_freedom_follow_the_closed_form() {
    assert_eq!(model_dof(12, 3), 33.0);
    assert_eq!(model_dof(3, 1), 0.0);
    assert!(model_dof(6, 4) < 0.0);
}

#[test]
fn stored_scores_verify_against_rescoring() {
    let data = block_data(400, 5);
    let solution = PrincipalAxisExtractor::default().fit(&data, 2).unwrap();
    let max_diff = solution.verify(&data).unwrap();
    assert!(max_diff < 1e-10, "max diff {}", max_diff);
}

#[test]
fn subset_scores_track_full_scores() {
    let data = block_data(800, 6);
    let solution = PrincipalAxisExtractor::default().fit(&data, 3).unwrap();
    let all: Vec<usize> = (0..12).collect();
    let full = solution.subset_scores(&data, &all).unwrap();
    for &r2 in full.r_squared.iter() {
        assert_abs_diff_eq!(r2, 1.0, epsilon = 1e-9);
    }
    let half: Vec<usize> = (0..12).step_by(2).collect();
    let partial = solution.subset_scores(&data, &half).unwrap();
    assert_eq!(partial.scores.dim(), (800, 3));
    assert!(partial.r_squared.iter().all(|&r2| (0.0..=1.0).contains(&r2)));
    assert!(partial.r_squared.iter().any(|&r2| r2 > 0.5));
}

#[test]
fn rejects_out_of_range_factor_counts() {
    let data = block_data(100, 1);
    let extractor = PrincipalAxisExtractor::default();
    assert!(matches!(extractor.fit(&data, 0), Err(AnalysisError::InvalidInput(_))));
    assert!(matches!(extractor.fit(&data, 13), Err(AnalysisError::InvalidInput(_))));
}

#[test]
fn strict_configuration_turns_non_convergence_into_an_extraction_error() {
    let data = block_data(200, 2);
    let strict = PrincipalAxisExtractor::new(ExtractionConfig {
        max_iterations: 1,
        require_convergence: true,
        ..ExtractionConfig::default()
    });
    match strict.fit(&data, 3) {
        Err(AnalysisError::Extraction { n_factors, .. }) => assert_eq!(n_factors, 3),
        other => panic!("expected an extraction error, got {:?}", other.map(|s| s.n_factors)),
    }

    let lenient = PrincipalAxisExtractor::new(ExtractionConfig {
        max_iterations: 1,
        ..ExtractionConfig::default()
    });
    let solution = lenient.fit(&data, 3).unwrap();
    assert!(!solution.raw.converged);
}
