//! Mixture decomposition checked against explicit sums of homogeneous
//! likelihoods.

mod common;

use approx::assert_abs_diff_eq;
use drphylo::{
    DrTreeLikelihood, HyperNode, LikelihoodConfig, MixedTreeLikelihood, Parameter, ParameterList,
    PhyloError, RateDistribution, K80,
};

const KAPPAS: [f64; 2] = [1.0, 5.0];
const WEIGHTS: [f64; 2] = [0.3, 0.7];

fn fixed(groups: Vec<(f64, Vec<i32>)>) -> DrTreeLikelihood {
    let tree = common::five_taxa();
    let groups = groups
        .into_iter()
        .map(|(kappa, nodes)| (K80::new(kappa).unwrap(), nodes))
        .collect();
    let set = common::model_set(&tree, groups);
    DrTreeLikelihood::new(tree, set, common::constant(), &common::five_taxa_dna(), common::config()).unwrap()
}

fn mixed_with(groups: Vec<Vec<i32>>, config: LikelihoodConfig) -> MixedTreeLikelihood {
    let tree = common::five_taxa();
    let groups = groups
        .into_iter()
        .map(|nodes| (common::kappa_mixture(&KAPPAS, &WEIGHTS), nodes))
        .collect();
    let set = common::model_set(&tree, groups);
    MixedTreeLikelihood::new(tree, set, common::constant(), &common::five_taxa_dna(), config).unwrap()
}

fn mixed(groups: Vec<Vec<i32>>) -> MixedTreeLikelihood {
    mixed_with(groups, common::config())
}

fn set_value(lik: &mut MixedTreeLikelihood, name: &str, value: f64) -> f64 {
    let update: ParameterList = std::iter::once(Parameter::new(name, value)).collect();
    lik.set_parameters(&update).unwrap();
    lik.log_likelihood()
}

fn check_derivatives(lik: &mut MixedTreeLikelihood, name: &str) {
    let x = lik.parameters().value(name).unwrap();
    let d = lik.d_log_likelihood(name).unwrap();
    let d2 = lik.d2_log_likelihood(name).unwrap();
    let h = 1e-5;
    let up = set_value(lik, name, x + h);
    let down = set_value(lik, name, x - h);
    let mid = set_value(lik, name, x);
    assert_abs_diff_eq!(d, (up - down) / (2.0 * h), epsilon = 1e-5);
    assert_abs_diff_eq!(d2, (up - 2.0 * mid + down) / (h * h), epsilon = 1e-2);
}

#[test]
fn test_two_independent_mixtures() {
    let lik = mixed(vec![vec![0, 1], vec![3, 4]]);

    let nodes: Vec<i32> = lik.expansion_points().iter().map(|p| p.node).collect();
    assert_eq!(nodes, vec![8, 5, 7]);

    let mut expected = ndarray::Array1::<f64>::zeros(lik.pattern_likelihoods().len());
    for (i, &k1) in KAPPAS.iter().enumerate() {
        for (j, &k2) in KAPPAS.iter().enumerate() {
            let l = fixed(vec![(k1, vec![0, 1]), (k2, vec![3, 4])]);
            expected.scaled_add(WEIGHTS[i] * WEIGHTS[j], l.pattern_likelihoods());
        }
    }
    for (a, b) in lik.pattern_likelihoods().iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_mixture_across_the_root() {
    let mut lik = mixed(vec![vec![0, 3]]);

    // The sub-likelihood below the main one expands at its own upper node
    let points = lik.expansion_points();
    assert_eq!(points.len(), 2);
    assert!(points.iter().all(|p| p.node == 8));
    for (p, w) in points[1].sub_probabilities.iter().zip(WEIGHTS) {
        assert_abs_diff_eq!(*p, w, epsilon = 1e-12);
    }

    let l1 = fixed(vec![(KAPPAS[0], vec![0, 3])]);
    let l5 = fixed(vec![(KAPPAS[1], vec![0, 3])]);
    let expected = l1.pattern_likelihoods() * WEIGHTS[0] + l5.pattern_likelihoods() * WEIGHTS[1];
    for (a, b) in lik.pattern_likelihoods().iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }

    check_derivatives(&mut lik, "BrLen0");
    check_derivatives(&mut lik, "BrLen6");
}

#[test]
fn test_sub_probabilities_sum_to_owner_probability() {
    let lik = mixed(vec![vec![0, 1], vec![3, 4, 7]]);
    for point in lik.expansion_points() {
        let total: f64 = point.sub_probabilities.iter().sum();
        assert_abs_diff_eq!(total, point.probability, epsilon = 1e-12);
    }
    assert_eq!(lik.probability(), 1.0);
}

#[test]
fn test_registered_hyper_nodes() {
    let tree = common::five_taxa();
    let groups = vec![(common::kappa_mixture(&KAPPAS, &WEIGHTS), vec![0, 1])];
    let mut set = common::model_set(&tree, groups);
    set.add_hyper_node(HyperNode::new(vec![vec![], vec![0]])).unwrap();
    set.add_hyper_node(HyperNode::new(vec![vec![], vec![1]])).unwrap();
    let lik = MixedTreeLikelihood::new(tree, set, common::constant(), &common::five_taxa_dna(), common::config())
        .unwrap();

    let points = lik.expansion_points();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].node, 8);
    assert_abs_diff_eq!(points[0].sub_probabilities[0], 0.3, epsilon = 1e-12);
    assert_abs_diff_eq!(points[0].sub_probabilities[1], 0.7, epsilon = 1e-12);

    let automatic = mixed(vec![vec![0, 1]]);
    assert_abs_diff_eq!(lik.log_likelihood(), automatic.log_likelihood(), epsilon = 1e-10);
}

#[test]
fn test_derivatives_below_and_above_expansions() {
    let mut lik = mixed(vec![vec![0, 1], vec![3, 4]]);
    for name in ["BrLen0", "BrLen5", "BrLen6", "BrLen2", "BrLen4"] {
        check_derivatives(&mut lik, name);
    }
}

#[test]
fn test_root_reparametrisation_derivatives() {
    let config = LikelihoodConfig {
        reparametrize_root: true,
        ..LikelihoodConfig::default()
    };
    let mut lik = mixed_with(vec![vec![0, 1]], config);
    assert_abs_diff_eq!(lik.parameters().value("BrLenRoot").unwrap(), 0.18, epsilon = 1e-12);
    assert!(!lik.parameters().has("BrLen6"));
    check_derivatives(&mut lik, "BrLenRoot");
    check_derivatives(&mut lik, "RootPosition");
}

#[test]
fn test_rate_change_matches_fresh_computation() {
    let tree = common::five_taxa();
    let build = |p: f64| {
        let groups = vec![(common::kappa_mixture(&KAPPAS, &WEIGHTS), vec![0, 1])];
        let set = common::model_set(&tree, groups);
        MixedTreeLikelihood::new(
            tree.clone(),
            set,
            RateDistribution::Invariant { p },
            &common::five_taxa_dna(),
            common::config(),
        )
        .unwrap()
    };
    let mut lik = build(0.1);
    let update: ParameterList = std::iter::once(Parameter::new("Invariant.p", 0.35)).collect();
    lik.set_parameters(&update).unwrap();
    assert_abs_diff_eq!(lik.log_likelihood(), build(0.35).log_likelihood(), epsilon = 1e-10);
}

#[test]
fn test_rejected_update_leaves_state_untouched() {
    let mut lik = mixed(vec![vec![2, 3]]);
    let before = lik.log_likelihood();
    let points = lik.expansion_points();

    let update: ParameterList = vec![Parameter::new("BrLen0", 0.5), Parameter::new("relproba1_2", 1.5)]
        .into_iter()
        .collect();
    let err = lik.set_parameters(&update).unwrap_err();
    assert!(matches!(err, PhyloError::ParameterOutOfBounds { .. }));
    assert_eq!(lik.tree().distance_to_father(0).unwrap(), Some(0.12));
    assert_eq!(lik.parameters().value("BrLen0").unwrap(), 0.12);
    assert_eq!(lik.log_likelihood(), before);
    assert_eq!(lik.expansion_points(), points);

    // A valid update afterwards still applies cleanly
    set_value(&mut lik, "BrLen0", 0.5);
    assert_eq!(lik.tree().distance_to_father(0).unwrap(), Some(0.5));
}

#[test]
fn test_set_data() {
    let mut lik = mixed(vec![vec![0, 1]]);
    let before = lik.log_likelihood();
    let other = common::dna(&[
        ("A", "AAAA"),
        ("B", "AAAG"),
        ("C", "AACA"),
        ("D", "ATAA"),
        ("E", "AAAA"),
    ]);
    lik.set_data(&other).unwrap();
    assert!(lik.log_likelihood() > before);
    assert!(lik.likelihood_for_site(4).is_err());
}

#[test]
fn test_incomplete_model_set_is_rejected() {
    let tree = common::five_taxa();
    let mut set = drphylo::MixedModelSet::new();
    set.add_model(common::kappa_mixture(&KAPPAS, &WEIGHTS), &[0, 1]).unwrap();
    let err = MixedTreeLikelihood::new(tree, set, common::constant(), &common::five_taxa_dna(), common::config())
        .unwrap_err();
    assert!(matches!(err, PhyloError::ModelSetNotFullySetUp(_)));
}
