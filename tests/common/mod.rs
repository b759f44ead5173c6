use drphylo::{
    Alphabet, LikelihoodConfig, MixedModelSet, MixtureModel, RateDistribution, SiteContainer,
    TransitionModel, Tree, K80,
};

/// Build a tree from `(id, father)` pairs, lengths in the same order, and
/// `(leaf id, name)` pairs.
#[allow(dead_code)]
pub fn tree(structure: &[(i32, Option<i32>)], lengths: &[f64], leaves: &[(i32, &str)]) -> Tree {
    Tree::from_structure(
        structure.to_vec(),
        lengths.to_vec(),
        leaves.iter().map(|(_, name)| name.to_string()).collect(),
        leaves.iter().map(|(id, _)| *id).collect(),
    )
    .unwrap()
}

/// (((A,B)5,C)6,(D,E)7)8
#[allow(dead_code)]
pub fn five_taxa() -> Tree {
    tree(
        &[
            (8, None),
            (6, Some(8)),
            (5, Some(6)),
            (0, Some(5)),
            (1, Some(5)),
            (2, Some(6)),
            (7, Some(8)),
            (3, Some(7)),
            (4, Some(7)),
        ],
        &[0.0, 0.08, 0.05, 0.12, 0.2, 0.3, 0.1, 0.15, 0.07],
        &[(0, "A"), (1, "B"), (2, "C"), (3, "D"), (4, "E")],
    )
}

#[allow(dead_code)]
pub fn dna(pairs: &[(&str, &str)]) -> SiteContainer {
    SiteContainer::from_pairs(Alphabet::dna(), pairs).unwrap()
}

#[allow(dead_code)]
pub fn binary(pairs: &[(&str, &str)]) -> SiteContainer {
    SiteContainer::from_pairs(Alphabet::binary(), pairs).unwrap()
}

#[allow(dead_code)]
pub fn five_taxa_dna() -> SiteContainer {
    dna(&[
        ("A", "ACGTTAGCAAGT"),
        ("B", "ACGTCAGCAAGC"),
        ("C", "ATGCTAGTAGGT"),
        ("D", "GTGCTACTAGAT"),
        ("E", "GTACTACTCGAT"),
    ])
}

#[allow(dead_code)]
pub fn kappa_mixture(kappas: &[f64], weights: &[f64]) -> MixtureModel {
    let components: Vec<Box<dyn TransitionModel>> = kappas
        .iter()
        .map(|&k| Box::new(K80::new(k).unwrap()) as Box<dyn TransitionModel>)
        .collect();
    MixtureModel::new("kappas", components, weights).unwrap()
}

/// Background K80 on every branch not listed in `groups`, then one model
/// per group.
#[allow(dead_code)]
pub fn model_set<M: Into<drphylo::BranchModel>>(tree: &Tree, groups: Vec<(M, Vec<i32>)>) -> MixedModelSet {
    let assigned: Vec<i32> = groups.iter().flat_map(|(_, nodes)| nodes.clone()).collect();
    let others: Vec<i32> = tree
        .branches_id()
        .into_iter()
        .filter(|n| !assigned.contains(n))
        .collect();
    let mut set = MixedModelSet::new();
    set.add_model(K80::new(2.0).unwrap(), &others).unwrap();
    for (model, nodes) in groups {
        set.add_model(model, &nodes).unwrap();
    }
    set
}

#[allow(dead_code)]
pub fn config() -> LikelihoodConfig {
    LikelihoodConfig::default()
}

#[allow(dead_code)]
pub fn constant() -> RateDistribution {
    RateDistribution::Constant
}
