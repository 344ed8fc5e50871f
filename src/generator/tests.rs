use std::collections::BTreeMap;

use super::*;
use crate::model::BoundsOverride;
use crate::space::ParameterSpace;

fn target() -> PropertyTarget {
    PropertyTarget {
        alpha: 0.20,
        epsilon: 0.80,
    }
}

fn sample_hint(space: &SystemSpace) -> GradientHint {
    let samples = space
        .templates
        .iter()
        .enumerate()
        .flat_map(|(index, template)| {
            let features = space.normalized_features(&template.recipe);
            (0..3).map(move |step| {
                let mut shifted = features.clone();
                shifted[step] = (shifted[step] + 0.1 * (index + 1) as f64).min(1.0);
                HintSample {
                    alpha: 0.1 + 0.2 * shifted[0],
                    epsilon: 0.9 - 0.1 * shifted[2],
                    features: shifted,
                }
            })
        })
        .collect::<Vec<HintSample>>();
    GradientHint::estimate(&space.system, &samples).expect("hint from template samples")
}

#[test]
fn same_seed_produces_byte_identical_candidates() {
    let space = ParameterSpace::builtin();
    let silicate = space.lookup("silicate").expect("registered");
    let generator = CandidateGenerator::new(GenerationMix::default());

    let first = generator
        .generate(silicate, &target(), 12, 123)
        .expect("generation succeeds");
    let second = generator
        .generate(silicate, &target(), 12, 123)
        .expect("generation succeeds");

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).expect("serialize"),
        serde_json::to_vec(&second).expect("serialize")
    );

    let other_seed = generator
        .generate(silicate, &target(), 12, 124)
        .expect("generation succeeds");
    assert_ne!(first, other_seed);
}

#[test]
fn every_candidate_lies_within_bounds_across_seeds() {
    let space = ParameterSpace::builtin();
    for system in space.system_ids() {
        let bounds = space.lookup(system).expect("registered");
        let generator = CandidateGenerator::new(GenerationMix::default())
            .with_hint(Some(sample_hint(bounds)));
        for seed in 0..25 {
            let candidates = generator
                .generate(bounds, &target(), 10, seed)
                .expect("generation succeeds");
            assert_eq!(candidates.len(), 10);
            for candidate in &candidates {
                for param in NumericParam::ALL {
                    let interval = bounds.bounds(param);
                    let value = candidate.recipe.value(param);
                    assert!(
                        interval.contains(value),
                        "{system} seed {seed} {}: {param}={value}",
                        candidate.candidate_id
                    );
                }
            }
        }
    }
}

#[test]
fn narrowed_space_is_respected() {
    let space = ParameterSpace::builtin();
    let narrowed = space
        .resolve(
            "silicate",
            Some(&BoundsOverride {
                numeric: BTreeMap::from([("voltage_v".to_string(), [300.0, 320.0])]),
                additives: None,
            }),
        )
        .expect("narrowing is allowed");

    let candidates = CandidateGenerator::new(GenerationMix::default())
        .generate(&narrowed, &target(), 8, 7)
        .expect("generation succeeds");
    assert!(
        candidates
            .iter()
            .all(|candidate| (300.0..=320.0).contains(&candidate.recipe.voltage_v))
    );
}

#[test]
fn directed_candidates_only_appear_with_a_matching_hint() {
    let space = ParameterSpace::builtin();
    let silicate = space.lookup("silicate").expect("registered");
    let zirconate = space.lookup("zirconate").expect("registered");

    let without = CandidateGenerator::new(GenerationMix::default())
        .generate(silicate, &target(), 8, 1)
        .expect("generation succeeds");
    assert!(
        without
            .iter()
            .all(|candidate| candidate.strategy != GenerationStrategy::Directed)
    );

    let with = CandidateGenerator::new(GenerationMix::default())
        .with_hint(Some(sample_hint(silicate)))
        .generate(silicate, &target(), 8, 1)
        .expect("generation succeeds");
    assert_eq!(
        with.iter()
            .filter(|candidate| candidate.strategy == GenerationStrategy::Directed)
            .count(),
        2
    );

    let foreign_hint = CandidateGenerator::new(GenerationMix::default())
        .with_hint(Some(sample_hint(silicate)))
        .generate(zirconate, &target(), 8, 1)
        .expect("generation succeeds");
    assert!(
        foreign_hint
            .iter()
            .all(|candidate| candidate.strategy != GenerationStrategy::Directed)
    );
}

#[test]
fn preferences_set_substrate_and_strip_fluoride() {
    let space = ParameterSpace::builtin();
    let silicate = space.lookup("silicate").expect("registered");
    let candidates = CandidateGenerator::new(GenerationMix::default())
        .with_preferences(RecipePreferences {
            substrate_alloy: Some("ZK60".to_string()),
            allow_fluoride: false,
        })
        .generate(silicate, &target(), 16, 99)
        .expect("generation succeeds");

    for candidate in &candidates {
        assert_eq!(candidate.recipe.substrate_alloy, "ZK60");
        assert!(
            candidate
                .recipe
                .additives
                .iter()
                .all(|dose| !silicate.is_fluoride(&dose.compound)),
            "{} kept a fluoride additive",
            candidate.candidate_id
        );
    }
}

#[test]
fn candidate_ids_are_stable_and_ordered() {
    let space = ParameterSpace::builtin();
    let silicate = space.lookup("silicate").expect("registered");
    let candidates = CandidateGenerator::new(GenerationMix::default())
        .generate(silicate, &target(), 3, 5)
        .expect("generation succeeds");
    let ids = candidates
        .iter()
        .map(|candidate| candidate.candidate_id.as_str())
        .collect::<Vec<&str>>();
    assert_eq!(ids, vec!["cand-5-000", "cand-5-001", "cand-5-002"]);
}
