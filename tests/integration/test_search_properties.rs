//! Ranking behaviour of fused search over pre-embedded vectors.

use bugscout::search::{FacetStatus, SkipReason};
use bugscout::{Facet, FacetVectors, FacetWeights, ProfileName, RowId, WeightOverride};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{create_test_kb, record, vectors};

fn summary_only() -> WeightOverride {
    WeightOverride::Facets(FacetWeights::new().with(Facet::Summary, 1.0))
}

#[test]
fn test_self_retrieval() {
    let (kb, _dir) = create_test_kb(8);
    let mut rng = StdRng::seed_from_u64(7);

    let mut stored = Vec::new();
    for i in 0..40 {
        let summary: Vec<f32> = (0..8).map(|_| rng.random_range(-1.0..1.0)).collect();
        let code: Vec<f32> = (0..8).map(|_| rng.random_range(-1.0..1.0)).collect();
        stored.push(summary.clone());
        kb.add_record(
            record(&format!("BUG-{i}"), "random"),
            FacetVectors::new()
                .with(Facet::Summary, summary)
                .with(Facet::Code, code),
        )
        .unwrap();
    }

    for (i, summary) in stored.iter().enumerate() {
        let response = kb
            .search(
                &vectors(&[(Facet::Summary, summary)]),
                &summary_only(),
                3,
            )
            .unwrap();
        let top = &response.hits[0];
        assert_eq!(top.row_id, RowId::new(i as u32), "record {i} not top-1");
        assert!(top.distance < 5e-3, "record {i} distance {}", top.distance);
    }
}

#[test]
fn test_toy_summary_ranking() {
    let (kb, _dir) = create_test_kb(2);
    for (i, v) in [[1.0f32, 0.0], [0.0, 1.0], [0.9, 0.1]].iter().enumerate() {
        kb.add_record(
            record(&format!("BUG-{i}"), "toy"),
            vectors(&[(Facet::Summary, v)]),
        )
        .unwrap();
    }

    let response = kb
        .search(&vectors(&[(Facet::Summary, &[1.0, 0.0])]), &summary_only(), 3)
        .unwrap();
    let order: Vec<u32> = response.hits.iter().map(|h| h.row_id.value()).collect();
    assert_eq!(order, vec![0, 2, 1]);
    assert!(response.hits[0].distance < response.hits[1].distance);
    assert_eq!(response.profile, Some(ProfileName::Custom));
}

#[test]
fn test_unpopulated_facet_gives_no_false_positive() {
    let (kb, _dir) = create_test_kb(2);
    kb.add_record(
        record("LOG-ONLY", "only a log"),
        vectors(&[(Facet::LogInfo, &[1.0, 0.0])]),
    )
    .unwrap();
    kb.add_record(
        record("WITH-SUMMARY", "has a summary"),
        vectors(&[(Facet::Summary, &[0.0, 1.0])]),
    )
    .unwrap();

    let response = kb
        .search(
            &vectors(&[(Facet::Summary, &[1.0, 0.0])]),
            &WeightOverride::Auto,
            10,
        )
        .unwrap();
    assert_eq!(response.profile, Some(ProfileName::SummaryOnly));
    assert!(
        response
            .hits
            .iter()
            .all(|hit| hit.record.identifier != "LOG-ONLY")
    );
    assert_eq!(response.hits.len(), 1);
}

#[test]
fn test_missing_facet_does_not_suppress_record() {
    let (kb, _dir) = create_test_kb(2);
    // Summary only, no log vector
    kb.add_record(
        record("NO-LOG", "summary only"),
        vectors(&[(Facet::Summary, &[1.0, 0.0])]),
    )
    .unwrap();
    kb.add_record(
        record("BOTH", "summary and log"),
        vectors(&[(Facet::Summary, &[0.0, 1.0]), (Facet::LogInfo, &[1.0, 0.0])]),
    )
    .unwrap();

    let response = kb
        .search(
            &vectors(&[(Facet::Summary, &[1.0, 0.0]), (Facet::LogInfo, &[1.0, 0.0])]),
            &WeightOverride::Auto,
            10,
        )
        .unwrap();
    assert_eq!(response.profile, Some(ProfileName::Mixed));

    let no_log = response
        .hits
        .iter()
        .find(|hit| hit.record.identifier == "NO-LOG")
        .expect("record without a log vector still ranks via summary");
    assert_eq!(no_log.facet_distances.len(), 1);
    assert_eq!(no_log.facet_distances[0].facet, Facet::Summary);
    assert!(no_log.distance < 1e-3);
}

#[test]
fn test_raising_weight_never_lowers_facet_influence() {
    let (kb, _dir) = create_test_kb(2);
    // SUMMARY-MATCH wins on summary, LOG-MATCH wins on log
    kb.add_record(
        record("SUMMARY-MATCH", "a"),
        vectors(&[(Facet::Summary, &[1.0, 0.0]), (Facet::LogInfo, &[0.0, 1.0])]),
    )
    .unwrap();
    kb.add_record(
        record("LOG-MATCH", "b"),
        vectors(&[(Facet::Summary, &[0.6, 0.8]), (Facet::LogInfo, &[1.0, 0.0])]),
    )
    .unwrap();

    let query = vectors(&[(Facet::Summary, &[1.0, 0.0]), (Facet::LogInfo, &[1.0, 0.0])]);
    let rank_of_summary_match = |summary_weight: f32| {
        let weights = FacetWeights::new()
            .with(Facet::Summary, summary_weight)
            .with(Facet::LogInfo, 1.0 - summary_weight);
        let response = kb
            .search(&query, &WeightOverride::Facets(weights), 2)
            .unwrap();
        response
            .hits
            .iter()
            .position(|hit| hit.record.identifier == "SUMMARY-MATCH")
            .unwrap()
    };

    let ranks: Vec<usize> = (1..20)
        .map(|step| rank_of_summary_match(step as f32 * 0.05))
        .collect();
    assert!(ranks.windows(2).all(|w| w[1] <= w[0]), "ranks: {ranks:?}");
    assert_eq!(ranks.first(), Some(&1));
    assert_eq!(ranks.last(), Some(&0));
}

#[test]
fn test_test_narrative_fields_share_one_weight() {
    let (kb, _dir) = create_test_kb(2);
    kb.add_record(
        record("BUG-1", "x"),
        vectors(&[
            (Facet::TestSteps, &[1.0, 0.0]),
            (Facet::ExpectedResult, &[1.0, 0.0]),
        ]),
    )
    .unwrap();

    let response = kb
        .search(
            &vectors(&[
                (Facet::TestSteps, &[1.0, 0.0]),
                (Facet::ExpectedResult, &[0.0, 1.0]),
            ]),
            &WeightOverride::Auto,
            5,
        )
        .unwrap();
    assert_eq!(response.profile, Some(ProfileName::TestInfoOnly));

    let hit = &response.hits[0];
    for fd in &hit.facet_distances {
        assert!((fd.weight - 0.5).abs() < 1e-6);
    }
    // Mean of 0 and sqrt(2)
    assert!((hit.distance - std::f32::consts::SQRT_2 / 2.0).abs() < 1e-4);
}

#[test]
fn test_empty_query_and_wrong_dimension() {
    let (kb, _dir) = create_test_kb(2);
    kb.add_record(
        record("BUG-1", "x"),
        vectors(&[(Facet::Summary, &[1.0, 0.0]), (Facet::Code, &[0.0, 1.0])]),
    )
    .unwrap();

    let empty = kb
        .search(&FacetVectors::new(), &WeightOverride::Auto, 5)
        .unwrap();
    assert!(empty.hits.is_empty());
    assert_eq!(empty.profile, None);

    // A wrong-size query vector skips its facet, the other facet still answers
    let response = kb
        .search(
            &vectors(&[(Facet::Summary, &[1.0, 0.0]), (Facet::Code, &[1.0, 0.0, 0.0])]),
            &WeightOverride::Auto,
            5,
        )
        .unwrap();
    assert_eq!(response.hits.len(), 1);
    let code = response
        .facets
        .iter()
        .find(|report| report.facet == Facet::Code)
        .unwrap();
    assert!(matches!(
        code.status,
        FacetStatus::Skipped(SkipReason::DimensionMismatch {
            expected: 2,
            actual: 3
        })
    ));
}
