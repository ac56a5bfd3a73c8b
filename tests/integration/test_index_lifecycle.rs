//! Rebuild protocol and on-disk snapshot behaviour seen through the
//! knowledge base.

use bugscout::index::FacetOutcome;
use bugscout::search::{FacetStatus, SkipReason};
use bugscout::storage::stage_bytes;
use bugscout::{Facet, FacetHealth, FacetVectors, KnowledgeBase, WeightOverride};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::common::{create_test_kb, record, toy_settings, vectors};

fn random_vector(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect()
}

fn summary_and_log(kb: &KnowledgeBase, identifier: &str, summary: &[f32], log: &[f32]) {
    kb.add_record(
        record(identifier, "x"),
        vectors(&[(Facet::Summary, summary), (Facet::LogInfo, log)]),
    )
    .unwrap();
}

#[test]
fn test_rebuild_is_idempotent() {
    let (kb, _dir) = create_test_kb(8);
    let mut rng = StdRng::seed_from_u64(11);
    let batch: Vec<_> = (0..30)
        .map(|i| {
            (
                record(&format!("BUG-{i}"), "batch"),
                FacetVectors::new().with(Facet::Summary, random_vector(&mut rng, 8)),
            )
        })
        .collect();
    kb.add_batch(batch).unwrap();

    let probe = random_vector(&mut rng, 8);
    let before = kb.index(Facet::Summary);
    let before_hits = before.forest().unwrap().get_nearest(&probe, 5).unwrap();

    for _ in 0..2 {
        let outcome = kb.rebuild_facet(Facet::Summary);
        assert_eq!(
            outcome,
            FacetOutcome::Rebuilt {
                items: 30,
                rejected: Vec::new()
            }
        );
    }

    let after = kb.index(Facet::Summary);
    assert_eq!(before.forest(), after.forest());
    let after_hits = after.forest().unwrap().get_nearest(&probe, 5).unwrap();
    assert_eq!(before_hits, after_hits);
}

#[test]
fn test_abandoned_stage_leaves_canonical_snapshot() {
    let (kb, _dir) = create_test_kb(2);
    summary_and_log(&kb, "BUG-1", &[1.0, 0.0], &[0.0, 1.0]);
    let path = kb.index_path(Facet::Summary);
    let canonical = std::fs::read(&path).unwrap();

    // Simulated crash between staging and rename
    let staged = stage_bytes(&kb.settings().scratch_path(), b"half written garbage").unwrap();
    let staged_path = staged.path().to_path_buf();
    drop(staged);

    assert!(!staged_path.exists());
    assert_eq!(std::fs::read(&path).unwrap(), canonical);

    kb.refresh();
    assert_eq!(
        kb.index(Facet::Summary).health(),
        FacetHealth::Ready { items: 1 }
    );
}

#[test]
fn test_truncated_snapshot_only_disables_its_facet() {
    let temp_dir = TempDir::new().unwrap();
    {
        let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
        summary_and_log(&kb, "BUG-1", &[1.0, 0.0], &[1.0, 0.0]);
        summary_and_log(&kb, "BUG-2", &[0.0, 1.0], &[0.0, 1.0]);
        std::fs::write(kb.index_path(Facet::Summary), b"").unwrap();
    }

    let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
    assert!(matches!(
        kb.index(Facet::Summary).health(),
        FacetHealth::Unavailable { .. }
    ));

    let response = kb
        .search(
            &vectors(&[(Facet::Summary, &[1.0, 0.0]), (Facet::LogInfo, &[1.0, 0.0])]),
            &WeightOverride::Auto,
            5,
        )
        .unwrap();

    assert_eq!(response.hits[0].record.identifier, "BUG-1");
    assert!(
        response
            .hits
            .iter()
            .all(|hit| hit.facet_distances.iter().all(|fd| fd.facet == Facet::LogInfo))
    );
    let summary = response
        .facets
        .iter()
        .find(|report| report.facet == Facet::Summary)
        .unwrap();
    assert!(matches!(
        summary.status,
        FacetStatus::Skipped(SkipReason::Unavailable { .. })
    ));

    let report = kb.verify();
    assert!(!report.is_consistent());
    assert!(report.unavailable.contains_key(&Facet::Summary));
}

#[test]
fn test_bad_vector_fails_only_its_facet() {
    let (kb, _dir) = create_test_kb(2);
    summary_and_log(&kb, "BUG-1", &[1.0, 0.0], &[1.0, 0.0]);
    let log_before = kb.index(Facet::LogInfo);

    let report = kb
        .add_record(
            record("BUG-2", "bad log"),
            vectors(&[(Facet::Summary, &[0.0, 1.0]), (Facet::LogInfo, &[1.0, 0.0, 0.0])]),
        )
        .unwrap();

    assert_eq!(report.failed_facets(), vec![Facet::LogInfo]);
    assert_eq!(
        report.facets[&Facet::Summary],
        FacetOutcome::Rebuilt {
            items: 2,
            rejected: Vec::new()
        }
    );
    assert_eq!(report.facets[&Facet::Code], FacetOutcome::Unchanged);
    assert_eq!(log_before.forest(), kb.index(Facet::LogInfo).forest());

    // The record is stored and searchable through its good facet
    assert!(kb.find_by_identifier("BUG-2").is_some());
    let response = kb
        .search(&vectors(&[(Facet::Summary, &[0.0, 1.0])]), &WeightOverride::Auto, 1)
        .unwrap();
    assert_eq!(response.hits[0].record.identifier, "BUG-2");
}

#[test]
fn test_snapshots_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
        summary_and_log(&kb, "BUG-1", &[1.0, 0.0], &[0.0, 1.0]);
        summary_and_log(&kb, "BUG-2", &[0.0, 1.0], &[1.0, 0.0]);
    }

    let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
    let stats = kb.stats();
    assert_eq!(stats.records, 2);
    assert_eq!(stats.next_id.value(), 2);
    let summary = stats
        .facets
        .iter()
        .find(|facet| facet.facet == Facet::Summary)
        .unwrap();
    assert_eq!(summary.health, FacetHealth::Ready { items: 2 });

    // A third record copies both existing rows forward
    summary_and_log(&kb, "BUG-3", &[0.7, 0.7], &[0.7, 0.7]);
    assert_eq!(
        kb.index(Facet::Summary).health(),
        FacetHealth::Ready { items: 3 }
    );
    let response = kb
        .search(&vectors(&[(Facet::Summary, &[0.0, 1.0])]), &WeightOverride::Auto, 1)
        .unwrap();
    assert_eq!(response.hits[0].record.identifier, "BUG-2");
    assert!(kb.verify().is_consistent());
}
