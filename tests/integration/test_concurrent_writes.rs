//! Concurrent writers and readers sharing one knowledge base.

use std::sync::atomic::{AtomicBool, Ordering};

use bugscout::{Facet, FacetHealth, KnowledgeBase, WeightOverride};
use tempfile::TempDir;

use crate::common::{create_test_kb, record, toy_settings, vectors};

const WRITERS: usize = 4;
const PER_WRITER: usize = 10;

fn write_batch(kb: &KnowledgeBase, writer: usize) {
    for i in 0..PER_WRITER {
        let angle = (writer * PER_WRITER + i) as f32 * 0.05;
        let v = [angle.cos(), angle.sin()];
        let report = kb
            .add_record(
                record(&format!("BUG-{writer}-{i}"), "concurrent"),
                vectors(&[(Facet::Summary, &v), (Facet::LogInfo, &[v[1], v[0]])]),
            )
            .unwrap();
        assert!(report.is_complete());
    }
}

#[test]
fn test_concurrent_writers_lose_nothing() {
    let (kb, _dir) = create_test_kb(2);
    let kb = &kb;
    let writers_done = &AtomicBool::new(false);

    std::thread::scope(|scope| {
        let reader = scope.spawn(move || {
            let mut searches = 0;
            while !writers_done.load(Ordering::Acquire) || searches < 50 {
                let response = kb
                    .search(
                        &vectors(&[(Facet::Summary, &[1.0, 0.0]), (Facet::LogInfo, &[0.0, 1.0])]),
                        &WeightOverride::Auto,
                        5,
                    )
                    .unwrap();
                assert!(
                    response
                        .hits
                        .windows(2)
                        .all(|w| w[0].distance <= w[1].distance)
                );
                // A snapshot is either complete or not there yet
                for facet in [Facet::Summary, Facet::LogInfo] {
                    assert!(!matches!(
                        kb.index(facet).health(),
                        FacetHealth::Unavailable { .. }
                    ));
                }
                searches += 1;
            }
            searches
        });

        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| scope.spawn(move || write_batch(kb, writer)))
            .collect();
        for handle in writers {
            handle.join().unwrap();
        }
        writers_done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() >= 50);
    });

    let total = WRITERS * PER_WRITER;
    assert_eq!(kb.index(Facet::Summary).len(), total);
    assert_eq!(kb.index(Facet::LogInfo).len(), total);
    assert_eq!(kb.stats().records, total);
    assert_eq!(kb.stats().next_id.value() as usize, total);
    assert!(kb.verify().is_consistent());

    for writer in 0..WRITERS {
        for i in 0..PER_WRITER {
            assert!(kb.find_by_identifier(&format!("BUG-{writer}-{i}")).is_some());
        }
    }
}

#[test]
fn test_concurrent_writes_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let kb = &KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
        std::thread::scope(|scope| {
            for writer in 0..WRITERS {
                scope.spawn(move || write_batch(kb, writer));
            }
        });
    }

    let kb = KnowledgeBase::open(toy_settings(&temp_dir, 2)).unwrap();
    let total = WRITERS * PER_WRITER;
    assert_eq!(
        kb.index(Facet::Summary).health(),
        FacetHealth::Ready { items: total }
    );
    assert_eq!(kb.stats().records, total);
    assert!(kb.verify().is_consistent());
}
