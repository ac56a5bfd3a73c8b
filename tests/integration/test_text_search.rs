//! Text entry points: embedding on ingest, text queries and duplicate checks.

use bugscout::{DefectRecord, Facet, KbError, ProfileName, TextQuery, WeightOverride};

use crate::common::{create_test_kb, create_text_kb, record};

fn seed_records() -> Vec<DefectRecord> {
    let mut login = record("BUG-1", "App crash on login screen");
    login.log_info = "null pointer dereference in login handler".to_string();

    let mut upload = record("BUG-2", "Upload stalls with timeout on android");
    upload.log_info = "socket timeout after 30s".to_string();
    upload.environment = "android 14".to_string();

    let mut payment = record("BUG-3", "Payment page crash on ios");
    payment.environment = "ios 17".to_string();

    let slow_login = record("BUG-4", "Login timeout on ios");
    vec![login, upload, payment, slow_login]
}

#[test]
fn test_text_search_ranks_matching_record_first() {
    let (kb, _dir) = create_text_kb();
    let report = kb.add_records_text(seed_records()).unwrap();
    assert_eq!(report.row_ids.len(), 4);
    assert!(report.is_complete());

    let query = TextQuery::new()
        .summary("crash while opening login")
        .log_info("null value");
    let response = kb.search_text(&query, &WeightOverride::Auto, 3).unwrap();

    assert_eq!(response.profile, Some(ProfileName::Mixed));
    assert_eq!(response.hits.len(), 3);
    assert_eq!(response.hits[0].record.identifier, "BUG-1");
    assert!(
        response
            .hits
            .windows(2)
            .all(|w| w[0].distance <= w[1].distance)
    );
}

#[test]
fn test_profile_override_limits_facets() {
    let (kb, _dir) = create_text_kb();
    kb.add_records_text(seed_records()).unwrap();

    let query = TextQuery::new()
        .summary("payment crash")
        .environment("android");
    let response = kb
        .search_text(
            &query,
            &WeightOverride::Profile(ProfileName::EnvironmentOnly),
            1,
        )
        .unwrap();
    assert_eq!(response.profile, Some(ProfileName::EnvironmentOnly));
    assert_eq!(response.hits[0].record.identifier, "BUG-2");
    assert!(
        response.hits[0]
            .facet_distances
            .iter()
            .all(|fd| fd.facet == Facet::Environment)
    );
}

#[test]
fn test_find_duplicates() {
    let (kb, _dir) = create_text_kb();
    kb.add_records_text(seed_records()).unwrap();

    let mut candidate = record("NEW-1", "App crash on login screen");
    candidate.log_info = "null pointer dereference in login handler".to_string();
    let duplicates = kb.find_duplicates(&candidate).unwrap();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].record.identifier, "BUG-1");
    assert!(duplicates[0].similarity() > 0.99);

    let unrelated = record("NEW-2", "payment upload");
    let duplicates = kb.find_duplicates(&unrelated).unwrap();
    assert!(duplicates.is_empty());
}

#[test]
fn test_text_entry_points_need_an_embedder() {
    let (kb, _dir) = create_test_kb(4);
    let err = kb
        .search_text(
            &TextQuery::new().summary("crash"),
            &WeightOverride::Auto,
            5,
        )
        .unwrap_err();
    assert!(matches!(err, KbError::NoEmbedder));

    // An empty query never reaches the embedder
    let response = kb
        .search_text(&TextQuery::new(), &WeightOverride::Auto, 5)
        .unwrap();
    assert!(response.is_empty());
}

#[test]
fn test_legacy_export_is_indexed_with_code_facet() {
    let (kb, _dir) = create_text_kb();
    let json = r#"[{
        "bug_id": "LEGACY-7",
        "summary": "Upload crash",
        "is_reappear": "yes",
        "fix_person": "carol",
        "create_at": "2023-11-05 08:30:00",
        "fix_date": "2023-11-07",
        "code_diffs": [
            "--- a/src/upload.rs\n+++ b/src/upload.rs\n@@ -1 +1 @@\n-retry_upload(null)\n+retry_upload(timeout)"
        ]
    }]"#;
    let records: Vec<DefectRecord> = serde_json::from_str(json).unwrap();
    let report = kb.add_records_text(records).unwrap();
    assert!(matches!(
        report.facets[&Facet::Code],
        bugscout::FacetOutcome::Rebuilt { items: 1, .. }
    ));

    let (_, stored) = kb.find_by_identifier("LEGACY-7").unwrap();
    assert!(stored.is_reproducible());
    assert_eq!(stored.fix_owner.as_deref(), Some("carol"));
    assert_eq!(stored.file_paths, vec!["src/upload.rs"]);
    assert_eq!(stored.aggregated_added_code, "retry_upload(timeout)");
    assert_eq!(stored.aggregated_removed_code, "retry_upload(null)");
    assert_eq!(
        stored.fixed_at.unwrap().to_string(),
        "2023-11-07 00:00:00"
    );

    let response = kb
        .search_text(
            &TextQuery::new().code("upload timeout null"),
            &WeightOverride::Auto,
            1,
        )
        .unwrap();
    assert_eq!(response.profile, Some(ProfileName::CodeOnly));
    assert_eq!(response.hits[0].record.identifier, "LEGACY-7");
}
