//! Title deduplication through the public API.

use harvest_rs::dedup::{self, SimilarityClusterer};

#[test]
fn prefixed_headline_matches_plain_version() {
    let a = dedup::normalize_title("Aktuell: Neue Regeln für Ukrainer");
    let b = dedup::normalize_title("neue regeln fur ukrainer");
    assert!((dedup::similarity(&a, &b) - 1.0).abs() < 1e-9);

    let clusterer = SimilarityClusterer::new(0.6);
    assert!(clusterer.is_duplicate(
        "Aktuell: Neue Regeln für Ukrainer",
        "neue regeln fur ukrainer"
    ));
}

#[test]
fn similarity_ignores_argument_order() {
    let titles = [
        "Neue Regeln für Ukrainer",
        "Bundesregierung beschließt neue Asylregeln",
        "Regeln",
        "Sturmwarnung für die Nordseeküste",
        "Nordsee Sturm",
        "",
    ];
    for a in titles {
        for b in titles {
            let (na, nb) = (dedup::normalize_title(a), dedup::normalize_title(b));
            assert_eq!(
                dedup::similarity(&na, &nb),
                dedup::similarity(&nb, &na),
                "{a:?} / {b:?}"
            );
            let s = dedup::similarity(&na, &nb);
            assert!((0.0..=1.0).contains(&s));
        }
    }
}

#[test]
fn find_duplicate_reports_none_below_threshold() {
    let existing = vec!["Sturm über Hamburg".to_string(), "Börse im Plus".to_string()];
    let clusterer = SimilarityClusterer::default();
    assert!(clusterer.find_duplicate("Neue Regeln für Ukrainer", &existing).is_none());
    let m = clusterer
        .find_duplicate("Eilmeldung: Sturm über Hamburg", &existing)
        .unwrap();
    assert_eq!(m.index, 0);
}

#[test]
fn cluster_order_follows_input_order() {
    let items = ["Sturm über Hamburg", "Börse im Plus", "Breaking: Sturm über Hamburg"];
    let clusters = SimilarityClusterer::default().cluster_all(&items);
    assert_eq!(clusters, vec![vec![0, 2], vec![1]]);
}
