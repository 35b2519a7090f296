use std::sync::Arc;

use sift_core::{SearchConfig, TagSource, TextOptions};
use sift_search::RecordIndex;

fn build(n: usize) -> RecordIndex {
    let records: Vec<usize> = (0..n).collect();
    let cfg = SearchConfig::new(|i: &usize| Ok(format!("rec-{i}")))
        .search_field("name", |i| Ok(format!("record {} zone{}", i, i % 7)))
        .filter_field("zone", |i| Ok(vec![format!("zone-{}", i % 7)]))
        // zone3 is one edit from every other zone
        .text_options(TextOptions { fuzzy: 0.0, ..TextOptions::default() });
    RecordIndex::build(&records, &cfg).unwrap()
}

#[test]
fn concurrent_queries_share_one_index() {
    let idx = Arc::new(build(700));
    let expected = idx.query("zone3").len();
    assert_eq!(expected, 100);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let idx = Arc::clone(&idx);
            std::thread::spawn(move || (0..50).map(|_| idx.query("zone3").len()).collect::<Vec<_>>())
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap().into_iter().all(|n| n == expected));
    }
}

#[test]
fn wildcard_visits_each_record_once() {
    let idx = build(257);
    let hits = idx.query("");
    assert_eq!(hits.len(), 257);
    assert!(hits.windows(2).all(|w| w[0].doc + 1 == w[1].doc));
    assert_eq!(idx.tags(hits[10].doc, 0), ["zone-3".to_string()]);
}
