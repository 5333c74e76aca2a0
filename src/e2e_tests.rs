//! End-to-end scenarios over the collection facade and the mmap path.

use crate::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tempfile::tempdir;

fn three_node_collection(path: &std::path::Path) -> Collection {
    let mut collection = Collection::open(path, 3).unwrap();
    collection.insert(vec![0.1, 0.2, 0.3], "A").unwrap();
    collection.insert(vec![0.1, 0.3, 0.2], "B").unwrap();
    collection.insert(vec![0.9, 0.1, 0.05], "C").unwrap();
    collection
}

#[test]
fn tiny_three_dimensional_search() {
    let dir = tempdir().unwrap();
    let collection = three_node_collection(&dir.path().join("tree.bin"));

    let results = collection.search(&[0.1, 0.25, 0.25], 0.2, 0.5, 2).unwrap();
    assert_eq!(results, vec!["A", "B"]);
}

#[test]
fn zero_epsilon_matches_exact_key_only() {
    let dir = tempdir().unwrap();
    let collection = three_node_collection(&dir.path().join("tree.bin"));

    let results = collection.search(&[0.1, 0.2, 0.3], 0.0, 0.0, 5).unwrap();
    assert_eq!(results, vec!["A"]);
}

#[test]
fn metadata_filter_selects_matching_node() {
    let dir = tempdir().unwrap();
    let mut collection = Collection::open(dir.path().join("tree.bin"), 2).unwrap();

    collection
        .insert_with_metadata(
            vec![0.0, 0.0],
            "x",
            Some(Metadata::from([("cat".to_string(), json!("a"))])),
        )
        .unwrap();
    collection
        .insert_with_metadata(
            vec![0.0, 0.0],
            "y",
            Some(Metadata::from([("cat".to_string(), json!("b"))])),
        )
        .unwrap();

    let filter = SearchFilter::new().eq("cat", "a");
    let results = collection
        .search_with_filter(&[0.0, 0.0], 0.1, 0.0, 5, &filter)
        .unwrap();
    assert_eq!(results, vec!["x"]);
}

#[test]
fn persistence_roundtrip_preserves_search_results() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.bin");
    let mut rng = StdRng::seed_from_u64(42);

    let mut collection = Collection::open(&path, 8).unwrap();
    for i in 0..10 {
        let key: Vec<f32> = (0..8).map(|_| rng.gen_range(0.0..1.0)).collect();
        collection.insert(key, format!("node-{i}")).unwrap();
    }

    let query: Vec<f32> = (0..8).map(|_| rng.gen_range(0.0..1.0)).collect();
    let before = collection.search(&query, 0.5, 0.2, 10).unwrap();

    collection.flush().unwrap();
    drop(collection);

    let reopened = Collection::open(&path, 8).unwrap();
    let after = reopened.search(&query, 0.5, 0.2, 10).unwrap();

    assert_eq!(before, after);
}

#[test]
fn dimension_mismatch_rejected_without_mutation() {
    let dir = tempdir().unwrap();
    let mut collection = Collection::open(dir.path().join("tree.bin"), 4).unwrap();

    let err = collection.insert(vec![0.1, 0.2, 0.3], "bad").unwrap_err();
    assert!(matches!(
        err,
        CollectionError::Tree(TreeError::DimensionMismatch { expected: 4, got: 3 })
    ));
    assert_eq!(collection.node_count(), 0);
}

#[test]
fn mmap_open_defers_index_builds_to_first_query() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.bin");
    let mut rng = StdRng::seed_from_u64(7);

    let dims = 32;
    let mut collection = Collection::open(&path, dims).unwrap();
    let items = (0..1000)
        .map(|i| {
            let key: Vec<f32> = (0..dims).map(|_| rng.gen_range(0.0..1.0)).collect();
            BatchItem::new(key, format!("node-{i}"))
        })
        .collect();
    collection.batch_insert(items).unwrap();
    drop(collection);

    let mapped = MmapStorage::open(&path).unwrap();
    assert_eq!(mapped.node_count(), 1000);
    assert_eq!(mapped.built_index_count(), 0);

    let query: Vec<f32> = (0..dims).map(|_| rng.gen_range(0.0..1.0)).collect();
    let params = SearchParams::new(0.45, 0.2, 10);
    let lazy = mapped.search(&query, &params, None).unwrap();
    assert_eq!(mapped.built_index_count(), dims);

    // the lazy path agrees with the eager path, element for element
    let eager = Collection::open(&path, dims).unwrap();
    let reference = eager.search_nodes(&query, &params, None).unwrap();
    assert_eq!(lazy.len(), reference.len());
    for (a, b) in lazy.iter().zip(reference.iter()) {
        assert_eq!(a.position, b.position);
        assert_eq!(a.distance, b.distance);
        assert_eq!(a.node.value, b.node.value);
    }
}

#[test]
fn timestamps_survive_flush_and_filter_by_time() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.bin");

    let mut collection = Collection::open(&path, 2).unwrap();
    collection.insert(vec![0.5, 0.5], "old").unwrap();
    let cutoff = chrono::Utc::now();
    std::thread::sleep(std::time::Duration::from_millis(2));
    collection.insert(vec![0.5, 0.5], "new").unwrap();
    collection.flush().unwrap();
    drop(collection);

    let reopened = Collection::open(&path, 2).unwrap();
    let recent = SearchFilter::new().since(cutoff);
    let results = reopened
        .search_with_filter(&[0.5, 0.5], 0.1, 0.0, 5, &recent)
        .unwrap();
    assert_eq!(results, vec!["new"]);

    let older = SearchFilter::new().until(cutoff);
    let results = reopened
        .search_with_filter(&[0.5, 0.5], 0.1, 0.0, 5, &older)
        .unwrap();
    assert_eq!(results, vec!["old"]);
}

#[test]
fn compressed_collection_stays_searchable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.bin");
    let mut rng = StdRng::seed_from_u64(99);

    let mut collection = Collection::open(&path, 16).unwrap().with_compression(true);
    for i in 0..50 {
        let key: Vec<f32> = (0..16).map(|_| rng.gen_range(0.0..1.0)).collect();
        collection.insert(key, format!("node-{i}")).unwrap();
    }
    collection.flush().unwrap();
    let target = collection.search_nodes(
        &vec![0.5; 16],
        &SearchParams::new(0.5, 0.0, 100),
        None,
    );
    drop(collection);

    let reopened = Collection::open(&path, 16).unwrap();
    let results = reopened
        .search_nodes(&vec![0.5; 16], &SearchParams::new(0.5, 0.0, 100), None)
        .unwrap();

    // quantization perturbs keys slightly, so near-equal distances may swap;
    // compare the admitted sets rather than their exact order
    let mut expected: Vec<String> = target
        .unwrap()
        .into_iter()
        .map(|m| m.node.value)
        .collect();
    let mut got: Vec<String> = results.into_iter().map(|m| m.node.value).collect();
    expected.sort();
    got.sort();
    assert_eq!(expected, got);
}

#[test]
fn exact_recall_against_linear_reference() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.bin");
    let mut rng = StdRng::seed_from_u64(1234);

    let dims = 6;
    let mut collection = Collection::open(&path, dims).unwrap();
    let mut keys = Vec::new();
    for i in 0..400 {
        let key: Vec<f32> = (0..dims).map(|_| rng.gen_range(0.0..1.0)).collect();
        keys.push(key.clone());
        collection.insert(key, format!("n{i}")).unwrap();
    }

    let query: Vec<f32> = (0..dims).map(|_| rng.gen_range(0.0..1.0)).collect();
    let (epsilon, threshold) = (0.4, 0.3);
    let limit = admissible_distance(epsilon, dims, threshold);

    let mut expected: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, key)| {
            key.iter()
                .zip(query.iter())
                .all(|(k, q)| (k - q).abs() <= epsilon)
                && euclidean_distance(key, &query) <= limit
        })
        .map(|(i, _)| i)
        .collect();
    expected.sort_by(|&a, &b| {
        euclidean_distance(&keys[a], &query)
            .partial_cmp(&euclidean_distance(&keys[b], &query))
            .unwrap()
            .then(a.cmp(&b))
    });

    let results = collection
        .search_nodes(&query, &SearchParams::new(epsilon, threshold, 1000), None)
        .unwrap();
    let got: Vec<usize> = results.iter().map(|m| m.position as usize).collect();

    assert_eq!(got, expected);
}
