//! Storage layer integration tests.
//!
//! Exercises heap files and B+ tree indexes together through the public
//! API, including reopening files from disk:
//! - B+ tree with shuffled inserts, range scans and reopen
//! - Compound keys and key-with-value payloads
//! - Heap records indexed by offset, deleted and rewritten

use bytes::Bytes;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::tempdir;

use keystone_common::{ColumnType, KeystoneError, Value};
use keystone_storage::{
    decode_values, encode_values, BTree, DiskManager, DiskManagerConfig, HeapFile, KeyCodec,
    KeyValue, RecordOffset,
};

fn create_disk(dir: &std::path::Path) -> Arc<DiskManager> {
    Arc::new(
        DiskManager::new(DiskManagerConfig {
            data_dir: dir.to_path_buf(),
            fsync_enabled: false,
        })
        .unwrap(),
    )
}

fn int_key(v: i32) -> Bytes {
    KeyCodec::Int.encode(&KeyValue::Int(v)).unwrap()
}

fn shuffled(n: i32) -> Vec<i32> {
    let mut keys: Vec<i32> = (0..n).collect();
    let mut rng = rand::rng();
    for i in (1..keys.len()).rev() {
        let j = rng.random_range(0..=i);
        keys.swap(i, j);
    }
    keys
}

// =============================================================================
// B+ Tree
// =============================================================================

#[test]
fn test_btree_shuffled_inserts() {
    let dir = tempdir().unwrap();
    let disk = create_disk(dir.path());
    let n = 50_000;

    {
        let mut tree = BTree::open(disk.clone(), "shuffled.idx", KeyCodec::Int).unwrap();
        for k in shuffled(n) {
            tree.insert_key(&int_key(k - n / 2), k as u32).unwrap();
        }
        assert_eq!(tree.count(), n as u32);
        assert!(tree.height() >= 2);

        let mut out = Vec::new();
        tree.search_for_range(&int_key(i32::MIN), &int_key(i32::MAX), &mut out)
            .unwrap();
        assert_eq!(out, (0..n as u32).collect::<Vec<_>>());
        tree.close().unwrap();
    }

    let tree = BTree::open(disk, "shuffled.idx", KeyCodec::Int).unwrap();
    assert_eq!(tree.count(), n as u32);

    let mut out = Vec::new();
    tree.search_for_range(&int_key(-10), &int_key(10), &mut out)
        .unwrap();
    assert_eq!(out.len(), 21);
    assert_eq!(out[0], (n / 2 - 10) as u32);

    out.clear();
    tree.search_exact(&int_key(0), &mut out).unwrap();
    assert_eq!(out, vec![(n / 2) as u32]);
}

#[test]
fn test_btree_random_deletes_match_model() {
    let dir = tempdir().unwrap();
    let mut tree = BTree::open(create_disk(dir.path()), "model.idx", KeyCodec::Int).unwrap();
    let mut model: BTreeMap<(i32, u32), ()> = BTreeMap::new();
    let mut rng = rand::rng();

    for value in 0..20_000u32 {
        let key = rng.random_range(-500..500);
        tree.insert_key(&int_key(key), value).unwrap();
        model.insert((key, value), ());
    }

    let doomed: Vec<(i32, u32)> = model
        .keys()
        .filter(|(_, value)| value % 3 == 0)
        .copied()
        .collect();
    for (key, value) in &doomed {
        assert!(tree.delete_key(&int_key(*key), *value).unwrap());
        model.remove(&(*key, *value));
    }
    assert_eq!(tree.count() as usize, model.len());

    for (low, high) in [(-500, 499), (-20, 20), (100, 100), (250, 10)] {
        let mut out = Vec::new();
        tree.search_for_range(&int_key(low), &int_key(high), &mut out)
            .unwrap();
        let expected: Vec<u32> = if low > high {
            Vec::new()
        } else {
            model
                .range((low, 0)..=(high, u32::MAX))
                .map(|((_, value), _)| *value)
                .collect()
        };
        assert_eq!(out, expected, "range {}..={}", low, high);
    }
}

#[test]
fn test_btree_compound_prefix_scan() {
    let dir = tempdir().unwrap();
    let codec = KeyCodec::Compound(vec![KeyCodec::String, KeyCodec::Int]);
    let mut tree = BTree::open(create_disk(dir.path()), "people.idx", codec.clone()).unwrap();

    let mut value = 0;
    for name in ["Sergey", "Misha", "Anna"] {
        for age in 0..60 {
            let key = codec
                .encode(&KeyValue::Compound(vec![name.into(), age.into()]))
                .unwrap();
            tree.insert_key(&key, value).unwrap();
            value += 1;
        }
    }

    // Every row for one name.
    let (low, high) = codec.prefix_range(&[KeyValue::from("Misha")]).unwrap();
    let mut out = Vec::new();
    tree.search_for_range(&low, &high, &mut out).unwrap();
    assert_eq!(out, (60..120).collect::<Vec<u32>>());

    // Name fixed, age between bounds.
    let low = codec
        .encode(&KeyValue::Compound(vec!["Sergey".into(), 10.into()]))
        .unwrap();
    let high = codec
        .encode(&KeyValue::Compound(vec!["Sergey".into(), 50.into()]))
        .unwrap();
    out.clear();
    assert_eq!(tree.search_for_range(&low, &high, &mut out).unwrap(), 41);
    assert_eq!(out.first(), Some(&10));
    assert_eq!(out.last(), Some(&50));

    // Bounds beyond the stored ages.
    let low = codec
        .encode(&KeyValue::Compound(vec!["Anna".into(), 100.into()]))
        .unwrap();
    let high = codec
        .encode(&KeyValue::Compound(vec!["Anna".into(), 200.into()]))
        .unwrap();
    out.clear();
    assert_eq!(tree.search_for_range(&low, &high, &mut out).unwrap(), 0);
}

#[test]
fn test_btree_compound_key_with_value() {
    let dir = tempdir().unwrap();
    let codec = KeyCodec::CompoundWithValue {
        key: Box::new(KeyCodec::Compound(vec![KeyCodec::Int, KeyCodec::Int])),
        value: Box::new(KeyCodec::DateTime),
    };
    let mut tree = BTree::open(create_disk(dir.path()), "kv.idx", codec.clone()).unwrap();

    for (a, b, ticks) in [(1, 2, 500i64), (1, 1, 300), (0, 9, 100), (1, 2, 400)] {
        let key = codec
            .encode(&KeyValue::WithValue(
                Box::new(KeyValue::Compound(vec![a.into(), b.into()])),
                Box::new(KeyValue::DateTime(ticks)),
            ))
            .unwrap();
        tree.insert_key(&key, 0).unwrap();
    }

    let (low, high) = codec
        .prefix_range(&[KeyValue::Compound(vec![1.into(), 2.into()])])
        .unwrap();
    let mut payloads = Vec::new();
    tree.scan_range(&low, &high, |key, _| {
        if let Ok(KeyValue::WithValue(_, value)) = codec.read(key) {
            payloads.push(*value);
        }
        true
    })
    .unwrap();
    assert_eq!(
        payloads,
        vec![KeyValue::DateTime(400), KeyValue::DateTime(500)]
    );
}

// =============================================================================
// Heap + index
// =============================================================================

#[test]
fn test_heap_records_through_index() {
    let dir = tempdir().unwrap();
    let disk = create_disk(dir.path());
    let types = [ColumnType::Integer, ColumnType::String];

    let mut heap = HeapFile::open(disk.clone(), "t.dat").unwrap();
    let mut index = BTree::open(disk.clone(), "t.id.idx", KeyCodec::Int).unwrap();

    let mut offsets = Vec::new();
    for i in 0..1_000 {
        let id = heap.allocate_id().unwrap();
        let body = encode_values(&types, &[Value::Integer(i), Value::from(format!("row {}", i))])
            .unwrap();
        let offset = heap.insert(id, &body).unwrap();
        index.insert_key(&int_key(i % 10), offset.0).unwrap();
        offsets.push(offset);
    }

    let mut hits = Vec::new();
    index.search_exact(&int_key(7), &mut hits).unwrap();
    assert_eq!(hits.len(), 100);
    for raw in &hits {
        let record = heap.read(RecordOffset(*raw)).unwrap();
        let values = decode_values(&types, &record.body).unwrap();
        assert_eq!(values[0].as_int().unwrap() % 10, 7);
    }

    // Deleting drops both the heap record and its index entry.
    for (i, offset) in offsets.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
        heap.delete(*offset).unwrap();
        assert!(index.delete_key(&int_key(i as i32 % 10), offset.0).unwrap());
    }
    assert_eq!(heap.count(), 500);
    assert_eq!(index.count(), 500);
    assert!(matches!(
        heap.delete(offsets[0]),
        Err(KeystoneError::RecordNotFound(_))
    ));

    // Rewriting moves records; the index is rebuilt from the new offsets.
    let live: Vec<(u32, Bytes)> = heap
        .scan()
        .map(|r| r.unwrap())
        .filter(|(_, record)| !record.is_deleted())
        .map(|(_, record)| (record.id(), record.body.clone()))
        .collect();
    let bodies: Vec<Bytes> = live.iter().map(|(_, body)| body.clone()).collect();
    let new_offsets = heap.rewrite(live).unwrap();
    index.clear().unwrap();
    for (offset, body) in new_offsets.iter().zip(&bodies) {
        let values = decode_values(&types, body).unwrap();
        let key = values[0].as_int().unwrap() % 10;
        index.insert_key(&int_key(key), offset.0).unwrap();
    }

    let wasted = heap.compute_wasted_space().unwrap();
    assert_eq!(wasted.normal_record_count, 500);
    assert_eq!(wasted.total_record_count, 500);

    heap.close().unwrap();
    index.close().unwrap();

    let heap = HeapFile::open(disk.clone(), "t.dat").unwrap();
    let index = BTree::open(disk, "t.id.idx", KeyCodec::Int).unwrap();
    assert_eq!(heap.next_id(), 1_000);
    let mut hits = Vec::new();
    index.search_exact(&int_key(3), &mut hits).unwrap();
    assert_eq!(hits.len(), 100);
    for raw in hits {
        let values = decode_values(&types, &heap.read(RecordOffset(raw)).unwrap().body).unwrap();
        assert_eq!(values[0].as_int().unwrap() % 10, 3);
    }
}
