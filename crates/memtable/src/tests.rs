use super::*;
use std::sync::Arc;

/// Orders keys from largest to smallest.
#[derive(Debug)]
struct Descending;

impl ByteRangeComparator for Descending {
    fn id(&self) -> &str {
        "descending"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

// -------------------- Basic CRUD --------------------

#[test]
fn put_and_get_single_key() {
    let mut m = Memtable::default();
    m.put(b"k1".to_vec(), b"v1".to_vec());
    assert_eq!(m.len(), 1);
    assert_eq!(m.get(b"k1").unwrap(), b"v1");
}

#[test]
fn put_overwrites_previous_value() {
    let mut m = Memtable::default();
    m.put(b"k1".to_vec(), b"v1".to_vec());
    m.put(b"k1".to_vec(), b"v2".to_vec());
    assert_eq!(m.get(b"k1").unwrap(), b"v2");
    assert_eq!(m.len(), 1);
}

#[test]
fn get_missing_key_returns_none() {
    let m = Memtable::default();
    assert!(m.get(b"nonexistent").is_none());
    assert!(m.get_entry(b"nonexistent").is_none());
}

#[test]
fn delete_creates_tombstone() {
    let mut m = Memtable::default();
    m.put(b"k1".to_vec(), b"v1".to_vec());
    m.delete(b"k1".to_vec());
    assert!(m.get(b"k1").is_none());
    assert_eq!(m.get_entry(b"k1"), Some(None));
    assert_eq!(m.len(), 1);
}

#[test]
fn put_after_delete_resurrects_key() {
    let mut m = Memtable::default();
    m.delete(b"k".to_vec());
    m.put(b"k".to_vec(), b"back".to_vec());
    assert_eq!(m.get(b"k").unwrap(), b"back");
}

#[test]
fn approx_size_tracks_keys_and_values() {
    let mut m = Memtable::default();
    assert_eq!(m.approx_size(), 0);
    m.put(b"a".to_vec(), b"aaa".to_vec());
    assert_eq!(m.approx_size(), 4);
    m.put(b"a".to_vec(), b"bb".to_vec());
    assert_eq!(m.approx_size(), 3);
    m.delete(b"a".to_vec());
    assert_eq!(m.approx_size(), 1);
    m.clear();
    assert_eq!(m.approx_size(), 0);
    assert!(m.is_empty());
}

// -------------------- Ordering --------------------

#[test]
fn iter_is_sorted_by_default_comparator() {
    let mut m = Memtable::default();
    for k in [b"c", b"a", b"b"] {
        m.put(k.to_vec(), b"v".to_vec());
    }
    let keys: Vec<_> = m.iter().map(|(k, _)| k.to_vec()).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn iter_follows_custom_comparator() {
    let mut m = Memtable::new(Arc::new(Descending));
    for k in [b"a", b"c", b"b"] {
        m.put(k.to_vec(), b"v".to_vec());
    }
    let keys: Vec<_> = m.iter().map(|(k, _)| k.to_vec()).collect();
    assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    assert_eq!(m.get(b"b").unwrap(), b"v");
}

// -------------------- Ranges --------------------

#[test]
fn prefix_returns_only_matching_keys() {
    let mut m = Memtable::default();
    for k in ["test", "testabc", "testxyz", "tesz", "yagga", "te"] {
        m.put(k.as_bytes().to_vec(), b"v".to_vec());
    }
    let keys: Vec<_> = m.prefix(b"test").map(|(k, _)| k.to_vec()).collect();
    assert_eq!(
        keys,
        vec![b"test".to_vec(), b"testabc".to_vec(), b"testxyz".to_vec()]
    );
}

#[test]
fn prefix_includes_tombstones() {
    let mut m = Memtable::default();
    m.put(b"p1".to_vec(), b"v".to_vec());
    m.delete(b"p2".to_vec());
    let entries: Vec<_> = m.prefix(b"p").collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1], (&b"p2"[..], None));
}

#[test]
fn range_with_inverted_bounds_is_empty() {
    let mut m = Memtable::default();
    m.put(b"a".to_vec(), b"1".to_vec());
    m.put(b"z".to_vec(), b"2".to_vec());
    assert_eq!(m.range(Some(b"x"), Some(b"b")).count(), 0);
    assert_eq!(m.range(None, Some(b"b")).count(), 1);
    assert_eq!(m.range(Some(b"b"), None).count(), 1);
}

#[test]
fn successor_prefix_handles_max_bytes() {
    assert_eq!(successor_prefix(b"ab"), Some(b"ac".to_vec()));
    assert_eq!(successor_prefix(&[b'a', 0xff]), Some(b"b".to_vec()));
    assert_eq!(successor_prefix(&[0xff, 0xff]), None);
    assert_eq!(successor_prefix(b""), None);
}

// -------------------- Load --------------------

#[test]
fn write_load_with_key_reuse() {
    let mut m = Memtable::default();
    for i in 0..100_000u64 {
        let key = format!("key{}", i % 1_000).into_bytes();
        m.put(key, vec![b'x'; 50]);
    }
    assert_eq!(m.len(), 1_000);
}
