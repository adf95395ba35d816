use super::*;
use crate::RunError;
use memtable::ByteRangeComparator;
use std::cmp::Ordering;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use tempfile::tempdir;

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

#[test]
fn get_hits_and_misses() -> Result<()> {
    let dir = tempdir()?;
    let r = write_and_open(
        dir.path(),
        "a.run",
        &[(b"a", Some(b"1")), (b"b", Some(b"2")), (b"c", Some(b"3"))],
    )?;
    assert_eq!(r.get(b"b")?, Some(Some(b"2".to_vec())));
    assert_eq!(r.get(b"zz")?, None);
    assert_eq!(r.keys().count(), 3);
    Ok(())
}

#[test]
fn range_is_half_open() -> Result<()> {
    let dir = tempdir()?;
    let r = write_and_open(
        dir.path(),
        "r.run",
        &[
            (b"a", Some(b"1")),
            (b"b", Some(b"2")),
            (b"c", Some(b"3")),
            (b"d", Some(b"4")),
        ],
    )?;
    let keys: Vec<Vec<u8>> = r
        .range(Some(b"b"), Some(b"d"))
        .map(|e| e.map(|(k, _)| k))
        .collect::<crate::Result<_>>()?;
    assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

    assert_eq!(r.range(Some(b"x"), None).count(), 0);
    assert_eq!(r.range(Some(b"c"), Some(b"a")).count(), 0);
    assert_eq!(r.iter().count(), 4);
    Ok(())
}

#[test]
fn custom_comparator_order_is_respected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("desc.run");
    let cmp: memtable::SharedComparator = Arc::new(Descending);
    let mut mem = Memtable::new(cmp.clone());
    for k in ["a", "b", "c"] {
        mem.put(k.as_bytes().to_vec(), k.as_bytes().to_vec());
    }
    SSTableWriter::write_from_memtable(&path, &mem)?;

    let r = Arc::new(SSTableReader::open(&path, cmp)?);
    let keys: Vec<Vec<u8>> = r.keys().map(<[u8]>::to_vec).collect();
    assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    assert_eq!(r.get(b"a")?, Some(Some(b"a".to_vec())));

    // opening with the wrong order is detected
    let err = SSTableReader::open(&path, default_comparator()).unwrap_err();
    assert!(matches!(err, RunError::Corrupt { .. }));
    Ok(())
}

#[test]
fn bad_magic_is_corruption() -> Result<()> {
    let dir = tempdir()?;
    write_and_open(dir.path(), "m.run", &[(b"k", Some(b"v"))])?;
    let path = dir.path().join("m.run");

    let mut f = OpenOptions::new().write(true).open(&path)?;
    f.seek(SeekFrom::End(-4))?;
    f.write_all(b"XXXX")?;
    drop(f);

    let err = SSTableReader::open(&path, default_comparator()).unwrap_err();
    assert!(matches!(err, RunError::Corrupt { .. }));
    Ok(())
}

#[test]
fn truncated_file_is_corruption() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("short.run");
    fs::write(&path, b"tiny")?;
    let err = SSTableReader::open(&path, default_comparator()).unwrap_err();
    assert!(matches!(err, RunError::Corrupt { .. }));
    Ok(())
}

#[test]
fn flipped_value_byte_fails_crc() -> Result<()> {
    let dir = tempdir()?;
    write_and_open(dir.path(), "c.run", &[(b"key", Some(b"value"))])?;
    let path = dir.path().join("c.run");

    // record: crc(4) key_len(4) "key"(3) present(1) val_len(4) "value"
    let mut bytes = fs::read(&path)?;
    bytes[16] ^= 0xff;
    fs::write(&path, &bytes)?;

    let r = SSTableReader::open(&path, default_comparator())?;
    let err = r.get(b"key").unwrap_err();
    assert!(err.to_string().contains("CRC32 mismatch"));
    Ok(())
}
