use super::*;
use crate::{RunError, FOOTER_BYTES};
use tempfile::tempdir;

#[test]
fn writes_file_and_removes_temp() -> Result<()> {
    let dir = tempdir()?;
    let r = write_and_open(dir.path(), "a.run", &[(b"k", Some(b"v"))])?;
    assert_eq!(r.len(), 1);
    assert!(dir.path().join("a.run").exists());
    assert!(!dir.path().join("a.run.tmp").exists());
    Ok(())
}

#[test]
fn empty_run_is_valid() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("empty.run");
    let written = SSTableWriter::write_from_iterator(&path, std::iter::empty())?;
    assert_eq!(written, 0);

    let r = SSTableReader::open(&path, default_comparator())?;
    assert!(r.is_empty());
    assert_eq!(r.file_size(), FOOTER_BYTES);
    assert!(r.get(b"anything")?.is_none());
    Ok(())
}

#[test]
fn iterator_error_aborts_write() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("broken.run");
    let items: Vec<crate::Result<Entry>> = vec![
        Ok(entry("a", Some("1"))),
        Err(RunError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "source failed",
        ))),
    ];
    assert!(SSTableWriter::write_from_iterator(&path, items.into_iter()).is_err());
    assert!(!path.exists());
    assert!(!dir.path().join("broken.run.tmp").exists());
    Ok(())
}

#[test]
fn tombstones_are_persisted() -> Result<()> {
    let dir = tempdir()?;
    let r = write_and_open(dir.path(), "t.run", &[(b"gone", None), (b"kept", Some(b"v"))])?;
    assert_eq!(r.get(b"gone")?, Some(None));
    assert_eq!(r.get(b"kept")?, Some(Some(b"v".to_vec())));
    Ok(())
}

#[test]
fn large_values_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let big = vec![7u8; 1 << 20];
    let r = write_and_open(dir.path(), "big.run", &[(b"big", Some(&big))])?;
    assert_eq!(r.get(b"big")?.unwrap().unwrap().len(), 1 << 20);
    Ok(())
}
