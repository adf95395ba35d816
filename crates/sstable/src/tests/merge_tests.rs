use super::*;
use crate::{EntrySource, MergeIterator};
use tempfile::tempdir;

fn source(entries: Vec<Entry>) -> EntrySource {
    Box::new(entries.into_iter().map(Ok))
}

#[test]
fn newest_source_wins() -> Result<()> {
    let merged = MergeIterator::new(
        default_comparator(),
        vec![
            source(vec![entry("b", Some("new"))]),
            source(vec![entry("a", Some("1")), entry("b", Some("old"))]),
        ],
    )
    .collect_all()?;

    assert_eq!(merged, vec![entry("a", Some("1")), entry("b", Some("new"))]);
    Ok(())
}

#[test]
fn tombstone_shadows_older_value() -> Result<()> {
    let sources = || {
        vec![
            source(vec![entry("k", None)]),
            source(vec![entry("k", Some("v")), entry("z", Some("1"))]),
        ]
    };

    let kept = MergeIterator::new(default_comparator(), sources()).collect_all()?;
    assert_eq!(kept, vec![entry("k", None), entry("z", Some("1"))]);

    let dropped = MergeIterator::new(default_comparator(), sources())
        .drop_tombstones(true)
        .collect_all()?;
    assert_eq!(dropped, vec![entry("z", Some("1"))]);
    Ok(())
}

#[test]
fn merges_runs_on_disk() -> Result<()> {
    let dir = tempdir()?;
    let older = write_and_open(
        dir.path(),
        "old.run",
        &[(b"a", Some(b"1")), (b"c", Some(b"3")), (b"e", Some(b"5"))],
    )?;
    let newer = write_and_open(
        dir.path(),
        "new.run",
        &[(b"b", Some(b"2")), (b"c", None), (b"d", Some(b"4"))],
    )?;

    let merged = MergeIterator::new(
        default_comparator(),
        vec![Box::new(newer.iter()) as EntrySource, Box::new(older.iter()) as EntrySource],
    )
    .drop_tombstones(true)
    .collect_all()?;

    let keys: Vec<&[u8]> = merged.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![&b"a"[..], b"b", b"d", b"e"]);
    Ok(())
}

#[test]
fn no_sources_yields_nothing() -> Result<()> {
    let merged = MergeIterator::new(default_comparator(), Vec::new()).collect_all()?;
    assert!(merged.is_empty());
    Ok(())
}
