use std::fs;

use grovefs::overlay::dirdata::{DirContents, DirEntry};
use grovefs::overlay::header::{encode_header, EntryKind, Timespec, HEADER_VERSION};
use grovefs::overlay::{Overlay, ROOT_INODE};
use grovefs::Error;
use tempfile::tempdir;

const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

fn dir_entry(inode: u64) -> DirEntry {
    DirEntry::materialized(0o40755, inode)
}

fn file_entry(inode: u64) -> DirEntry {
    DirEntry::materialized(0o100644, inode)
}

#[test]
fn fresh_overlay_reports_the_root_inode() -> grovefs::Result<()> {
    let tmp = tempdir()?;
    let overlay = Overlay::open(tmp.path().join("ov"))?;
    assert_eq!(overlay.max_recorded_inode()?, ROOT_INODE);
    Ok(())
}

#[test]
fn scan_walks_nested_directories() -> grovefs::Result<()> {
    let tmp = tempdir()?;
    let overlay = Overlay::open(tmp.path().join("ov"))?;

    let mut root = DirContents::default();
    root.insert("sub", dir_entry(2));
    root.insert("note", file_entry(300));
    overlay.save_dir(ROOT_INODE, &root)?;

    let mut sub = DirContents::default();
    sub.insert("deep", file_entry(65537));
    overlay.save_dir(2, &sub)?;

    assert_eq!(overlay.max_recorded_inode()?, 65537);
    Ok(())
}

#[test]
fn tracked_entries_do_not_count() -> grovefs::Result<()> {
    let tmp = tempdir()?;
    let overlay = Overlay::open(tmp.path().join("ov"))?;

    let mut root = DirContents::default();
    root.insert("pristine", DirEntry::tracked(0o100644, vec![0xcc; 20]));
    overlay.save_dir(ROOT_INODE, &root)?;

    assert_eq!(overlay.max_recorded_inode()?, ROOT_INODE);
    Ok(())
}

#[test]
fn orphan_files_are_found_by_the_shard_sweep() -> grovefs::Result<()> {
    let tmp = tempdir()?;
    let overlay = Overlay::open(tmp.path().join("ov"))?;

    let mut root = DirContents::default();
    root.insert("sub", dir_entry(2));
    overlay.save_dir(ROOT_INODE, &root)?;
    overlay.save_dir(2, &DirContents::default())?;

    // Unlinked-while-open: the file exists but no listing references it.
    drop(overlay.create_file(999_999)?);
    assert!(overlay.file_path(999_999).is_file());

    assert_eq!(overlay.max_recorded_inode()?, 999_999);
    Ok(())
}

#[test]
fn missing_child_directories_prune_their_subtree() -> grovefs::Result<()> {
    let tmp = tempdir()?;
    let overlay = Overlay::open(tmp.path().join("ov"))?;

    // Entry 9000 claims to be a materialized directory, but its overlay
    // file was never written (or was unlinked). The scan still counts the
    // number from the parent listing and moves on.
    let mut root = DirContents::default();
    root.insert("ghost", dir_entry(9000));
    overlay.save_dir(ROOT_INODE, &root)?;

    assert_eq!(overlay.max_recorded_inode()?, 9000);
    Ok(())
}

#[test]
fn stray_names_in_shards_are_ignored() -> grovefs::Result<()> {
    let tmp = tempdir()?;
    let overlay = Overlay::open(tmp.path().join("ov"))?;

    overlay.save_dir(ROOT_INODE, &DirContents::default())?;

    // Leftovers from an interrupted atomic replace do not parse as inode
    // numbers and must not fail the scan.
    fs::write(overlay.local_dir().join("0a").join(".tmpQx41zu"), b"junk")?;
    fs::write(overlay.local_dir().join("ff").join("not-an-inode"), b"junk")?;

    assert_eq!(overlay.max_recorded_inode()?, ROOT_INODE);
    Ok(())
}

#[test]
fn corrupt_directory_fails_the_scan() -> grovefs::Result<()> {
    let tmp = tempdir()?;
    let overlay = Overlay::open(tmp.path().join("ov"))?;

    let mut root = DirContents::default();
    root.insert("bad", dir_entry(5));
    overlay.save_dir(ROOT_INODE, &root)?;

    // Valid dir header, garbage body.
    let mut data = encode_header(EntryKind::Dir, HEADER_VERSION, ZERO, ZERO, ZERO).to_vec();
    data.extend_from_slice(&u64::MAX.to_le_bytes());
    fs::write(overlay.file_path(5), data)?;

    let err = overlay.max_recorded_inode().expect_err("corrupt subtree");
    match err.downcast::<Error>() {
        Ok(Error::CorruptDir { .. }) => {}
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn scan_covers_every_save_and_create() -> grovefs::Result<()> {
    let tmp = tempdir()?;
    let overlay = Overlay::open(tmp.path().join("ov"))?;

    let mut root = DirContents::default();
    for inode in [2u64, 37, 254, 255, 256, 4096] {
        root.insert(format!("d{inode}"), dir_entry(inode));
        overlay.save_dir(inode, &DirContents::default())?;
    }
    overlay.save_dir(ROOT_INODE, &root)?;
    drop(overlay.create_file(4097)?);

    assert!(overlay.max_recorded_inode()? >= 4097);
    Ok(())
}
