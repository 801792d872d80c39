use std::fs::{self, File};
use std::path::Path;

use polaroid::photo::{self, PATH, PHOTO, PhotoMeta};
use polaroid::scan::ScanOptions;
use polaroid::store::Environment;
use polaroid::tasks::indexer::{IndexSummary, Indexer, index_source_dir};
use tempfile::tempdir;

fn sized(path: &Path, len: u64) {
    File::create(path).unwrap().set_len(len).unwrap();
}

fn count_with_path(env: &Environment, path: &Path) -> usize {
    let key = path.to_string_lossy();
    env.read(|txn| txn.find(PHOTO, PATH, key.as_ref()))
        .unwrap()
        .len()
}

fn all_under(env: &Environment, root: &Path) -> Vec<PhotoMeta> {
    let prefix = root.to_string_lossy();
    env.read(|txn| txn.find_starting_with(PHOTO, PATH, prefix.as_ref()))
        .unwrap()
        .iter()
        .filter_map(PhotoMeta::from_entity)
        .collect()
}

#[test]
fn indexes_only_large_supported_files() {
    let tmp = tempdir().unwrap();
    let lib = tmp.path().join("lib");
    fs::create_dir_all(&lib).unwrap();
    sized(&lib.join("a.jpg"), 600_000);
    sized(&lib.join("b.png"), 400_000);
    sized(&lib.join("c.gif"), 600_000);
    let env = Environment::open(&tmp.path().join("work")).unwrap();

    let summary = index_source_dir(&env, &lib, &ScanOptions::default()).unwrap();
    assert_eq!(summary, IndexSummary { found: 1, inserted: 1 });

    let photos = all_under(&env, &lib);
    assert_eq!(photos.len(), 1);
    assert!(photos[0].path.ends_with("a.jpg"), "unexpected path: {}", photos[0].path);
    assert!(!photos[0].hidden);
    assert!(photos[0].id.is_some());
}

#[test]
fn rescanning_unchanged_tree_inserts_nothing() {
    let tmp = tempdir().unwrap();
    let lib = tmp.path().join("lib");
    fs::create_dir_all(lib.join("nested")).unwrap();
    // More files than one batch so several transactions are involved.
    for i in 0..23 {
        sized(&lib.join(format!("{i:02}.jpg")), 600_000);
    }
    sized(&lib.join("nested").join("deep.JPEG"), 700_000);
    let env = Environment::open(&tmp.path().join("work")).unwrap();
    let opts = ScanOptions::default();

    let first = index_source_dir(&env, &lib, &opts).unwrap();
    assert_eq!(first, IndexSummary { found: 24, inserted: 24 });
    let second = index_source_dir(&env, &lib, &opts).unwrap();
    assert_eq!(second, IndexSummary { found: 24, inserted: 0 });
    assert_eq!(all_under(&env, &lib).len(), 24);

    sized(&lib.join("new.png"), 800_000);
    let third = index_source_dir(&env, &lib, &opts).unwrap();
    assert_eq!(third, IndexSummary { found: 25, inserted: 1 });
}

#[test]
fn hidden_records_are_not_reinserted() {
    let tmp = tempdir().unwrap();
    let lib = tmp.path().join("lib");
    fs::create_dir_all(&lib).unwrap();
    let a = lib.join("a.jpg");
    sized(&a, 600_000);
    let env = Environment::open(&tmp.path().join("work")).unwrap();
    let opts = ScanOptions::default();

    index_source_dir(&env, &lib, &opts).unwrap();
    assert_eq!(photo::set_hidden(&env, &a, true).unwrap(), 1);
    let again = index_source_dir(&env, &lib, &opts).unwrap();

    assert_eq!(again.inserted, 0);
    assert_eq!(count_with_path(&env, &a), 1);
    assert!(all_under(&env, &lib)[0].hidden);
}

#[test]
fn missing_root_is_an_error() {
    let tmp = tempdir().unwrap();
    let env = Environment::open(&tmp.path().join("work")).unwrap();
    let err = index_source_dir(&env, &tmp.path().join("nope"), &ScanOptions::default())
        .expect_err("scan should error for invalid root");
    assert!(matches!(err, polaroid::Error::BadDir(_)));
}

#[cfg(unix)]
#[test]
fn unreadable_entries_do_not_abort_the_scan() {
    use std::os::unix::fs::symlink;

    let tmp = tempdir().unwrap();
    let lib = tmp.path().join("lib");
    fs::create_dir_all(lib.join("broken")).unwrap();
    fs::create_dir_all(lib.join("good")).unwrap();
    for i in 0..12 {
        sized(&lib.join("good").join(format!("{i:02}.jpg")), 600_000);
    }
    sized(&lib.join("top.png"), 600_000);
    symlink(&lib, lib.join("broken").join("cycle")).unwrap();
    symlink(tmp.path().join("gone.jpg"), lib.join("broken").join("gone.jpg")).unwrap();
    let env = Environment::open(&tmp.path().join("work")).unwrap();
    let opts = ScanOptions {
        follow_links: true,
        ..ScanOptions::default()
    };

    let summary = index_source_dir(&env, &lib, &opts).expect("scan should survive bad entries");
    assert_eq!(summary, IndexSummary { found: 13, inserted: 13 });
    assert_eq!(all_under(&env, &lib).len(), 13);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_and_overlapping_scans_never_duplicate() {
    let tmp = tempdir().unwrap();
    let lib = tmp.path().join("lib");
    let sub = lib.join("sub");
    fs::create_dir_all(&sub).unwrap();
    for i in 0..15 {
        sized(&lib.join(format!("top{i}.jpg")), 600_000);
        sized(&sub.join(format!("sub{i}.png")), 600_000);
    }
    let env = Environment::open(&tmp.path().join("work")).unwrap();
    let indexer = Indexer::new(env.clone(), ScanOptions::default());

    let handles = vec![
        indexer.start(&lib),
        indexer.start(&lib),
        indexer.start(&sub),
        indexer.start(&sub),
    ];
    let mut inserted = 0;
    for h in handles {
        inserted += h.await.unwrap().expect("scan should succeed").inserted;
    }

    assert_eq!(inserted, 30);
    let photos = all_under(&env, &lib);
    assert_eq!(photos.len(), 30);
    for p in &photos {
        assert_eq!(count_with_path(&env, p.file()), 1, "duplicate for {}", p.path);
    }
}

#[tokio::test]
async fn failed_background_scan_reports_none() {
    let tmp = tempdir().unwrap();
    let env = Environment::open(&tmp.path().join("work")).unwrap();
    let indexer = Indexer::new(env, ScanOptions::default());
    assert_eq!(indexer.start(tmp.path().join("missing")).await.unwrap(), None);
}
