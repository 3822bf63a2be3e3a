//! Manager-level share tests: roots, refresh, search, dupe detection.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::hasher::Hasher;
use crate::share::refresh::{RefreshKind, RefreshPriority};
use crate::share::{DEFAULT_PROFILE, SearchQuery, ShareManager};
use crate::tth::hash_buffer;
use crate::types::Event;

async fn manager(state_dir: &Path) -> (ShareManager, broadcast::Receiver<Event>) {
    let config = Config {
        state_dir: state_dir.to_path_buf(),
        ..Config::default()
    };
    let (tx, rx) = broadcast::channel(256);
    let m = ShareManager::new(&config, tx, Hasher::new()).await.unwrap();
    m.spawn().await;
    (m, rx)
}

fn write(dir: &Path, rel: &str, data: &[u8]) {
    let p = dir.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, data).unwrap();
}

async fn wait_refresh(rx: &mut broadcast::Receiver<Event>) -> crate::types::RefreshStats {
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv()).await {
            Ok(Ok(Event::RefreshCompleted { stats, .. })) => return stats,
            Ok(Ok(_)) => {}
            other => panic!("refresh did not complete: {other:?}"),
        }
    }
}

#[tokio::test]
async fn add_root_scans_and_indexes_content() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    write(share.path(), "Movies/Some.Release-GRP/a.mkv", b"movie data");
    write(share.path(), "Movies/Some.Release-GRP/b.srt", b"subs");

    let (m, mut rx) = manager(state.path()).await;
    m.add_root(share.path().to_path_buf(), "Share", BTreeSet::new(), false)
        .await
        .unwrap();
    let stats = wait_refresh(&mut rx).await;
    assert_eq!(stats.files_indexed, 2);

    let tth = hash_buffer(b"movie data").root();
    let found = m.find_by_tth(&tth).await;
    assert_eq!(found.len(), 1);
    assert!(found[0].virtual_path.ends_with("a.mkv"));
    assert_eq!(found[0].size, 10);
    assert_eq!(m.total_size(DEFAULT_PROFILE).await, 14);
}

#[tokio::test]
async fn duplicate_or_nested_roots_are_rejected() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    fs::create_dir_all(share.path().join("inner")).unwrap();

    let (m, mut rx) = manager(state.path()).await;
    m.add_root(share.path().to_path_buf(), "Share", BTreeSet::new(), false)
        .await
        .unwrap();
    wait_refresh(&mut rx).await;

    assert!(
        m.add_root(share.path().to_path_buf(), "Again", BTreeSet::new(), false)
            .await
            .is_err()
    );
    assert!(
        m.add_root(share.path().join("inner"), "Inner", BTreeSet::new(), false)
            .await
            .is_err(),
        "a nested root is already covered"
    );
}

#[tokio::test]
async fn text_search_matches_terms_and_respects_exclusions() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    write(share.path(), "Some.Release.2024-GRP/episode.one.mkv", b"ep1");
    write(share.path(), "Some.Release.2024-GRP/sample/sample.mkv", b"sam");
    write(share.path(), "Other.Things/notes.txt", b"notes");

    let (m, mut rx) = manager(state.path()).await;
    m.add_root(share.path().to_path_buf(), "Share", BTreeSet::new(), false)
        .await
        .unwrap();
    wait_refresh(&mut rx).await;

    let hits = m
        .search(
            &SearchQuery {
                include: vec!["release".into(), "mkv".into()],
                exclude: vec!["sample".into()],
                ..SearchQuery::default()
            },
            DEFAULT_PROFILE,
        )
        .await;
    assert_eq!(hits.len(), 1);
    assert!(hits[0].virtual_path.contains("episode.one.mkv"));

    let none = m
        .search(
            &SearchQuery {
                include: vec!["zzqqxxjjww".into()],
                ..SearchQuery::default()
            },
            DEFAULT_PROFILE,
        )
        .await;
    assert!(none.is_empty(), "bloom rejects unknown terms");
}

#[tokio::test]
async fn tth_search_short_circuits_text_matching() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    write(share.path(), "dir/content.bin", b"identified by hash");

    let (m, mut rx) = manager(state.path()).await;
    m.add_root(share.path().to_path_buf(), "Share", BTreeSet::new(), false)
        .await
        .unwrap();
    wait_refresh(&mut rx).await;

    let tth = hash_buffer(b"identified by hash").root();
    let hits = m
        .search(
            &SearchQuery {
                include: vec!["no such text".into()],
                tth: Some(tth),
                ..SearchQuery::default()
            },
            DEFAULT_PROFILE,
        )
        .await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].tth, tth);
}

#[tokio::test]
async fn profile_restrictions_hide_files_from_other_profiles() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    write(share.path(), "private.bin", b"restricted");

    let (m, mut rx) = manager(state.path()).await;
    m.add_profile(7, "Friends").await;
    m.add_root(
        share.path().to_path_buf(),
        "Share",
        BTreeSet::from([7u32]),
        false,
    )
    .await
    .unwrap();
    wait_refresh(&mut rx).await;

    let tth = hash_buffer(b"restricted").root();
    assert!(m.lookup_transfer(&tth, 7).await.is_some());
    assert!(
        m.lookup_transfer(&tth, DEFAULT_PROFILE).await.is_none(),
        "default profile must not see the restricted root"
    );
}

#[tokio::test]
async fn refresh_replaces_removed_content() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    write(share.path(), "dir/old.bin", b"old content");

    let (m, mut rx) = manager(state.path()).await;
    m.add_root(share.path().to_path_buf(), "Share", BTreeSet::new(), false)
        .await
        .unwrap();
    wait_refresh(&mut rx).await;

    let old_tth = hash_buffer(b"old content").root();
    assert_eq!(m.find_by_tth(&old_tth).await.len(), 1);

    fs::remove_file(share.path().join("dir/old.bin")).unwrap();
    write(share.path(), "dir/new.bin", b"new content");
    m.refresh(
        vec![share.path().to_path_buf()],
        RefreshPriority::Manual,
        RefreshKind::Dirs,
    )
    .unwrap();
    wait_refresh(&mut rx).await;

    // Invariant: the TTH index matches the tree exactly after a refresh.
    assert!(m.find_by_tth(&old_tth).await.is_empty(), "removed file left the index");
    assert_eq!(m.find_by_tth(&hash_buffer(b"new content").root()).await.len(), 1);
}

#[tokio::test]
async fn queued_paths_are_deduplicated() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    write(share.path(), "a.bin", b"data");

    let (m, mut rx) = manager(state.path()).await;
    m.add_root(share.path().to_path_buf(), "Share", BTreeSet::new(), false)
        .await
        .unwrap();
    wait_refresh(&mut rx).await;

    // Stall the worker indirectly by queueing the same path twice quickly;
    // the second request must be dropped as a duplicate.
    m.refresh(
        vec![share.path().to_path_buf()],
        RefreshPriority::Manual,
        RefreshKind::Dirs,
    )
    .unwrap();
    let second = m.refresh(
        vec![share.path().to_path_buf()],
        RefreshPriority::Manual,
        RefreshKind::Dirs,
    );
    assert!(second.is_err(), "identical queued path must be dropped");
    wait_refresh(&mut rx).await;
}

#[tokio::test]
async fn roots_round_trip_through_shares_xml() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    fs::create_dir_all(share.path()).unwrap();

    {
        let (m, mut rx) = manager(state.path()).await;
        m.add_root(
            share.path().to_path_buf(),
            "Stuff",
            BTreeSet::from([3u32]),
            true,
        )
        .await
        .unwrap();
        wait_refresh(&mut rx).await;
        m.shutdown().await.unwrap();
    }

    let (m, _rx) = manager(state.path()).await;
    let roots = m.root_paths().await;
    assert_eq!(roots, vec![share.path().to_path_buf()]);
}

#[tokio::test]
async fn queued_checker_excludes_unfinished_bundle_files() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    write(share.path(), "done.bin", b"done");
    write(share.path(), "active.bin", b"active");

    let (m, mut rx) = manager(state.path()).await;
    let active: PathBuf = share.path().join("active.bin");
    m.set_queued_checker(Arc::new(move |p: &Path| p == active));
    m.add_root(share.path().to_path_buf(), "Share", BTreeSet::new(), false)
        .await
        .unwrap();
    let stats = wait_refresh(&mut rx).await;

    assert_eq!(stats.files_indexed, 1);
    assert_eq!(stats.files_skipped, 1);
    assert!(m.find_by_tth(&hash_buffer(b"done").root()).await.len() == 1);
    assert!(m.find_by_tth(&hash_buffer(b"active").root()).await.is_empty());
}

#[tokio::test]
async fn directory_dupe_detects_shared_releases() {
    let state = tempfile::tempdir().unwrap();
    let share = tempfile::tempdir().unwrap();
    write(share.path(), "Some.Release-GRP/a.bin", b"12345");

    let (m, mut rx) = manager(state.path()).await;
    m.add_root(share.path().to_path_buf(), "Share", BTreeSet::new(), false)
        .await
        .unwrap();
    wait_refresh(&mut rx).await;

    use crate::types::DupeType;
    let full = m
        .directory_dupe(Path::new("/elsewhere/Some.Release-GRP"), 5)
        .await;
    assert_eq!(full, DupeType::ShareFull);

    let partial = m
        .directory_dupe(Path::new("/elsewhere/Some.Release-GRP"), 999)
        .await;
    assert_eq!(partial, DupeType::SharePartial);

    let none = m.directory_dupe(Path::new("/elsewhere/Unknown.Dir"), 5).await;
    assert_eq!(none, DupeType::None);
}
