//! Upload slot manager tests.

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::{Config, UploadConfig};
use crate::error::UploadError;
use crate::hasher::Hasher;
use crate::segment::Segment;
use crate::share::ShareManager;
use crate::tth::{Tth, hash_buffer};
use crate::types::{Cid, Event, HintedUser, QueueToken};
use crate::utils::now_ms;

use super::{SlotKind, SlotSource, TransferSlot, UploadKind, UploadManager, UploadRequest};

struct Fixture {
    uploads: UploadManager,
    #[allow(dead_code)]
    share: ShareManager,
    state_dir: tempfile::TempDir,
    share_dir: tempfile::TempDir,
}

async fn fixture(tweak: impl FnOnce(&mut UploadConfig), files: &[(&str, usize)]) -> Fixture {
    let state_dir = tempfile::tempdir().unwrap();
    let share_dir = tempfile::tempdir().unwrap();
    for (name, size) in files {
        let p = share_dir.path().join(name);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, vec![0x5Au8; *size]).unwrap();
    }

    let config = Config {
        state_dir: state_dir.path().to_path_buf(),
        ..Config::default()
    };
    let (tx, mut rx) = broadcast::channel(1024);
    let share = ShareManager::new(&config, tx.clone(), Hasher::new())
        .await
        .unwrap();
    share.spawn().await;
    share
        .add_root(share_dir.path().to_path_buf(), "Share", BTreeSet::new(), false)
        .await
        .unwrap();
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv()).await {
            Ok(Ok(Event::RefreshCompleted { .. })) => break,
            Ok(Ok(_)) => {}
            other => panic!("share refresh did not finish: {other:?}"),
        }
    }

    let mut upload_config = UploadConfig {
        slots: 2,
        ..UploadConfig::default()
    };
    tweak(&mut upload_config);
    let uploads = UploadManager::new(upload_config, share.clone(), tx);
    Fixture {
        uploads,
        share,
        state_dir,
        share_dir,
    }
}

fn peer(b: u8) -> HintedUser {
    HintedUser::new(Cid([b; 24]), format!("peer{b}"), "adc://hub:1511")
}

fn file_tth(size: usize) -> Tth {
    hash_buffer(&vec![0x5Au8; size]).root()
}

fn request(user: u8, connection: u32, tth: Tth) -> UploadRequest {
    UploadRequest {
        user: Some(peer(user)),
        profile: 0,
        tth: Some(tth),
        virtual_path: "/Share/file".into(),
        segment: Segment::new(0, 0),
        connection: QueueToken(connection),
        ip: format!("10.0.0.{user}"),
        kind: UploadKind::File,
        mcn: false,
        supports_mini_slots: false,
        operator: false,
    }
}

#[tokio::test]
async fn unknown_user_is_refused() {
    let f = fixture(|_| {}, &[("a.bin", 100_000)]).await;
    let mut req = request(1, 1, file_tth(100_000));
    req.user = None;
    assert!(matches!(
        f.uploads.prepare_upload(req).await,
        Err(UploadError::UnknownUser)
    ));
}

#[tokio::test]
async fn unshared_hash_is_not_available() {
    let f = fixture(|_| {}, &[("a.bin", 100_000)]).await;
    let req = request(1, 1, hash_buffer(b"not shared").root());
    assert!(matches!(
        f.uploads.prepare_upload(req).await,
        Err(UploadError::FileNotAvailable { .. })
    ));
}

#[tokio::test]
async fn restricted_profile_is_denied() {
    let state_dir = tempfile::tempdir().unwrap();
    let share_dir = tempfile::tempdir().unwrap();
    fs::write(share_dir.path().join("secret.bin"), vec![1u8; 500]).unwrap();

    let config = Config {
        state_dir: state_dir.path().to_path_buf(),
        ..Config::default()
    };
    let (tx, mut rx) = broadcast::channel(256);
    let share = ShareManager::new(&config, tx.clone(), Hasher::new())
        .await
        .unwrap();
    share.spawn().await;
    share
        .add_root(
            share_dir.path().to_path_buf(),
            "Secret",
            BTreeSet::from([5u32]),
            false,
        )
        .await
        .unwrap();
    while !matches!(rx.recv().await, Ok(Event::RefreshCompleted { .. })) {}

    let uploads = UploadManager::new(UploadConfig::default(), share, tx);
    let mut req = request(1, 1, hash_buffer(&vec![1u8; 500]).root());
    req.profile = 0;
    assert!(matches!(
        uploads.prepare_upload(req).await,
        Err(UploadError::FileAccessDenied { .. })
    ));
}

#[tokio::test]
async fn standard_slots_grant_then_queue_with_positions() {
    let f = fixture(|c| c.slots = 2, &[("a.bin", 100_000)]).await;
    let tth = file_tth(100_000);

    f.uploads.prepare_upload(request(1, 1, tth)).await.unwrap();
    f.uploads.prepare_upload(request(2, 2, tth)).await.unwrap();

    let third = f.uploads.prepare_upload(request(3, 3, tth)).await;
    assert!(matches!(third, Err(UploadError::SlotsFull { position: 1 })));
    let fourth = f.uploads.prepare_upload(request(4, 4, tth)).await;
    assert!(matches!(fourth, Err(UploadError::SlotsFull { position: 2 })));

    let (user_slots, _) = f.uploads.slot_usage().await;
    assert_eq!(user_slots, 2);
}

#[tokio::test]
async fn existing_user_slot_on_the_connection_is_kept() {
    let f = fixture(|c| c.slots = 1, &[("a.bin", 100_000), ("b.bin", 200_000)]).await;

    let first = f
        .uploads
        .prepare_upload(request(1, 1, file_tth(100_000)))
        .await
        .unwrap();
    f.uploads.upload_finished(first).await;

    // The pool is size 1 and the slot is held by connection 1; a follow-up
    // file on the same connection keeps the user slot.
    let second = f
        .uploads
        .prepare_upload(request(1, 1, file_tth(200_000)))
        .await
        .unwrap();
    assert_eq!(
        f.uploads.upload_slot(second).await.unwrap(),
        TransferSlot {
            kind: SlotKind::UserSlot,
            source: SlotSource::Standard
        }
    );
}

#[tokio::test]
async fn mcn_small_files_get_file_slots_up_to_the_cap() {
    let f = fixture(
        |c| {
            c.slots = 1;
            c.mcn_small_max = 2;
            c.mini_file_size_kib = 64;
        },
        &[("small.bin", 1000)],
    )
    .await;
    let tth = file_tth(1000);

    // Exhaust the user slot pool first.
    f.uploads
        .prepare_upload(request(9, 9, tth))
        .await
        .unwrap();

    for conn in 1..=2u32 {
        let mut req = request(1, conn, tth);
        req.mcn = true;
        let token = f.uploads.prepare_upload(req).await.unwrap();
        assert_eq!(
            f.uploads.upload_slot(token).await.unwrap().source,
            SlotSource::McnSmall
        );
    }

    let mut over = request(1, 3, tth);
    over.mcn = true;
    assert!(matches!(
        f.uploads.prepare_upload(over).await,
        Err(UploadError::SlotsFull { .. })
    ));
}

#[tokio::test]
async fn slot_transition_away_from_mcn_small_releases_the_count() {
    let f = fixture(
        |c| {
            c.slots = 2;
            c.mcn_small_max = 1;
        },
        &[("small.bin", 1000), ("big.bin", 200_000)],
    )
    .await;
    let small = file_tth(1000);
    let big = file_tth(200_000);

    // Connection 1 starts in the small-file pool...
    let mut first = request(1, 1, small);
    first.mcn = true;
    let token = f.uploads.prepare_upload(first).await.unwrap();
    assert_eq!(
        f.uploads.upload_slot(token).await.unwrap().source,
        SlotSource::McnSmall
    );

    // ...then its next request is a full file and the slot becomes a user
    // slot. The small-file count must move out with it.
    let mut second = request(1, 1, big);
    second.mcn = true;
    let token = f.uploads.prepare_upload(second).await.unwrap();
    assert_eq!(
        f.uploads.upload_slot(token).await.unwrap(),
        TransferSlot {
            kind: SlotKind::UserSlot,
            source: SlotSource::Standard
        }
    );

    // The single small-file slot is free again for another peer.
    let mut other = request(2, 2, small);
    other.mcn = true;
    let token = f.uploads.prepare_upload(other).await.unwrap();
    assert_eq!(
        f.uploads.upload_slot(token).await.unwrap().source,
        SlotSource::McnSmall
    );
}

#[tokio::test]
async fn concurrent_admissions_never_overshoot_the_slot_pool() {
    let f = fixture(|c| c.slots = 1, &[("a.bin", 100_000)]).await;
    let tth = file_tth(100_000);

    // A burst of simultaneous requests races for the single slot; admission
    // is serialised, so exactly one wins and conservation holds throughout.
    let attempts: Vec<_> = (1..=4u8)
        .map(|user| {
            let uploads = f.uploads.clone();
            tokio::spawn(async move { uploads.prepare_upload(request(user, user as u32, tth)).await })
        })
        .collect();

    let mut granted = 0;
    let mut refused = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => granted += 1,
            Err(UploadError::SlotsFull { .. }) => refused += 1,
            Err(e) => panic!("unexpected refusal: {e}"),
        }
    }
    assert_eq!(granted, 1, "one slot, one grant");
    assert_eq!(refused, 3);

    let (user_slots, _) = f.uploads.slot_usage().await;
    assert_eq!(user_slots, 1, "slot conservation after the burst");
}

#[tokio::test]
async fn mini_slots_serve_lists_when_user_slots_are_gone() {
    let f = fixture(|c| c.slots = 1, &[("a.bin", 100_000)]).await;
    f.uploads
        .prepare_upload(request(9, 9, file_tth(100_000)))
        .await
        .unwrap();

    let mut list = request(1, 1, file_tth(100_000));
    list.kind = UploadKind::FileList;
    list.tth = None;
    list.supports_mini_slots = true;
    let token = f.uploads.prepare_upload(list).await.unwrap();
    assert_eq!(
        f.uploads.upload_slot(token).await.unwrap(),
        TransferSlot {
            kind: SlotKind::FileSlot,
            source: SlotSource::MiniSlot
        }
    );
}

#[tokio::test]
async fn operators_bypass_exhausted_mini_slots() {
    let f = fixture(
        |c| {
            c.slots = 1;
            c.extra_slots = 0;
        },
        &[("a.bin", 100_000)],
    )
    .await;
    f.uploads
        .prepare_upload(request(9, 9, file_tth(100_000)))
        .await
        .unwrap();

    let mut list = request(1, 1, file_tth(100_000));
    list.kind = UploadKind::FileList;
    list.tth = None;
    list.supports_mini_slots = true;
    assert!(
        f.uploads.prepare_upload(list.clone()).await.is_err(),
        "no mini slots remain"
    );

    list.operator = true;
    list.connection = QueueToken(2);
    assert!(f.uploads.prepare_upload(list).await.is_ok(), "ops always pass");
}

#[tokio::test]
async fn slot_hooks_override_the_cap() {
    let f = fixture(|c| c.slots = 1, &[("a.bin", 100_000)]).await;
    let tth = file_tth(100_000);
    f.uploads.prepare_upload(request(9, 9, tth)).await.unwrap();

    f.uploads.slot_hooks().subscribe(
        "grant-friends",
        Arc::new(|req: &UploadRequest| {
            if req.user.as_ref().is_some_and(|u| u.nick == "peer1") {
                Ok(Some(TransferSlot {
                    kind: SlotKind::UserSlot,
                    source: SlotSource::Hook("grant-friends".into()),
                }))
            } else {
                Ok(None)
            }
        }),
    );

    let token = f.uploads.prepare_upload(request(1, 1, tth)).await.unwrap();
    assert_eq!(
        f.uploads.upload_slot(token).await.unwrap().source,
        SlotSource::Hook("grant-friends".into())
    );
    assert!(
        f.uploads.prepare_upload(request(2, 2, tth)).await.is_err(),
        "hook grants are per-user, the cap still holds for others"
    );
}

#[tokio::test]
async fn delayed_upload_reuses_the_open_stream() {
    let f = fixture(|c| c.delay_ms = 60_000, &[("a.bin", 50_000)]).await;
    let tth = file_tth(50_000);

    let first = f.uploads.prepare_upload(request(1, 1, tth)).await.unwrap();
    f.uploads.upload_finished(first).await;
    assert_eq!(f.uploads.upload_count().await, 0);

    // Remove the file from disk: a reopen would fail, so success proves the
    // delayed stream was handed over.
    fs::remove_file(f.share_dir.path().join("a.bin")).unwrap();
    let second = f.uploads.prepare_upload(request(1, 1, tth)).await.unwrap();
    assert_eq!(f.uploads.upload_count().await, 1);
    let _ = second;
}

#[tokio::test]
async fn delay_entries_expire_on_tick() {
    let f = fixture(|c| c.delay_ms = 10, &[("a.bin", 50_000)]).await;
    let tth = file_tth(50_000);

    let first = f.uploads.prepare_upload(request(1, 1, tth)).await.unwrap();
    f.uploads.upload_finished(first).await;
    f.uploads.tick(now_ms() + 60_000).await;

    fs::remove_file(f.share_dir.path().join("a.bin")).unwrap();
    assert!(
        f.uploads.prepare_upload(request(1, 1, tth)).await.is_err(),
        "expired delay entry must not resurrect the stream"
    );
}

#[tokio::test]
async fn ip_reservations_block_other_users_from_the_same_address() {
    let f = fixture(|c| c.slots = 3, &[("a.bin", 100_000)]).await;
    let tth = file_tth(100_000);

    f.uploads.prepare_upload(request(1, 1, tth)).await.unwrap();
    // A different address is unaffected while slots remain.
    f.uploads.prepare_upload(request(3, 3, tth)).await.unwrap();

    // Same address as peer1, different user: the reservation blocks the
    // grant even though a slot is still free.
    let mut intruder = request(2, 2, tth);
    intruder.ip = "10.0.0.1".into();
    assert!(matches!(
        f.uploads.prepare_upload(intruder).await,
        Err(UploadError::SlotsFull { .. })
    ));
}

#[tokio::test]
async fn slot_conservation_holds_through_grant_and_release() {
    let f = fixture(
        |c| {
            c.slots = 2;
            c.extra_slots = 1;
        },
        &[("a.bin", 100_000)],
    )
    .await;
    let tth = file_tth(100_000);
    let config_slots = 2usize;
    let extra = 1usize;

    let mut tokens = Vec::new();
    for user in 1..=5u8 {
        let mut req = request(user, user as u32, tth);
        req.kind = if user > 3 { UploadKind::FileList } else { UploadKind::File };
        if user > 3 {
            req.tth = None;
            req.supports_mini_slots = true;
        }
        if let Ok(t) = f.uploads.prepare_upload(req).await {
            tokens.push(t);
        }
        let (user_slots, mini_slots) = f.uploads.slot_usage().await;
        assert!(user_slots <= config_slots + extra, "user slot conservation");
        assert!(mini_slots <= extra, "mini slot conservation");
    }

    for t in tokens {
        f.uploads.upload_aborted(t).await;
        let (user_slots, mini_slots) = f.uploads.slot_usage().await;
        assert!(user_slots <= config_slots + extra);
        assert!(mini_slots <= extra);
    }

    let _ = &f.state_dir;
}

#[tokio::test]
async fn mcn_balance_sheds_the_heaviest_user_when_oversubscribed() {
    let f = fixture(
        |c| {
            c.slots = 1;
            c.mini_file_size_kib = 1; // keep the big file out of the small path
        },
        &[("big.bin", 500_000)],
    )
    .await;
    let tth = file_tth(500_000);

    let mut first = request(1, 1, tth);
    first.mcn = true;
    f.uploads.prepare_upload(first).await.unwrap();

    // Nothing oversubscribed yet.
    assert!(f.uploads.pick_mcn_disconnect().await.is_none());

    // A second full MCN connection from the same user needs a free slot to
    // stay ahead of everyone else; the single slot is taken.
    let mut second = request(1, 2, tth);
    second.mcn = true;
    assert!(matches!(
        f.uploads.prepare_upload(second).await,
        Err(UploadError::SlotsFull { .. })
    ));
}

#[tokio::test]
async fn closing_the_connection_releases_slot_and_delayed_entries() {
    let f = fixture(|c| c.delay_ms = 60_000, &[("a.bin", 50_000)]).await;
    let tth = file_tth(50_000);

    let token = f.uploads.prepare_upload(request(1, 1, tth)).await.unwrap();
    f.uploads.upload_finished(token).await;
    f.uploads.connection_closed(QueueToken(1)).await;

    let (user_slots, _) = f.uploads.slot_usage().await;
    assert_eq!(user_slots, 0);

    fs::remove_file(f.share_dir.path().join("a.bin")).unwrap();
    assert!(
        f.uploads.prepare_upload(request(1, 1, tth)).await.is_err(),
        "delayed stream died with the connection"
    );
}

#[tokio::test]
async fn whole_file_requests_clip_to_the_file_size() {
    let f = fixture(|_| {}, &[("a.bin", 123_456)]).await;
    let token = f
        .uploads
        .prepare_upload(request(1, 1, file_tth(123_456)))
        .await
        .unwrap();
    assert_eq!(
        f.uploads.upload_segment(token).await.unwrap(),
        Segment::new(0, 123_456)
    );
}

