//! Hub session state-machine tests, driven line by line without a socket.

use tokio::sync::{broadcast, mpsc};

use crate::config::HubConfig;
use crate::share::SearchQuery;
use crate::types::{ConnectionState, Event, MessageSeverity};
use crate::utils::now_ms;

use super::search_queue::PendingSearch;
use super::{HubRequest, HubSession};

fn config() -> HubConfig {
    HubConfig {
        nick: "tester".into(),
        ..HubConfig::default()
    }
}

async fn adc_session() -> (
    HubSession,
    broadcast::Receiver<Event>,
    mpsc::UnboundedReceiver<HubRequest>,
) {
    let (tx, rx) = broadcast::channel(4096);
    let session = HubSession::new("adc://hub.example:1511", config(), tx).unwrap();
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    session.set_request_sink(sink_tx);
    (session, rx, sink_rx)
}

/// Walk an ADC session to the logged-in state
async fn login(session: &HubSession) {
    session.on_socket_connected().await;
    session.handle_line("ISUP ADBASE ADTIGR").await;
    session.handle_line("ISID AAAB").await;
    session.handle_line("IINF CT32 NITestHub").await;
    session.handle_line("BINF AAAB NItester").await;
    assert_eq!(session.connect_state().await, ConnectionState::Normal);
}

#[tokio::test]
async fn adc_login_walks_the_documented_states() {
    let (session, mut rx, _sink) = adc_session().await;

    session.on_socket_connected().await;
    assert_eq!(session.connect_state().await, ConnectionState::Protocol);
    let outbound = session.take_outbound().await;
    assert!(outbound.iter().any(|l| l.starts_with("HSUP ")));

    session.handle_line("ISID AAAB").await;
    assert_eq!(session.connect_state().await, ConnectionState::Identify);
    let outbound = session.take_outbound().await;
    assert!(
        outbound.iter().any(|l| l.starts_with("BINF AAAB ")),
        "identify sends our info"
    );

    session.handle_line("BINF AAAB NItester").await;
    assert_eq!(session.connect_state().await, ConnectionState::Normal);

    let mut states = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let Event::HubState { state, .. } = ev {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Protocol,
            ConnectionState::Identify,
            ConnectionState::Normal
        ]
    );
}

#[tokio::test]
async fn password_demand_moves_to_verify_and_answers() {
    let (session, _rx, _sink) = adc_session().await;
    session.set_password("hunter2").await;
    session.on_socket_connected().await;
    session.handle_line("ISID AAAB").await;
    session
        .handle_line("IGPA AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
        .await;
    assert_eq!(session.connect_state().await, ConnectionState::Verify);

    let outbound = session.take_outbound().await;
    assert!(
        outbound.iter().any(|l| l.starts_with("HPAS ")),
        "stored password answers the challenge"
    );

    session.handle_line("BINF AAAB NItester").await;
    assert_eq!(session.connect_state().await, ConnectionState::Normal);
}

#[tokio::test]
async fn missing_password_surfaces_a_status_instead() {
    let (session, mut rx, _sink) = adc_session().await;
    session.on_socket_connected().await;
    session.handle_line("ISID AAAB").await;
    session
        .handle_line("IGPA AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
        .await;

    let outbound = session.take_outbound().await;
    assert!(!outbound.iter().any(|l| l.starts_with("HPAS ")));

    let mut warned = false;
    while let Ok(ev) = rx.try_recv() {
        if let Event::HubStatus { message, .. } = ev
            && message.severity == MessageSeverity::Warning
        {
            warned = true;
        }
    }
    assert!(warned, "a password demand without a stored password warns");
}

#[tokio::test]
async fn user_table_and_counts_follow_binf_and_qui() {
    let (session, _rx, _sink) = adc_session().await;
    login(&session).await;

    session.handle_line("BINF AAAC NIalice CT2").await;
    session.handle_line("BINF AAAD NIop CT4").await;
    session.handle_line("BINF AAAE NIuser").await;

    // Our own BINF is in the table too.
    assert_eq!(session.user_count().await, 4);
    let counts = session.user_counts().await;
    assert_eq!(counts.registered, 1);
    assert_eq!(counts.ops, 1);

    session.handle_line("IQUI AAAE").await;
    assert_eq!(session.user_count().await, 3);
}

#[tokio::test]
async fn redirect_disconnects_and_records_the_target() {
    let (session, mut rx, _sink) = adc_session().await;
    login(&session).await;

    session.handle_line("IQUI AAAB RDadcs://next.hub:1511").await;
    assert_eq!(session.connect_state().await, ConnectionState::Disconnected);
    assert_eq!(
        session.redirect_target().await.as_deref(),
        Some("adcs://next.hub:1511")
    );

    let mut redirected = false;
    while let Ok(ev) = rx.try_recv() {
        if let Event::HubRedirect { target, .. } = ev {
            assert_eq!(target, "adcs://next.hub:1511");
            redirected = true;
        }
    }
    assert!(redirected);
}

#[tokio::test]
async fn chat_messages_land_in_the_cache_with_unread_counts() {
    let (session, mut rx, _sink) = adc_session().await;
    login(&session).await;
    session.handle_line("BINF AAAC NIalice").await;

    session.handle_line("BMSG AAAC hello\\sthere").await;
    session.handle_line("BMSG AAAC again").await;
    assert_eq!(session.unread_count().await, 2);
    assert_eq!(session.mark_read().await, 2);
    assert_eq!(session.unread_count().await, 0);

    let mut chats = 0;
    while let Ok(ev) = rx.try_recv() {
        if let Event::HubMessage { message, .. } = ev {
            assert_eq!(message.from, "alice");
            chats += 1;
        }
    }
    assert_eq!(chats, 2);
}

#[tokio::test]
async fn searches_are_flood_checked_then_forwarded() {
    let (session, _rx, mut sink) = adc_session().await;
    login(&session).await;
    session.handle_line("BINF AAAC NIalice I410.1.1.1").await;

    session.handle_line("BSCH AAAC ANlinux TOtok").await;
    match sink.try_recv() {
        Ok(HubRequest::Search { query, token, ip }) => {
            assert_eq!(query.include, vec!["linux"]);
            assert_eq!(token, "tok");
            assert_eq!(ip, "10.1.1.1");
        }
        other => panic!("expected a forwarded search, got {other:?}"),
    }
}

#[tokio::test]
async fn severe_ctm_flood_disconnects_with_ten_minute_backoff() {
    let (session, mut rx, mut sink) = adc_session().await;
    login(&session).await;
    session.handle_line("BINF AAAC NIpeer I410.9.9.9").await;
    while rx.try_recv().is_ok() {}

    // 41 CTM requests inside one window: 15 pass, the 16th trips the minor
    // limit (status only), the 41st trips the severe limit and disconnects.
    for i in 0..41 {
        session
            .handle_line(&format!("DCTM AAAC AAAB ADC/1.0 3000 tok{i}"))
            .await;
    }

    let mut forwarded = 0;
    while sink.try_recv().is_ok() {
        forwarded += 1;
    }
    assert_eq!(forwarded, 15, "requests below the minor limit pass through");

    assert_eq!(session.connect_state().await, ConnectionState::Disconnected);

    let mut spam_notices = 0;
    let mut errors = 0;
    while let Ok(ev) = rx.try_recv() {
        if let Event::HubStatus { message, .. } = ev {
            match message.severity {
                MessageSeverity::Verbose => spam_notices += 1,
                MessageSeverity::Error => errors += 1,
                _ => {}
            }
        }
    }
    assert_eq!(spam_notices, 1, "minor limit reported exactly once");
    assert_eq!(errors, 1, "severe disconnect reported exactly once");

    // The 10-minute backoff holds: no reconnect attempt before it elapses.
    let now = now_ms();
    session.tick(now + 599_000).await;
    assert_eq!(session.connect_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn outbound_searches_respect_the_minimum_interval() {
    let (session, _rx, _sink) = adc_session().await;
    login(&session).await;
    session.take_outbound().await;

    for token in ["a", "b"] {
        session
            .queue_search(PendingSearch {
                priority: 0,
                token: token.into(),
                query: SearchQuery {
                    include: vec!["linux".into()],
                    ..SearchQuery::default()
                },
            })
            .await
            .unwrap();
    }

    let base = now_ms() + 10_000;
    session.tick(base).await;
    let first: Vec<String> = session.take_outbound().await;
    assert_eq!(first.iter().filter(|l| l.contains("BSCH")).count(), 1);

    // One second later: nothing, the interval is five seconds.
    session.tick(base + 1000).await;
    assert!(session.take_outbound().await.is_empty());

    session.tick(base + 5000).await;
    let second = session.take_outbound().await;
    assert_eq!(second.iter().filter(|l| l.contains("BSCH")).count(), 1);
}

#[tokio::test]
async fn searches_cannot_be_queued_while_disconnected() {
    let (session, _rx, _sink) = adc_session().await;
    let err = session
        .queue_search(PendingSearch {
            priority: 0,
            token: "x".into(),
            query: SearchQuery::default(),
        })
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn nmdc_login_reaches_normal_through_the_same_states() {
    let (tx, mut rx) = broadcast::channel(1024);
    let session = HubSession::new("dchub://legacy.hub:411", config(), tx).unwrap();

    session.on_socket_connected().await;
    session
        .handle_line("$Lock EXTENDEDPROTOCOL_sample_lock Pk=hub")
        .await;
    assert_eq!(session.connect_state().await, ConnectionState::Identify);

    let outbound = session.take_outbound().await;
    assert!(outbound.iter().any(|l| l.starts_with("$Key ")));
    assert!(outbound.iter().any(|l| l == "$ValidateNick tester"));

    session.handle_line("$Hello tester").await;
    assert_eq!(session.connect_state().await, ConnectionState::Normal);
    let outbound = session.take_outbound().await;
    assert!(outbound.iter().any(|l| l.starts_with("$MyINFO ")));

    session.handle_line("$Hello alice").await;
    session
        .handle_line("$MyINFO $ALL alice here$ $10\u{1}$$42$")
        .await;
    assert_eq!(session.user_count().await, 1);

    let mut reached_normal = false;
    while let Ok(ev) = rx.try_recv() {
        if let Event::HubState { state, .. } = ev
            && state == ConnectionState::Normal
        {
            reached_normal = true;
        }
    }
    assert!(reached_normal);
}

#[tokio::test]
async fn search_results_are_forwarded_with_a_resolved_user() {
    let (session, _rx, mut sink) = adc_session().await;
    login(&session).await;
    session
        .handle_line("BINF AAAC NIbob IDLWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ")
        .await;

    session
        .handle_line(
            "DRES AAAC AAAB FNx.bin SI100 SL1 TRLWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ TOas1",
        )
        .await;
    match sink.try_recv() {
        Ok(HubRequest::SearchResult { user, size, tth, .. }) => {
            assert_eq!(user.nick, "bob");
            assert_eq!(user.hub_url, "adc://hub.example:1511");
            assert_eq!(size, 100);
            assert!(tth.is_some());
        }
        other => panic!("expected a search result, got {other:?}"),
    }
}

#[tokio::test]
async fn pbd_lines_are_forwarded_to_the_sink() {
    let (session, _rx, mut sink) = adc_session().await;
    login(&session).await;

    session
        .handle_line("DPBD AAAC THLWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ BU7 UP1")
        .await;
    match sink.try_recv() {
        Ok(HubRequest::Pbd(params)) => {
            assert_eq!(params.bundle, Some(7));
            assert!(params.update);
        }
        other => panic!("expected PBD, got {other:?}"),
    }
}
