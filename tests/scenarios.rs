//! End-to-end scenarios against the scripted fake server.
//!
//! Each test starts a `ScriptedServer` with the exact wire exchange
//! it expects, points a real `Session` at it over plain TCP, and
//! asserts both the parsed results and the commands that actually
//! hit the wire.

mod fake_imap;

use fake_imap::{Exchange, ScriptedServer};
use imap_engine::{
    Error, FetchOptions, ImapConfig, QresyncParams, SearchCriterion, Session, WatchEvent, mime,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn config_for(server: &ScriptedServer) -> ImapConfig {
    let mut config = ImapConfig::new("127.0.0.1", "testuser", "pass");
    config.port = server.port();
    config.tls = false;
    config
}

fn subject_of(message: &imap_engine::Message) -> String {
    let headers = message.part("HEADER").expect("headers part");
    let parsed = mime::parse_headers(&headers.text());
    parsed.get("subject").unwrap_or("").to_string()
}

// ── S1: LOGIN + SELECT + SEARCH + FETCH headers ────────────────────

#[tokio::test]
async fn login_select_search_fetch_headers() {
    let server = ScriptedServer::start(
        "* OK IMAP4rev1 Service Ready",
        vec![
            Exchange::new("LOGIN", "A001 OK LOGIN completed\r\n"),
            Exchange::new(
                "CAPABILITY",
                "* CAPABILITY IMAP4rev1 IDLE\r\nA002 OK CAPABILITY completed\r\n",
            ),
            Exchange::new(
                "SELECT",
                "* 172 EXISTS\r\n\
                 * 1 RECENT\r\n\
                 * OK [UIDVALIDITY 3857529045] UIDs valid\r\n\
                 * OK [UIDNEXT 4392] Predicted next UID\r\n\
                 * FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
                 A003 OK [READ-WRITE] SELECT completed\r\n",
            ),
            Exchange::new("UID SEARCH", "* SEARCH 2 84 882\r\nA004 OK UID SEARCH completed\r\n"),
            Exchange::new(
                "UID FETCH",
                "* 1 FETCH (UID 2 FLAGS (\\Seen) BODY[HEADER] {14}\r\nSubject: Hello\r\n)\r\n\
                 * 2 FETCH (UID 84 FLAGS () BODY[HEADER] {14}\r\nSubject: World\r\n)\r\n\
                 * 3 FETCH (UID 882 FLAGS (\\Seen) BODY[HEADER] {11}\r\nSubject: Hi\r\n)\r\n\
                 A005 OK UID FETCH completed\r\n",
            ),
        ],
    )
    .await;

    let mut session = Session::connect(config_for(&server)).await.unwrap();
    session.authenticate().await.unwrap();
    let mailbox = session.open_box("INBOX", false).await.unwrap();
    assert_eq!(mailbox.messages.total, 172);
    assert_eq!(mailbox.uid_validity, 3_857_529_045);
    assert_eq!(mailbox.uid_next, 4392);
    assert!(!mailbox.read_only);

    let messages = session
        .search_fetch(&[SearchCriterion::All], &FetchOptions::bodies(&["HEADER"]))
        .await
        .unwrap();

    assert_eq!(messages.len(), 3);
    let uids: Vec<u32> = messages.iter().map(|m| m.uid).collect();
    assert_eq!(uids, vec![2, 84, 882]);
    let subjects: Vec<String> = messages.iter().map(subject_of).collect();
    assert_eq!(subjects, vec!["Hello", "World", "Hi"]);

    // Every data command the facade produced addresses UID space.
    assert_eq!(
        server.received(),
        vec![
            "A001 LOGIN testuser pass".to_string(),
            "A002 CAPABILITY".to_string(),
            "A003 SELECT INBOX".to_string(),
            "A004 UID SEARCH ALL".to_string(),
            "A005 UID FETCH 2,84,882 (UID FLAGS BODY.PEEK[HEADER])".to_string(),
        ]
    );
}

// ── S2: XOAUTH2 authentication failure ─────────────────────────────

#[tokio::test]
async fn xoauth2_failure_surfaces_diagnostic() {
    let server = ScriptedServer::start(
        "* OK ready",
        vec![
            Exchange::new("AUTHENTICATE XOAUTH2", "+ eyJzdGF0dXMiOiI0MDAifQ==\r\n"),
            // The client aborts the exchange with a blank line.
            Exchange::new("", "A001 NO SASL authentication failed\r\n"),
        ],
    )
    .await;

    let mut config = ImapConfig::with_xoauth2("127.0.0.1", "user@example.com", "bad-token");
    config.port = server.port();
    config.tls = false;

    let mut session = Session::connect(config).await.unwrap();
    let err = session.authenticate().await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains("SASL authentication failed"), "{text}");
    assert!(text.contains("{\"status\":\"400\"}"), "{text}");

    // The blank abort line reached the server.
    assert_eq!(server.received().last().map(String::as_str), Some(""));
}

// ── S3: FETCH with literal body ────────────────────────────────────

#[tokio::test]
async fn fetch_with_literal_body() {
    let server = ScriptedServer::start(
        "* PREAUTH [CAPABILITY IMAP4rev1] ready",
        vec![
            Exchange::new(
                "SELECT",
                "* 1 EXISTS\r\nA001 OK [READ-WRITE] SELECT completed\r\n",
            ),
            Exchange::new(
                "UID FETCH",
                "* 1 FETCH (UID 1 FLAGS () BODY[TEXT] {11}\r\nHello\r\nWorld)\r\n\
                 A002 OK UID FETCH completed\r\n",
            ),
        ],
    )
    .await;

    let mut session = Session::connect(config_for(&server)).await.unwrap();
    session.open_box("INBOX", false).await.unwrap();
    let messages = session
        .fetch(&[1], &FetchOptions::bodies(&["TEXT"]))
        .await
        .unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].uid, 1);
    assert_eq!(messages[0].parts.len(), 1);
    let part = &messages[0].parts[0];
    assert_eq!(part.which, "TEXT");
    assert_eq!(part.size, 11);
    assert_eq!(part.body, b"Hello\r\nWorld");
}

// ── S4: IDLE notification stream ───────────────────────────────────

#[tokio::test]
async fn idle_notification_stream() {
    let server = ScriptedServer::start(
        "* PREAUTH [CAPABILITY IMAP4rev1 IDLE] ready",
        vec![
            Exchange::new(
                "SELECT",
                "* 172 EXISTS\r\nA001 OK [READ-WRITE] SELECT completed\r\n",
            ),
            Exchange::new("IDLE", "+ idling\r\n* 173 EXISTS\r\n* 3 EXPUNGE\r\n"),
            Exchange::new("DONE", "A002 OK IDLE terminated\r\n"),
        ],
    )
    .await;

    let mut session = Session::connect(config_for(&server)).await.unwrap();
    session.open_box("INBOX", false).await.unwrap();

    let mut watch = session.idle().await.unwrap();
    assert!(watch.is_active());

    match watch.recv().await.unwrap() {
        WatchEvent::Exists(n) => assert_eq!(n, 173),
        other => panic!("expected EXISTS first, got {other:?}"),
    }
    match watch.recv().await.unwrap() {
        WatchEvent::Expunge(n) => assert_eq!(n, 3),
        other => panic!("expected EXPUNGE second, got {other:?}"),
    }

    watch.stop().await.unwrap();
    let received = server.received();
    assert_eq!(received.last().map(String::as_str), Some("DONE"));
}

// ── S5: QRESYNC resynchronization ──────────────────────────────────

#[tokio::test]
async fn qresync_open_reports_vanished() {
    let server = ScriptedServer::start(
        "* OK [CAPABILITY IMAP4rev1 QRESYNC] Ready",
        vec![
            Exchange::new("LOGIN", "A001 OK LOGIN completed\r\n"),
            Exchange::new(
                "SELECT",
                "* 5 EXISTS\r\n\
                 * VANISHED (EARLIER) 300:302,405\r\n\
                 * OK [UIDVALIDITY 67890] UIDs valid\r\n\
                 * OK [HIGHESTMODSEQ 715194045007] Highest\r\n\
                 A002 OK [READ-WRITE] SELECT completed\r\n",
            ),
        ],
    )
    .await;

    let mut session = Session::connect(config_for(&server)).await.unwrap();
    session.authenticate().await.unwrap();
    assert!(session.has_qresync());

    let opened = session
        .open_box_with_qresync(
            "INBOX",
            &QresyncParams {
                uid_validity: 67890,
                last_known_modseq: 12345,
                known_uids: None,
                sequence_match: None,
            },
            false,
        )
        .await
        .unwrap();

    assert_eq!(opened.vanished, vec![300, 301, 302, 405]);
    assert!(opened.vanished_earlier);
    assert_eq!(opened.mailbox.highest_modseq, Some(715_194_045_007));
    assert_eq!(opened.mailbox.uid_validity, 67890);

    let received = server.received();
    assert_eq!(
        received.last().map(String::as_str),
        Some("A002 SELECT INBOX (QRESYNC (67890 12345))")
    );
}

// ── S6: timeout without corruption ─────────────────────────────────

#[tokio::test]
async fn timeout_does_not_wedge_the_pipeline() {
    let server = ScriptedServer::start(
        "* PREAUTH [CAPABILITY IMAP4rev1] ready",
        vec![
            Exchange::new(
                "SELECT",
                "* 1 EXISTS\r\nA001 OK [READ-WRITE] SELECT completed\r\n",
            ),
            // Swallow the FETCH: no reply at all.
            Exchange::new("UID FETCH", ""),
            Exchange::new("NOOP", "A003 OK NOOP completed\r\n"),
        ],
    )
    .await;

    let mut config = config_for(&server);
    config.command_timeout = Duration::from_millis(150);

    let mut session = Session::connect(config).await.unwrap();
    session.open_box("INBOX", false).await.unwrap();

    let err = session
        .fetch(&[1], &FetchOptions::bodies(&["HEADER"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{err:?}");

    // The next command uses a fresh tag and completes normally.
    let untagged = session.noop().await.unwrap();
    assert!(untagged.is_empty());
    assert!(
        server.received().contains(&"A003 NOOP".to_string()),
        "{:?}",
        server.received()
    );
}

// ── Polling fallback ───────────────────────────────────────────────

#[tokio::test]
async fn watch_falls_back_to_noop_polling() {
    let server = ScriptedServer::start(
        "* PREAUTH [CAPABILITY IMAP4rev1] ready",
        vec![
            Exchange::new(
                "SELECT",
                "* 10 EXISTS\r\nA001 OK [READ-WRITE] SELECT completed\r\n",
            ),
            Exchange::new("NOOP", "* 11 EXISTS\r\nA002 OK NOOP completed\r\n"),
        ],
    )
    .await;

    let mut session = Session::connect(config_for(&server)).await.unwrap();
    session.open_box("INBOX", false).await.unwrap();

    let mut watch = session.watch(Duration::from_millis(50)).await.unwrap();
    match watch.recv().await.unwrap() {
        WatchEvent::Exists(n) => assert_eq!(n, 11),
        other => panic!("expected EXISTS, got {other:?}"),
    }
    watch.stop().await.unwrap();
}

// ── Flag, copy and expunge wire forms ──────────────────────────────

#[tokio::test]
async fn store_copy_expunge_use_uid_space() {
    let server = ScriptedServer::start(
        "* PREAUTH [CAPABILITY IMAP4rev1] ready",
        vec![
            Exchange::new(
                "SELECT",
                "* 3 EXISTS\r\nA001 OK [READ-WRITE] SELECT completed\r\n",
            ),
            Exchange::new("STORE", "A002 OK STORE completed\r\n"),
            Exchange::new("STORE", "A003 OK STORE completed\r\n"),
            Exchange::new("COPY", "A004 OK COPY completed\r\n"),
            Exchange::new("EXPUNGE", "* 2 EXPUNGE\r\nA005 OK EXPUNGE completed\r\n"),
        ],
    )
    .await;

    let mut session = Session::connect(config_for(&server)).await.unwrap();
    session.open_box("INBOX", false).await.unwrap();
    session
        .add_flags(&[2, 3], &[imap_engine::Flag::Seen])
        .await
        .unwrap();
    session
        .del_flags(&[2], &[imap_engine::Flag::Flagged])
        .await
        .unwrap();
    session.copy(&[2, 3], "Archive").await.unwrap();
    session.expunge().await.unwrap();

    assert_eq!(
        server.received()[1..],
        [
            "A002 UID STORE 2,3 +FLAGS (\\Seen)".to_string(),
            "A003 UID STORE 2 -FLAGS (\\Flagged)".to_string(),
            "A004 UID COPY 2,3 Archive".to_string(),
            "A005 EXPUNGE".to_string(),
        ]
    );
}

// ── LIST parsing over the wire ─────────────────────────────────────

#[tokio::test]
async fn list_returns_entries() {
    let server = ScriptedServer::start(
        "* PREAUTH [CAPABILITY IMAP4rev1] ready",
        vec![Exchange::new(
            "LIST",
            "* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n\
             * LIST (\\HasChildren \\Noselect) \"/\" \"Work\"\r\n\
             * LIST (\\HasNoChildren) \"/\" \"Work/Reports\"\r\n\
             A001 OK LIST completed\r\n",
        )],
    )
    .await;

    let mut session = Session::connect(config_for(&server)).await.unwrap();
    let entries = session.list("", "*").await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].name, "INBOX");
    assert_eq!(entries[1].attributes, vec!["\\HasChildren", "\\Noselect"]);
    assert_eq!(entries[2].name, "Work/Reports");
    assert_eq!(entries[2].delimiter, Some('/'));
}
