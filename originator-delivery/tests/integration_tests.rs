//! End-to-end delivery scenarios against the mock SMTP server.

mod support;

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use chrono::Utc;
use originator_common::{
    MailboxState, MsgStatus, MsgToSend, StopController, SystemClock, TlsAssurance,
};
use originator_delivery::{
    DeliveryWorker, MxResolver, RelayAuthType, SmtpSettings, StaticMxResolver, WorkerOptions,
};
use originator_store::{Store, StoreConfig};
use support::{mock_server::MockSmtpServer, LogEvent, RecordingLog};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(30);

fn test_message(mailboxes: &[&str]) -> MsgToSend {
    MsgToSend::new(
        "sender@origin.test",
        "example.test",
        mailboxes.iter().map(ToString::to_string).collect(),
        b"Subject: test\r\n\r\nhello\r\n.leading dot\r\n".to_vec(),
    )
}

fn resolver_for(server: &MockSmtpServer) -> Arc<dyn MxResolver> {
    let addr = server.addr();
    Arc::new(
        StaticMxResolver::new()
            .with_mx_on("example.test", "mx.example.test", 10, addr.port())
            .with_host("mx.example.test", vec![addr.ip()]),
    )
}

fn spawn_worker(
    store: &Store,
    resolver: Arc<dyn MxResolver>,
    settings: SmtpSettings,
    log: &Arc<RecordingLog>,
) -> (StopController, JoinHandle<()>) {
    let ctl = StopController::new();
    let worker = DeliveryWorker::new(
        store.clone(),
        resolver,
        Arc::new(ArcSwap::from_pointee(settings)),
        Arc::clone(log) as Arc<dyn originator_delivery::SendLog>,
        Arc::new(SystemClock),
        ctl.token(),
        WorkerOptions {
            poll_interval: Duration::from_millis(25),
        },
    );
    let handle = tokio::spawn(worker.run());
    (ctl, handle)
}

async fn stop_worker(ctl: StopController, handle: JoinHandle<()>) {
    ctl.stop("test finished");
    handle.await.expect("worker task panicked");
}

fn has_result(events: &[LogEvent]) -> bool {
    events.iter().any(|e| matches!(e, LogEvent::Result { .. }))
}

#[tokio::test]
async fn single_recipient_success_without_tls() {
    let server = MockSmtpServer::builder().build().await.expect("server");
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    let id = store
        .run_tx(|tx| tx.insert(test_message(&["a@example.test"])))
        .await
        .expect("insert");

    let (ctl, handle) = spawn_worker(
        &store,
        resolver_for(&server),
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    assert_eq!(log.attempts(), vec![id]);
    let results = log.results();
    assert_eq!(results.len(), 1);
    let (result_id, status, mailbox_results, tls) = &results[0];
    assert_eq!(*result_id, id);
    assert_eq!(*status, MsgStatus::FinalDelivered);
    assert_eq!(*tls, TlsAssurance::NoTls);
    assert_eq!(mailbox_results.len(), 1);
    assert_eq!(mailbox_results[0].mailbox, "a@example.test");
    assert_eq!(mailbox_results[0].state, MailboxState::Succeeded);
    assert_eq!(mailbox_results[0].success_mx, "mx.example.test");

    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::FinalDelivered);
    assert!(stored.pending_mailboxes.is_empty());
    assert!(stored.invariants_hold());

    // Dot-stuffing applied on the wire.
    let commands = server.commands();
    assert!(commands.iter().any(|c| c.starts_with("EHLO originator.test")));
    server.shutdown();
}

#[tokio::test]
async fn transient_connect_failure_reschedules() {
    // A bound-then-dropped listener yields a port that refuses connections.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let dead_addr = dead.local_addr().expect("addr");
    drop(dead);

    let resolver: Arc<dyn MxResolver> = Arc::new(
        StaticMxResolver::new()
            .with_mx_on("example.test", "mx.example.test", 10, dead_addr.port())
            .with_host("mx.example.test", vec![dead_addr.ip()]),
    );

    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();
    let before = Utc::now();
    let id = store
        .run_tx(|tx| tx.insert(test_message(&["a@example.test"])))
        .await
        .expect("insert");

    let (ctl, handle) = spawn_worker(
        &store,
        resolver,
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    let results = log.results();
    assert_eq!(results.len(), 1, "a rescheduled message must not re-run early");
    let (_, status, mailbox_results, _) = &results[0];
    assert_eq!(*status, MsgStatus::NonFinalIdle);
    assert!(mailbox_results.is_empty());

    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::NonFinalIdle);
    assert_eq!(stored.pending_mailboxes, vec!["a@example.test"]);
    assert!(stored.mailbox_results.is_empty());
    assert_eq!(stored.attempts_since_progress, 1);
    // First schedule slot is one minute.
    let delay = stored.next_attempt_time - before;
    assert!(delay >= chrono::Duration::seconds(55) && delay <= chrono::Duration::seconds(70));
}

#[tokio::test]
async fn temp_failure_at_mail_from_keeps_results_untouched() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(421, "4.3.2 try again later")
        .build()
        .await
        .expect("server");
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    let id = store
        .run_tx(|tx| tx.insert(test_message(&["a@example.test"])))
        .await
        .expect("insert");

    let (ctl, handle) = spawn_worker(
        &store,
        resolver_for(&server),
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    assert_eq!(log.attempts().len(), 1);
    let results = log.results();
    assert!(results[0].2.is_empty());

    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::NonFinalIdle);
    assert!(stored.mailbox_results.is_empty());
    assert_eq!(stored.attempts_since_progress, 1);
    server.shutdown();
}

#[tokio::test]
async fn mixed_rcpt_outcomes_deliver_with_partial_rejection() {
    let server = MockSmtpServer::builder()
        .with_rcpt_response_for("bad@example.test", 550, "5.1.1 User unknown")
        .build()
        .await
        .expect("server");
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    let id = store
        .run_tx(|tx| tx.insert(test_message(&["good@example.test", "bad@example.test"])))
        .await
        .expect("insert");

    let (ctl, handle) = spawn_worker(
        &store,
        resolver_for(&server),
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::FinalDelivered);
    assert!(stored.pending_mailboxes.is_empty());
    assert_eq!(stored.mailbox_results.len(), 2);
    assert!(stored.invariants_hold());

    let good = stored
        .mailbox_results
        .iter()
        .find(|r| r.mailbox == "good@example.test")
        .expect("good record");
    assert_eq!(good.state, MailboxState::Succeeded);

    let bad = stored
        .mailbox_results
        .iter()
        .find(|r| r.mailbox == "bad@example.test")
        .expect("bad record");
    assert_eq!(bad.state, MailboxState::PermFailed);
    let failure = bad.failure.as_ref().expect("failure payload");
    assert_eq!(failure.reply_code, 550);
    assert_eq!(failure.enh_status.to_string(), "5.1.1");
    assert_eq!(failure.lines, vec!["550 5.1.1 User unknown"]);
    server.shutdown();
}

#[tokio::test]
async fn schedule_exhaustion_gives_up_on_all_pending() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(451, "4.7.1 greylisted")
        .build()
        .await
        .expect("server");
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    let mut msg = test_message(&["a@example.test", "b@example.test"]);
    // Zero-minute delays make the three attempts run back to back.
    msg.custom_retry_schedule = true;
    msg.future_retry_delay_minutes = vec![0, 0];
    let id = store.run_tx(|tx| tx.insert(msg)).await.expect("insert");

    let (ctl, handle) = spawn_worker(
        &store,
        resolver_for(&server),
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(
        |events| {
            events.iter().any(|e| {
                matches!(e, LogEvent::Result { status: MsgStatus::FinalGaveUp, .. })
            })
        },
        WAIT,
    )
    .await;
    stop_worker(ctl, handle).await;

    assert_eq!(log.attempts().len(), 3, "two scheduled retries then give-up");

    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::FinalGaveUp);
    assert!(stored.pending_mailboxes.is_empty());
    assert_eq!(stored.mailbox_results.len(), 2);
    assert!(stored
        .mailbox_results
        .iter()
        .all(|r| r.state == MailboxState::GaveUp));
    assert!(stored.invariants_hold());
    server.shutdown();
}

#[tokio::test]
async fn crash_recovery_resets_in_flight_messages() {
    let server = MockSmtpServer::builder().build().await.expect("server");
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    // Simulate a crash: a message left mid-send.
    let id = store
        .run_tx(|tx| {
            let id = tx.insert(test_message(&["a@example.test"]))?;
            let mut msg = tx.get(id).expect("just inserted");
            msg.status = MsgStatus::NonFinalSending;
            tx.update(msg)?;
            Ok(id)
        })
        .await
        .expect("seed");

    let (ctl, handle) = spawn_worker(
        &store,
        resolver_for(&server),
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    let resets = log.resets();
    assert_eq!(resets, vec![vec![id]]);

    // on_reset precedes any on_attempt.
    let events = log.snapshot();
    let reset_pos = events
        .iter()
        .position(|e| matches!(e, LogEvent::Reset(_)))
        .expect("reset event");
    let attempt_pos = events
        .iter()
        .position(|e| matches!(e, LogEvent::Attempt(_)))
        .expect("attempt event");
    assert!(reset_pos < attempt_pos);

    // And the recovered message then delivers normally.
    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::FinalDelivered);
    server.shutdown();
}

#[tokio::test]
async fn required_tls_handshake_failure_schedules_retry() {
    // The mock accepts STARTTLS but never speaks TLS, so the handshake
    // fails; with an assurance requirement that failure is the outcome.
    let server = MockSmtpServer::builder()
        .with_ehlo_capabilities(vec![
            "mock.example.test".to_string(),
            "STARTTLS".to_string(),
        ])
        .with_starttls_response(220, "ready to start TLS")
        .build()
        .await
        .expect("server");
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    let mut msg = test_message(&["a@example.test"]);
    msg.tls_requirement = TlsAssurance::TlsDomainMatchCert;
    let id = store.run_tx(|tx| tx.insert(msg)).await.expect("insert");

    let (ctl, handle) = spawn_worker(
        &store,
        resolver_for(&server),
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    let results = log.results();
    assert_eq!(results[0].1, MsgStatus::NonFinalIdle);
    assert!(results[0].2.is_empty());

    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::NonFinalIdle);
    assert_eq!(stored.pending_mailboxes, vec!["a@example.test"]);
    assert_eq!(stored.attempts_since_progress, 1);
    server.shutdown();
}

#[tokio::test]
async fn required_starttls_not_offered_aborts() {
    let server = MockSmtpServer::builder().build().await.expect("server");
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    let mut msg = test_message(&["a@example.test"]);
    msg.tls_requirement = TlsAssurance::StartTls;
    let id = store.run_tx(|tx| tx.insert(msg)).await.expect("insert");

    let (ctl, handle) = spawn_worker(
        &store,
        resolver_for(&server),
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::FinalAborted);
    assert!(stored.pending_mailboxes.is_empty());
    assert!(stored
        .mailbox_results
        .iter()
        .all(|r| r.state == MailboxState::PermFailed));
    server.shutdown();
}

#[tokio::test]
async fn opportunistic_starttls_failure_falls_back_to_cleartext() {
    let server = MockSmtpServer::builder()
        .with_ehlo_capabilities(vec![
            "mock.example.test".to_string(),
            "STARTTLS".to_string(),
        ])
        .with_starttls_response(220, "ready to start TLS")
        .build()
        .await
        .expect("server");
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    let id = store
        .run_tx(|tx| tx.insert(test_message(&["a@example.test"])))
        .await
        .expect("insert");

    let (ctl, handle) = spawn_worker(
        &store,
        resolver_for(&server),
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    // The failed upgrade is swallowed: same attempt redials in cleartext.
    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::FinalDelivered);
    assert_eq!(log.attempts().len(), 1);
    assert!(server.sessions() >= 2, "expected a cleartext redial");
    server.shutdown();
}

#[tokio::test]
async fn relay_delivery_authenticates_with_plain() {
    let server = MockSmtpServer::builder()
        .with_ehlo_capabilities(vec![
            "relay.origin.test".to_string(),
            "AUTH PLAIN LOGIN".to_string(),
        ])
        .with_auth_response(235, "2.7.0 authentication successful")
        .build()
        .await
        .expect("server");
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    let id = store
        .run_tx(|tx| tx.insert(test_message(&["a@example.test"])))
        .await
        .expect("insert");

    let addr = server.addr();
    let mut settings = SmtpSettings::direct("originator.test");
    settings.use_relay = true;
    settings.relay_host = addr.ip().to_string();
    settings.relay_port = addr.port();
    settings.relay_auth_type = RelayAuthType::Plain;
    settings.relay_username = "tim".to_string();
    settings.relay_password = "tanstaaftanstaaf".to_string();

    // The relay path needs no MX data at all.
    let resolver: Arc<dyn MxResolver> = Arc::new(StaticMxResolver::new());
    let (ctl, handle) = spawn_worker(&store, resolver, settings, &log);
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::FinalDelivered);

    let commands = server.commands();
    assert!(
        commands
            .iter()
            .any(|c| c == "AUTH PLAIN AHRpbQB0YW5zdGFhZnRhbnN0YWFm"),
        "expected AUTH PLAIN with packed credentials, got {commands:?}"
    );
    server.shutdown();
}

#[tokio::test]
async fn resolver_nxdomain_aborts_message() {
    let store = Store::open(StoreConfig::default()).await.expect("store");
    let log = RecordingLog::new();

    let id = store
        .run_tx(|tx| tx.insert(test_message(&["a@example.test"])))
        .await
        .expect("insert");

    // Resolver knows nothing about example.test.
    let resolver: Arc<dyn MxResolver> = Arc::new(StaticMxResolver::new());
    let (ctl, handle) = spawn_worker(
        &store,
        resolver,
        SmtpSettings::direct("originator.test"),
        &log,
    );
    log.wait_until(has_result, WAIT).await;
    stop_worker(ctl, handle).await;

    let stored = store.run_read(|tx| tx.get(id)).await.expect("stored");
    assert_eq!(stored.status, MsgStatus::FinalAborted);
    let failure = stored.mailbox_results[0].failure.as_ref().expect("failure");
    assert_eq!(failure.stage, originator_common::SendStage::Lookup);
    assert_eq!(failure.kind, originator_common::FailureKind::Resolver);
}
