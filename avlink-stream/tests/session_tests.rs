//! End-to-end tests for a session driven through a recording transport.
//!
//! These tests cover:
//! - FIFO correlation and coalescing of equal requests
//! - Timeout isolation and failure replies
//! - Subscription fan-out, deferral until initialization and periodic re-assertion
//! - Disconnect and reconnect clearing every trace of the previous link
//! - Banner, telnet refusal and operator diagnostics


use avlink_stream::{
    DeviceSettings, DiagnosticCommand, Event, Outcome, Request, Response, ResponseCallback,
    ResponseKind, Session, SessionConfig, SessionState, SubscriptionKey, TELNET_IAC,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{feedback, get, set, subscription, LineGrammar, RecordingTransport, BANNER};
use tokio::sync::mpsc::UnboundedReceiver;

type Calls = Arc<Mutex<Vec<(String, Option<Response>)>>>;

fn create_session(config: SessionConfig) -> (Arc<Session>, Arc<RecordingTransport>, UnboundedReceiver<Event>) {
    let transport = RecordingTransport::new();
    let session = Session::new(transport.clone(), Arc::new(LineGrammar), config)
        .expect("Failed to create session");
    let events = session.events().expect("events already taken");
    (session, transport, events)
}

/// Connect and wait out the initialization delay.
async fn initialized_session() -> (Arc<Session>, Arc<RecordingTransport>, UnboundedReceiver<Event>) {
    let (session, transport, events) = create_session(SessionConfig::default());
    session.on_connected();
    advance(Duration::from_millis(3_001)).await;
    assert!(session.is_initialized());
    (session, transport, events)
}

/// Let the frame pump catch up.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}

async fn receive(session: &Session, data: &str) {
    session.on_data(data.as_bytes());
    settle().await;
}

fn recorder(calls: &Calls, label: &str) -> Option<ResponseCallback> {
    let calls = Arc::clone(calls);
    let label = label.to_string();
    Some(Box::new(move |outcome: &Outcome, request: &Arc<dyn Request>| {
        calls
            .lock()
            .unwrap()
            .push((format!("{label}:{}", request.to_wire()), outcome.response().cloned()));
    }))
}

fn labels(calls: &Calls) -> Vec<String> {
    calls.lock().unwrap().iter().map(|(label, _)| label.clone()).collect()
}

fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_responses_resolve_in_enqueue_order() {
    let (session, transport, _events) = initialized_session().await;
    let calls = Calls::default();

    for index in 1..=4 {
        session.enqueue(get("Level1", "level", index), recorder(&calls, "get"));
    }
    assert_eq!(transport.commands(), vec!["Level1 get level 1"]);

    for (expected_writes, value) in (1..=4).zip(["-10", "-20", "-30", "-40"]) {
        assert_eq!(transport.commands().len(), expected_writes);
        receive(&session, &format!("+OK \"value\":{value}\r\n")).await;
    }

    let calls = calls.lock().unwrap();
    let seen: Vec<(String, String)> = calls
        .iter()
        .map(|(label, response)| {
            let value = response.as_ref().and_then(|r| r.value("value")).unwrap_or_default();
            (label.clone(), value.to_string())
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            ("get:Level1 get level 1".to_string(), "-10".to_string()),
            ("get:Level1 get level 2".to_string(), "-20".to_string()),
            ("get:Level1 get level 3".to_string(), "-30".to_string()),
            ("get:Level1 get level 4".to_string(), "-40".to_string()),
        ]
    );
    assert!(session.queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_equal_requests_share_one_write() {
    let (session, transport, _events) = initialized_session().await;
    let calls = Calls::default();

    session.enqueue(get("Mute1", "mute", 1), recorder(&calls, "c1"));
    session.enqueue(get("Mute1", "mute", 1), recorder(&calls, "c2"));
    assert_eq!(transport.commands(), vec!["Mute1 get mute 1"]);

    receive(&session, "+OK \"value\":true\r\n").await;

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "c1:Mute1 get mute 1");
    assert_eq!(calls[1].0, "c2:Mute1 get mute 1");
    assert_eq!(calls[0].1, calls[1].1);
    assert_eq!(calls[0].1.as_ref().and_then(|r| r.value("value")), Some("true"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_does_not_block_later_requests() {
    let (session, transport, mut events) = initialized_session().await;
    drain(&mut events);
    let calls = Calls::default();

    session.enqueue(get("Level1", "level", 1), recorder(&calls, "lost"));
    session.enqueue(get("Level2", "level", 1), recorder(&calls, "ok"));

    advance(Duration::from_secs(19)).await;
    assert_eq!(transport.commands(), vec!["Level1 get level 1"]);

    advance(Duration::from_millis(1_001)).await;
    assert_eq!(
        transport.commands(),
        vec!["Level1 get level 1", "Level2 get level 1"]
    );
    assert_eq!(
        drain(&mut events),
        vec![Event::RequestTimedOut {
            command: "Level1 get level 1".to_string()
        }]
    );

    receive(&session, "+OK \"value\":-3\r\n").await;

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], ("lost:Level1 get level 1".to_string(), None));
    assert_eq!(calls[1].0, "ok:Level2 get level 1");
    assert_eq!(calls[1].1.as_ref().and_then(|r| r.value("value")), Some("-3"));
}

#[tokio::test(start_paused = true)]
async fn test_failure_replies_still_resolve() {
    let (session, transport, _events) = initialized_session().await;
    let calls = Calls::default();

    session.enqueue(set("Level9", "level", 1, "0"), recorder(&calls, "a"));
    session.enqueue(set("Level1", "level", 1, "0"), recorder(&calls, "b"));
    session.enqueue(get("Level1", "level", 1), recorder(&calls, "c"));

    receive(&session, "-CANNOT_DELIVER\r\n").await;
    receive(&session, "-ERR address not found\r\n").await;
    receive(&session, "-GENERAL FAILURE\r\n").await;

    let kinds: Vec<Option<ResponseKind>> = calls
        .lock()
        .unwrap()
        .iter()
        .map(|(_, response)| response.as_ref().map(|r| r.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            Some(ResponseKind::CannotDeliver),
            Some(ResponseKind::Error),
            Some(ResponseKind::GeneralFailure),
        ]
    );
    assert_eq!(transport.commands().len(), 3);
    assert!(session.queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_line_leaves_request_waiting() {
    let (session, _transport, mut events) = initialized_session().await;
    drain(&mut events);
    let calls = Calls::default();

    session.enqueue(get("Level1", "level", 1), recorder(&calls, "a"));
    receive(&session, "#%!garbage\r\n").await;

    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(session.queue().in_flight().as_deref(), Some("Level1 get level 1"));
    assert!(matches!(
        drain(&mut events).as_slice(),
        [Event::ParseFailed { line, .. }] if line == "#%!garbage"
    ));

    receive(&session, "+OK \"value\":1\r\n").await;
    assert_eq!(labels(&calls), vec!["a:Level1 get level 1"]);
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_share_one_subscription() {
    let (session, transport, _events) = initialized_session().await;
    let key = SubscriptionKey::new("Level1", "level", [1]);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let first = session.subscribe(key.clone(), subscription(&key), move |response, _| {
        sink.lock().unwrap().push(format!("c1={}", response.value("value").unwrap_or_default()));
    });
    let sink = Arc::clone(&seen);
    let second = session.subscribe(key.clone(), subscription(&key), move |response, _| {
        sink.lock().unwrap().push(format!("c2={}", response.value("value").unwrap_or_default()));
    });

    let subscribe = format!("Level1 subscribe level 1 \"{}\"", key.token());
    assert_eq!(transport.commands(), vec![subscribe.clone()]);
    receive(&session, "+OK\r\n").await;

    receive(&session, &feedback(&key, "-6")).await;
    assert_eq!(*seen.lock().unwrap(), vec!["c1=-6", "c2=-6"]);

    assert!(session.unsubscribe(&first));
    assert_eq!(transport.commands(), vec![subscribe.clone()]);

    receive(&session, &feedback(&key, "-7")).await;
    assert_eq!(*seen.lock().unwrap(), vec!["c1=-6", "c2=-6", "c2=-7"]);

    assert!(session.unsubscribe(&second));
    assert!(!session.unsubscribe(&second));
    assert_eq!(
        transport.commands(),
        vec![
            subscribe,
            format!("Level1 unsubscribe level 1 \"{}\"", key.token()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_feedback_never_resolves_requests() {
    let (session, _transport, _events) = initialized_session().await;
    let key = SubscriptionKey::new("Mute1", "mute", [1]);
    let calls = Calls::default();

    session.enqueue(get("Mute1", "mute", 1), recorder(&calls, "a"));
    receive(&session, &feedback(&key, "true")).await;

    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(session.queue().in_flight().as_deref(), Some("Mute1 get mute 1"));
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_wait_for_initialization() {
    let (session, transport, mut events) = create_session(SessionConfig::default());
    let key = SubscriptionKey::new("Router1", "output", [2, 1]);
    session.subscribe(key.clone(), subscription(&key), |_, _| {});
    session.subscribe(key.clone(), subscription(&key), |_, _| {});

    session.on_connected();
    advance(Duration::from_secs(2)).await;
    assert!(transport.commands().is_empty());
    assert_eq!(session.state(), SessionState::Connected);

    advance(Duration::from_millis(1_001)).await;
    assert_eq!(
        transport.commands(),
        vec![format!("Router1 subscribe output 2 1 \"{}\"", key.token())]
    );
    assert_eq!(
        drain(&mut events),
        vec![
            Event::InitializedChanged { initialized: true },
            Event::SubscriptionsReasserted { count: 1 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_resubscribes_every_interval() {
    let (session, transport, _events) = create_session(SessionConfig::default());
    let key = SubscriptionKey::new("K", "level", [1]);
    let subscribe = format!("K subscribe level 1 \"{}\"", key.token());
    session.subscribe(key.clone(), subscription(&key), |_, _| {});

    session.on_connected();
    advance(Duration::from_millis(3_001)).await;
    receive(&session, "+OK\r\n").await;
    assert_eq!(transport.commands(), vec![subscribe.clone()]);

    advance(Duration::from_secs(595)).await;
    assert_eq!(transport.commands().len(), 1);

    advance(Duration::from_secs(2)).await;
    assert_eq!(transport.commands(), vec![subscribe.clone(), subscribe.clone()]);
    receive(&session, "-ERR already subscribed\r\n").await;

    advance(Duration::from_secs(600)).await;
    assert_eq!(transport.commands(), vec![subscribe.clone(), subscribe.clone(), subscribe]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_starts_clean() {
    let (session, transport, mut events) = initialized_session().await;
    drain(&mut events);
    let calls = Calls::default();

    session.enqueue(get("Level1", "level", 1), recorder(&calls, "old"));
    session.enqueue(get("Level2", "level", 1), recorder(&calls, "old"));
    receive(&session, "+OK \"value\":").await;

    session.on_disconnected();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.queue().is_empty());
    assert_eq!(
        drain(&mut events),
        vec![Event::InitializedChanged { initialized: false }]
    );

    // Nothing from the old link may fire, including its timeout.
    advance(Duration::from_secs(30)).await;
    assert!(drain(&mut events).is_empty());

    session.on_connected();
    transport.clear();
    session.enqueue(get("Level3", "level", 1), recorder(&calls, "new"));
    receive(&session, "-5\r\n").await;
    assert_eq!(session.queue().in_flight().as_deref(), Some("Level3 get level 1"));

    receive(&session, "+OK \"value\":-9\r\n").await;
    assert_eq!(labels(&calls), vec!["new:Level3 get level 1"]);
    assert_eq!(transport.commands(), vec!["Level3 get level 1"]);
}

#[tokio::test(start_paused = true)]
async fn test_initialized_changes_once_per_cycle() {
    let (session, _transport, mut events) = create_session(SessionConfig::default());

    for _ in 0..2 {
        session.on_connected();
        session.on_connected();
        advance(Duration::from_secs(4)).await;
        session.on_disconnected();
        session.on_disconnected();
    }

    let changes: Vec<Event> = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, Event::InitializedChanged { .. }))
        .collect();
    assert_eq!(
        changes,
        vec![
            Event::InitializedChanged { initialized: true },
            Event::InitializedChanged { initialized: false },
            Event::InitializedChanged { initialized: true },
            Event::InitializedChanged { initialized: false },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_banner_and_telnet_negotiation() {
    let (session, transport, mut events) = create_session(SessionConfig::default());
    session.on_connected();

    let mut data = vec![TELNET_IAC, 253, 24, TELNET_IAC, 251, 1];
    data.extend_from_slice(format!("{BANNER}\r\n").as_bytes());
    session.on_data(&data);
    settle().await;

    assert_eq!(drain(&mut events), vec![Event::SessionReady]);
    assert_eq!(
        transport.writes(),
        vec![
            String::from_utf8_lossy(&[TELNET_IAC, 252, 24]).into_owned(),
            String::from_utf8_lossy(&[TELNET_IAC, 254, 1]).into_owned(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_device_settings_drive_timeouts() {
    let config = DeviceSettings::from_json(r#"{ "response_timeout_secs": 5, "init_delay_secs": 1 }"#)
        .and_then(DeviceSettings::into_config)
        .expect("valid settings");
    let (session, _transport, mut events) = create_session(config);

    session.on_connected();
    advance(Duration::from_millis(1_001)).await;
    assert!(session.is_initialized());

    session.enqueue(get("Level1", "level", 1), None);
    advance(Duration::from_millis(5_001)).await;
    assert!(drain(&mut events).contains(&Event::RequestTimedOut {
        command: "Level1 get level 1".to_string()
    }));
}

#[tokio::test(start_paused = true)]
async fn test_operator_commands() {
    let (session, transport, _events) = initialized_session().await;
    let key = SubscriptionKey::new("Mute1", "mute", [1]);
    session.subscribe(key.clone(), subscription(&key), |_, _| {});
    receive(&session, "+OK\r\n").await;

    let command: DiagnosticCommand = "resubscribe".parse().unwrap();
    assert_eq!(session.run_diagnostic(command), "re-asserted 1 subscription(s)");
    assert_eq!(transport.commands().len(), 2);

    session.enqueue(get("Mute1", "mute", 1), None);
    let status = session.run_diagnostic("status".parse().unwrap());
    assert!(status.starts_with("state=initialized pending=2"), "{status}");

    let command: DiagnosticCommand = "clear".parse().unwrap();
    assert_eq!(session.run_diagnostic(command), "cleared 2 pending request(s)");
    assert!("reboot".parse::<DiagnosticCommand>().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_reports_disconnected() {
    let (session, transport, mut events) = initialized_session().await;
    drain(&mut events);
    let key = SubscriptionKey::new("Level1", "level", [1]);
    session.subscribe(key.clone(), subscription(&key), |_, _| {});
    receive(&session, "+OK \"value\":").await;

    session.shutdown();

    assert_eq!(
        session.run_diagnostic(DiagnosticCommand::Status),
        "state=disconnected pending=0 in_flight=- subscriptions=1"
    );
    assert_eq!(
        drain(&mut events),
        vec![Event::InitializedChanged { initialized: false }]
    );

    session.on_connected();
    advance(Duration::from_secs(4)).await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(transport.commands().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_requests_before_connect_never_block_the_link() {
    let (session, transport, _events) = create_session(SessionConfig::default());
    let calls = Calls::default();

    session.enqueue(get("Level1", "level", 1), recorder(&calls, "early"));
    session.on_connected();
    session.enqueue(get("Level2", "level", 1), recorder(&calls, "live"));
    assert_eq!(transport.commands(), vec!["Level2 get level 1"]);

    receive(&session, "+OK \"value\":-3\r\n").await;
    assert_eq!(labels(&calls), vec!["live:Level2 get level 1"]);
}
