use mailroom::core::config::Config;
use mailroom::core::error::MailError;
use mailroom::core::store::Store;
use mailroom::plugins::archive::{self, parse_message_document};
use mailroom::plugins::contacts::ContactPolicy;
use mailroom::plugins::delivery::{
    ReplyRequest, SendRequest, acknowledge, fetch_inbox, get_message, get_thread, mark_read,
    reply_message, search_messages, send_message,
};
use mailroom::plugins::index::{Importance, InboxQuery, RecipientKind, SearchQuery};
use mailroom::plugins::registry::{
    RegisterAgent, deactivate_agent, ensure_project, get_project, register_agent,
};
use std::fs;
use tempfile::TempDir;

const PROJECT: &str = "/work/widgets";
const AGENTS: [&str; 4] = ["BlueLake", "GreenCastle", "RedStone", "GoldHill"];

fn store_with(config: Config) -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open_with_config(tmp.path(), config).expect("open store");
    ensure_project(&store, PROJECT).expect("project");
    for name in AGENTS {
        register_agent(
            &store,
            PROJECT,
            &RegisterAgent {
                name: name.to_string(),
                program: "codex".to_string(),
                model: "gpt".to_string(),
                contact_policy: Some(ContactPolicy::Open),
                ..Default::default()
            },
        )
        .expect("register");
    }
    (tmp, store)
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.archive.lock_timeout_ms = 5_000;
    config.archive.retry_base_ms = 5;
    config
}

fn test_store() -> (TempDir, Store) {
    store_with(fast_config())
}

fn request(subject: &str, body: &str) -> SendRequest {
    SendRequest {
        project: PROJECT.to_string(),
        sender: "BlueLake".to_string(),
        to: vec!["GreenCastle".to_string(), "RedStone".to_string()],
        cc: vec!["GoldHill".to_string()],
        subject: subject.to_string(),
        body_md: body.to_string(),
        ..Default::default()
    }
}

#[test]
fn send_creates_one_unread_row_per_recipient() {
    let (_tmp, store) = test_store();
    let sent = send_message(&store, &request("Migration plan", "Step one: back up the db."))
        .expect("send");
    assert!(!sent.value.deduplicated);
    assert!(sent.durability.is_durable(), "{:?}", sent.durability);

    let message = &sent.value.message;
    assert_eq!(message.sender, "BlueLake");
    assert_eq!(message.thread_key, message.id.to_string());
    assert_eq!(message.names_of(RecipientKind::To), vec!["GreenCastle", "RedStone"]);
    assert_eq!(message.names_of(RecipientKind::Cc), vec!["GoldHill"]);

    for name in ["GreenCastle", "RedStone", "GoldHill"] {
        let inbox = fetch_inbox(&store, PROJECT, name, &InboxQuery::default()).expect("inbox");
        assert_eq!(inbox.len(), 1, "{name} inbox");
        assert_eq!(inbox[0].id, message.id);
        assert!(inbox[0].read_ts.is_none());
        assert!(inbox[0].body_md.is_none(), "bodies are opt-in");
    }
    assert!(
        fetch_inbox(&store, PROJECT, "BlueLake", &InboxQuery::default())
            .expect("sender inbox")
            .is_empty()
    );
}

#[test]
fn duplicate_recipients_collapse_to_strongest_kind() {
    let (_tmp, store) = test_store();
    let mut req = request("Dup", "body");
    req.cc.push("greencastle".to_string());
    req.bcc.push("RedStone".to_string());
    let message = send_message(&store, &req).expect("send").value.message;
    assert_eq!(message.recipients.len(), 3);
    assert!(message.names_of(RecipientKind::Bcc).is_empty());
}

#[test]
fn send_validates_before_writing() {
    let (_tmp, store) = test_store();

    let err = send_message(&store, &request("   ", "body")).unwrap_err();
    assert!(matches!(err, MailError::ValidationError(_)), "{err:?}");

    let mut nobody = request("Hi", "body");
    nobody.to.clear();
    nobody.cc.clear();
    let err = send_message(&store, &nobody).unwrap_err();
    assert!(matches!(err, MailError::ValidationError(_)), "{err:?}");

    let mut ghost = request("Hi", "body");
    ghost.to.push("NoSuchAgent".to_string());
    let err = send_message(&store, &ghost).unwrap_err();
    assert!(matches!(err, MailError::NotFound { kind: "agent", .. }), "{err:?}");

    deactivate_agent(&store, PROJECT, "RedStone").expect("deactivate");
    let err = send_message(&store, &request("Hi", "body")).unwrap_err();
    assert!(matches!(err, MailError::NotFound { .. }), "{err:?}");

    assert!(
        fetch_inbox(&store, PROJECT, "GreenCastle", &InboxQuery::default())
            .expect("inbox")
            .is_empty(),
        "rejected sends leave no rows"
    );
}

#[test]
fn identical_sends_inside_window_are_deduplicated() {
    let (_tmp, store) = test_store();
    let first = send_message(&store, &request("Status", "All green")).expect("first").value;
    let second = send_message(&store, &request("Status", "All green")).expect("second").value;
    assert!(second.deduplicated);
    assert_eq!(second.message.id, first.message.id);

    let mut keyed = request("Status", "All green");
    keyed.idempotency_key = Some("run-2".to_string());
    let third = send_message(&store, &keyed).expect("distinct key").value;
    assert!(!third.deduplicated);
    assert_ne!(third.message.id, first.message.id);

    let inbox = fetch_inbox(&store, PROJECT, "GreenCastle", &InboxQuery::default()).expect("inbox");
    assert_eq!(inbox.len(), 2);
}

#[test]
fn zero_window_disables_dedupe() {
    let mut config = fast_config();
    config.delivery.dedupe_window_secs = 0;
    let (_tmp, store) = store_with(config);
    send_message(&store, &request("Status", "same")).expect("first");
    let again = send_message(&store, &request("Status", "same")).expect("second").value;
    assert!(!again.deduplicated);
}

#[test]
fn reply_threads_and_prefixes_subject_once() {
    let (_tmp, store) = test_store();
    let original = send_message(&store, &request("Schema change", "Adding a column."))
        .expect("send")
        .value
        .message;

    let reply = |sender: &str, message_id: i64| {
        reply_message(
            &store,
            &ReplyRequest {
                project: PROJECT.to_string(),
                sender: sender.to_string(),
                message_id,
                body_md: format!("ack from {}", sender),
                ..Default::default()
            },
        )
        .expect("reply")
        .value
        .message
    };
    let first = reply("GreenCastle", original.id);
    assert_eq!(first.subject, "Re: Schema change");
    assert_eq!(first.thread_key, original.thread_key);
    assert_eq!(first.names_of(RecipientKind::To), vec!["BlueLake"]);

    let second = reply("BlueLake", first.id);
    assert_eq!(second.subject, "Re: Schema change");
    assert_eq!(second.thread_key, original.thread_key);
    assert_eq!(second.names_of(RecipientKind::To), vec!["GreenCastle"]);

    let thread = get_thread(&store, PROJECT, &original.thread_key).expect("thread");
    assert_eq!(
        thread.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![original.id, first.id, second.id]
    );
    let err = get_thread(&store, PROJECT, "no-such-thread").unwrap_err();
    assert!(matches!(err, MailError::NotFound { kind: "thread", .. }));
}

#[test]
fn read_and_ack_are_first_write_wins() {
    let (_tmp, store) = test_store();
    let mut req = request("Please confirm", "Deploy at noon?");
    req.ack_required = true;
    req.importance = Importance::Urgent;
    let message = send_message(&store, &req).expect("send").value.message;

    let read = mark_read(&store, PROJECT, "GreenCastle", message.id).expect("read").value;
    assert!(read.changed);
    let read_ts = read.read_ts.expect("read_ts set");
    let again = mark_read(&store, PROJECT, "GreenCastle", message.id).expect("read again").value;
    assert!(!again.changed);
    assert_eq!(again.read_ts, Some(read_ts));

    let acked = acknowledge(&store, PROJECT, "RedStone", message.id).expect("ack").value;
    assert!(acked.changed);
    assert!(acked.ack_ts.is_some());
    assert_eq!(acked.read_ts, acked.ack_ts, "ack implies read");

    let err = mark_read(&store, PROJECT, "BlueLake", message.id).unwrap_err();
    assert!(matches!(err, MailError::NotFound { kind: "recipient", .. }), "{err:?}");

    let unread = InboxQuery {
        unread_only: true,
        ..Default::default()
    };
    assert!(fetch_inbox(&store, PROJECT, "GreenCastle", &unread).expect("unread").is_empty());
    assert_eq!(fetch_inbox(&store, PROJECT, "GoldHill", &unread).expect("unread").len(), 1);

    let urgent = InboxQuery {
        urgent_only: true,
        include_bodies: true,
        ..Default::default()
    };
    let items = fetch_inbox(&store, PROJECT, "GoldHill", &urgent).expect("urgent");
    assert_eq!(items[0].body_md.as_deref(), Some("Deploy at noon?"));
    assert!(items[0].ack_required);

    let stored = get_message(&store, PROJECT, message.id).expect("get");
    let green = stored
        .recipients
        .iter()
        .find(|r| r.agent == "GreenCastle")
        .expect("recipient row");
    assert_eq!(green.read_ts, Some(read_ts));

    let slug = get_project(&store, PROJECT).expect("project").slug;
    let receipt = store.project_archive_dir(&slug).join(archive::receipt_path(
        message.created_ts,
        &message.subject,
        message.id,
        "RedStone",
    ));
    assert!(receipt.is_file(), "receipt missing at {}", receipt.display());
}

#[test]
fn archive_documents_hide_bcc_from_recipients() {
    let (_tmp, store) = test_store();
    let mut req = request("Quiet note", "Body text");
    req.bcc = vec!["GoldHill".to_string()];
    req.cc.clear();
    let message = send_message(&store, &req).expect("send").value.message;
    let slug = get_project(&store, PROJECT).expect("project").slug;
    let dir = store.project_archive_dir(&slug);
    let (ts, subject, id) = (message.created_ts, message.subject.as_str(), message.id);

    let canonical = fs::read_to_string(dir.join(archive::canonical_message_path(ts, subject, id)))
        .expect("canonical document");
    let (front, body) = parse_message_document(&canonical).expect("parse");
    assert_eq!(front.bcc, vec!["GoldHill"]);
    assert_eq!(body, "Body text");

    let outbox = dir.join(archive::outbox_message_path("BlueLake", ts, subject, id));
    assert!(outbox.is_file());

    for name in ["GreenCastle", "GoldHill"] {
        let inbox = fs::read_to_string(dir.join(archive::inbox_message_path(name, ts, subject, id)))
            .expect("inbox copy");
        let (front, _) = parse_message_document(&inbox).expect("parse");
        assert!(front.bcc.is_empty(), "{name} copy leaks bcc");
        assert_eq!(front.to, vec!["GreenCastle", "RedStone"]);
    }

    let log = archive::run_git(&store.archive_root(), &["log", "--format=%s", "-n", "1"]).expect("git log");
    assert!(log.contains("mail: BlueLake -> GreenCastle, RedStone: Quiet note"), "{log}");
    assert!(!log.contains("GoldHill"));
}

#[test]
fn mirror_failure_degrades_but_index_commit_stands() {
    let mut config = fast_config();
    config.archive.mirror_retries = 1;
    let (_tmp, store) = store_with(config);
    let slug = get_project(&store, PROJECT).expect("project").slug;
    // A plain file where the messages directory must go.
    fs::write(store.project_archive_dir(&slug).join("messages"), "blocker").expect("blocker");

    let sent = send_message(&store, &request("Degraded", "still delivered")).expect("send");
    assert!(sent.durability.is_degraded(), "{:?}", sent.durability);

    let inbox = fetch_inbox(&store, PROJECT, "GreenCastle", &InboxQuery::default()).expect("inbox");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].subject, "Degraded");

    // Locks were released: another project write goes through.
    let receipt = mark_read(&store, PROJECT, "GreenCastle", sent.value.message.id).expect("read");
    assert!(receipt.value.changed);
}

#[test]
fn retried_send_repairs_a_degraded_archive_copy() {
    let mut config = fast_config();
    config.archive.mirror_retries = 1;
    let (_tmp, store) = store_with(config);
    let slug = get_project(&store, PROJECT).expect("project").slug;
    let dir = store.project_archive_dir(&slug);
    let blocker = dir.join("messages");
    fs::write(&blocker, "blocker").expect("blocker");

    let first = send_message(&store, &request("Retry me", "same body")).expect("first");
    assert!(first.durability.is_degraded(), "{:?}", first.durability);
    fs::remove_file(&blocker).expect("unblock");

    let retried = send_message(&store, &request("Retry me", "same body")).expect("retry");
    assert!(retried.value.deduplicated);
    assert_eq!(retried.value.message.id, first.value.message.id);
    assert!(retried.durability.is_durable(), "{:?}", retried.durability);

    let message = &retried.value.message;
    let (ts, subject, id) = (message.created_ts, message.subject.as_str(), message.id);
    assert!(dir.join(archive::canonical_message_path(ts, subject, id)).is_file());
    assert!(dir.join(archive::outbox_message_path("BlueLake", ts, subject, id)).is_file());
    assert!(dir.join(archive::inbox_message_path("GreenCastle", ts, subject, id)).is_file());
}

#[test]
fn search_ranks_and_filters() {
    let (_tmp, store) = test_store();
    send_message(&store, &request("Deploy checklist", "Run the migration before deploy."))
        .expect("send 1");
    let mut other = request("Lunch", "Pizza at one?");
    other.sender = "GoldHill".to_string();
    other.cc = vec!["BlueLake".to_string()];
    send_message(&store, &other).expect("send 2");

    let hits = search_messages(
        &store,
        &SearchQuery {
            text: "deploy".to_string(),
            project: Some(PROJECT.to_string()),
            ..Default::default()
        },
    )
    .expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].subject, "Deploy checklist");
    assert!(hits[0].snippet.contains("[deploy]") || hits[0].snippet.contains("[Deploy]"));

    let by_agent = search_messages(
        &store,
        &SearchQuery {
            text: "pizza OR deploy".to_string(),
            agent: Some("GoldHill".to_string()),
            ..Default::default()
        },
    )
    .expect("search by agent");
    assert_eq!(by_agent.len(), 2, "GoldHill sent one and was cc'd on the other");

    let err = search_messages(
        &store,
        &SearchQuery {
            text: "  \"\" ".to_string(),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, MailError::ValidationError(_)), "{err:?}");
}
