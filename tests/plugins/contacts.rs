use mailroom::core::config::Config;
use mailroom::core::error::MailError;
use mailroom::core::store::Store;
use mailroom::plugins::contacts::{
    Admission, AllowReason, ContactPolicy, LinkStatus, RejectReason, check_admission,
    list_contacts, request_contact, respond_contact,
};
use mailroom::plugins::delivery::{ReplyRequest, SendRequest, reply_message, send_message};
use mailroom::plugins::registry::{RegisterAgent, ensure_project, register_agent, set_contact_policy};
use mailroom::plugins::reservations::{ReserveRequest, reserve};
use tempfile::TempDir;

const PROJECT: &str = "/work/widgets";

fn fast_config() -> Config {
    let mut config = Config::default();
    config.archive.lock_timeout_ms = 5_000;
    config.archive.retry_base_ms = 5;
    config
}

fn test_store() -> (TempDir, Store) {
    store_with(fast_config())
}

fn store_with(config: Config) -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open_with_config(tmp.path(), config).expect("open store");
    ensure_project(&store, PROJECT).expect("project");
    for name in ["BlueLake", "GreenCastle", "RedStone"] {
        register_agent(
            &store,
            PROJECT,
            &RegisterAgent {
                name: name.to_string(),
                program: "codex".to_string(),
                model: "gpt".to_string(),
                ..Default::default()
            },
        )
        .expect("register");
    }
    (tmp, store)
}

fn note(from: &str, to: &str, subject: &str) -> SendRequest {
    SendRequest {
        project: PROJECT.to_string(),
        sender: from.to_string(),
        to: vec![to.to_string()],
        subject: subject.to_string(),
        body_md: format!("{} says hello", from),
        ..Default::default()
    }
}

#[test]
fn auto_policy_rejects_strangers() {
    let (_tmp, store) = test_store();
    assert_eq!(
        check_admission(&store, PROJECT, "BlueLake", "GreenCastle").expect("check"),
        Admission::Reject(RejectReason::ContactRequired)
    );
    let err = send_message(&store, &note("BlueLake", "GreenCastle", "hi")).unwrap_err();
    assert!(
        matches!(err, MailError::ContactRequired { ref recipient, .. } if recipient == "GreenCastle"),
        "{err:?}"
    );
    assert_eq!(
        check_admission(&store, PROJECT, "BlueLake", "BlueLake").expect("self"),
        Admission::Allow(AllowReason::SelfMessage)
    );
}

#[test]
fn open_recipient_then_recent_contact_admits_reply() {
    let (_tmp, store) = test_store();
    set_contact_policy(&store, PROJECT, "GreenCastle", ContactPolicy::Open).expect("open");
    let sent = send_message(&store, &note("BlueLake", "GreenCastle", "build broken"))
        .expect("open recipient accepts")
        .value;

    assert_eq!(
        check_admission(&store, PROJECT, "GreenCastle", "BlueLake").expect("check"),
        Admission::Allow(AllowReason::RecentContact)
    );
    reply_message(
        &store,
        &ReplyRequest {
            project: PROJECT.to_string(),
            sender: "GreenCastle".to_string(),
            message_id: sent.message.id,
            body_md: "on it".to_string(),
            ..Default::default()
        },
    )
    .expect("reply within the thread");

    // RedStone never took part.
    let err = send_message(&store, &note("RedStone", "BlueLake", "ping")).unwrap_err();
    assert!(matches!(err, MailError::ContactRequired { .. }), "{err:?}");
}

#[test]
fn co_recipients_of_one_message_may_write_each_other() {
    let (_tmp, store) = test_store();
    for name in ["BlueLake", "GreenCastle"] {
        set_contact_policy(&store, PROJECT, name, ContactPolicy::Open).expect("open");
    }
    let mut kickoff = note("RedStone", "BlueLake", "kickoff");
    kickoff.cc = vec!["GreenCastle".to_string()];
    send_message(&store, &kickoff).expect("kickoff");
    for name in ["BlueLake", "GreenCastle"] {
        set_contact_policy(&store, PROJECT, name, ContactPolicy::Auto).expect("auto");
    }

    assert_eq!(
        check_admission(&store, PROJECT, "BlueLake", "GreenCastle").expect("check"),
        Admission::Allow(AllowReason::SharedThread)
    );
    send_message(&store, &note("BlueLake", "GreenCastle", "follow-up"))
        .expect("shared thread admits co-recipients");
}

#[test]
fn message_history_older_than_recent_ttl_no_longer_admits() {
    let mut config = fast_config();
    config.contact.recent_ttl_secs = 0;
    let (_tmp, store) = store_with(config);
    for name in ["GreenCastle", "RedStone"] {
        set_contact_policy(&store, PROJECT, name, ContactPolicy::Open).expect("open");
    }
    let mut kickoff = note("BlueLake", "GreenCastle", "old news");
    kickoff.cc = vec!["RedStone".to_string()];
    send_message(&store, &kickoff).expect("send while open");
    for name in ["GreenCastle", "RedStone"] {
        set_contact_policy(&store, PROJECT, name, ContactPolicy::Auto).expect("auto");
    }
    std::thread::sleep(std::time::Duration::from_millis(20));

    // Neither the direct exchange nor the shared thread is recent any more.
    assert_eq!(
        check_admission(&store, PROJECT, "GreenCastle", "BlueLake").expect("reply"),
        Admission::Reject(RejectReason::ContactRequired)
    );
    assert_eq!(
        check_admission(&store, PROJECT, "RedStone", "GreenCastle").expect("co-recipient"),
        Admission::Reject(RejectReason::ContactRequired)
    );
}

#[test]
fn message_history_inside_recent_ttl_still_admits() {
    let mut config = fast_config();
    config.contact.recent_ttl_secs = 3_600;
    let (_tmp, store) = store_with(config);
    set_contact_policy(&store, PROJECT, "GreenCastle", ContactPolicy::Open).expect("open");
    send_message(&store, &note("BlueLake", "GreenCastle", "fresh")).expect("send while open");
    set_contact_policy(&store, PROJECT, "GreenCastle", ContactPolicy::Auto).expect("auto");

    assert_eq!(
        check_admission(&store, PROJECT, "GreenCastle", "BlueLake").expect("check"),
        Admission::Allow(AllowReason::RecentContact)
    );
}

#[test]
fn overlapping_reservations_admit_under_auto() {
    let (_tmp, store) = test_store();
    reserve(&store, PROJECT, "BlueLake", &ReserveRequest::shared(["src/**"], 600)).expect("blue");
    reserve(&store, PROJECT, "GreenCastle", &ReserveRequest::shared(["src/lib.rs"], 600))
        .expect("green");
    reserve(&store, PROJECT, "RedStone", &ReserveRequest::shared(["docs/**"], 600)).expect("red");

    assert_eq!(
        check_admission(&store, PROJECT, "BlueLake", "GreenCastle").expect("check"),
        Admission::Allow(AllowReason::OverlappingReservations)
    );
    assert!(
        !check_admission(&store, PROJECT, "RedStone", "GreenCastle")
            .expect("check")
            .is_allowed()
    );
}

#[test]
fn block_all_refuses_messages_and_requests() {
    let (_tmp, store) = test_store();
    set_contact_policy(&store, PROJECT, "GreenCastle", ContactPolicy::BlockAll).expect("block");

    let err = send_message(&store, &note("BlueLake", "GreenCastle", "hi")).unwrap_err();
    assert!(matches!(err, MailError::ContactBlocked { .. }), "{err:?}");
    let err = request_contact(&store, PROJECT, "BlueLake", "GreenCastle", "please").unwrap_err();
    assert!(matches!(err, MailError::ContactBlocked { .. }), "{err:?}");
}

#[test]
fn contacts_only_requires_approved_handshake() {
    let (_tmp, store) = test_store();
    set_contact_policy(&store, PROJECT, "GreenCastle", ContactPolicy::ContactsOnly).expect("policy");

    let pending = request_contact(&store, PROJECT, "BlueLake", "GreenCastle", "need a review")
        .expect("request")
        .value;
    assert_eq!(pending.status, LinkStatus::Pending);
    assert_eq!(pending.from, "BlueLake");
    let err = send_message(&store, &note("BlueLake", "GreenCastle", "hi")).unwrap_err();
    assert!(matches!(err, MailError::ContactRequired { .. }), "{err:?}");

    let approved = respond_contact(&store, PROJECT, "GreenCastle", "BlueLake", true, None)
        .expect("approve")
        .value;
    assert_eq!(approved.status, LinkStatus::Approved);
    assert_eq!(approved.expires_ts, None);
    send_message(&store, &note("BlueLake", "GreenCastle", "hi")).expect("approved link admits");

    // Re-requesting keeps an approved link approved.
    let again = request_contact(&store, PROJECT, "BlueLake", "GreenCastle", "again")
        .expect("re-request")
        .value;
    assert_eq!(again.status, LinkStatus::Approved);

    let links = list_contacts(&store, PROJECT, "GreenCastle").expect("list");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].reason, "again");
}

#[test]
fn rejected_or_lapsed_links_do_not_admit() {
    let (_tmp, store) = test_store();
    set_contact_policy(&store, PROJECT, "GreenCastle", ContactPolicy::ContactsOnly).expect("policy");

    request_contact(&store, PROJECT, "BlueLake", "GreenCastle", "").expect("request");
    let rejected = respond_contact(&store, PROJECT, "GreenCastle", "BlueLake", false, None)
        .expect("reject")
        .value;
    assert_eq!(rejected.status, LinkStatus::Rejected);
    assert!(!check_admission(&store, PROJECT, "BlueLake", "GreenCastle").expect("check").is_allowed());

    request_contact(&store, PROJECT, "BlueLake", "GreenCastle", "retry").expect("request again");
    let lapsed = respond_contact(&store, PROJECT, "GreenCastle", "BlueLake", true, Some(0))
        .expect("approve with zero ttl")
        .value;
    assert!(lapsed.expires_ts.is_some());
    assert!(!check_admission(&store, PROJECT, "BlueLake", "GreenCastle").expect("check").is_allowed());
}

#[test]
fn handshake_input_errors() {
    let (_tmp, store) = test_store();
    let err = respond_contact(&store, PROJECT, "GreenCastle", "BlueLake", true, None).unwrap_err();
    assert!(matches!(err, MailError::NotFound { kind: "contact_request", .. }), "{err:?}");

    let err = request_contact(&store, PROJECT, "BlueLake", "BlueLake", "").unwrap_err();
    assert!(matches!(err, MailError::ValidationError(_)), "{err:?}");

    request_contact(&store, PROJECT, "BlueLake", "GreenCastle", "").expect("request");
    let err = respond_contact(&store, PROJECT, "GreenCastle", "BlueLake", true, Some(-5)).unwrap_err();
    assert!(matches!(err, MailError::ValidationError(_)), "{err:?}");
}
