use mailroom::core::config::Config;
use mailroom::core::error::MailError;
use mailroom::core::store::Store;
use mailroom::plugins::registry::{RegisterAgent, ensure_project, register_agent};
use mailroom::plugins::reservations::{
    ReservationFilter, ReservationState, ReserveRequest, get_reservation, list_reservations,
    release, release_all, renew, reserve, sweep_expired,
};
use tempfile::TempDir;

const PROJECT: &str = "/work/widgets";

fn test_store() -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tempdir");
    let mut config = Config::default();
    config.archive.lock_timeout_ms = 5_000;
    config.archive.retry_base_ms = 5;
    let store = Store::open_with_config(tmp.path(), config).expect("open store");
    ensure_project(&store, PROJECT).expect("project");
    for name in ["BlueLake", "GreenCastle"] {
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

#[test]
fn exclusive_overlap_conflicts_and_names_holder() {
    let (_tmp, store) = test_store();
    let held = reserve(
        &store,
        PROJECT,
        "BlueLake",
        &ReserveRequest::exclusive(["src/**"], 600).with_reason("refactor"),
    )
    .expect("first reservation")
    .value;
    assert!(held.is_active());
    assert_eq!(held.paths, vec!["src/**".to_string()]);

    let err = reserve(
        &store,
        PROJECT,
        "GreenCastle",
        &ReserveRequest::exclusive(["src/lib.rs", "docs/guide.md"], 600),
    )
    .unwrap_err();
    match err {
        MailError::ReservationConflict { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].holder, "BlueLake");
            assert_eq!(conflicts[0].requested, "src/lib.rs");
            assert_eq!(conflicts[0].held_pattern, "src/**");
            assert_eq!(conflicts[0].reservation_id, held.id);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let live = list_reservations(&store, PROJECT, &ReservationFilter::default()).expect("list");
    assert_eq!(live.len(), 1, "failed reservation must not be partially written");
}

#[test]
fn disjoint_paths_and_shared_leases_are_granted() {
    let (_tmp, store) = test_store();
    reserve(&store, PROJECT, "BlueLake", &ReserveRequest::exclusive(["src/a.rs"], 600))
        .expect("a");
    reserve(&store, PROJECT, "GreenCastle", &ReserveRequest::exclusive(["src/b.rs"], 600))
        .expect("disjoint path");
    let shared = reserve(&store, PROJECT, "GreenCastle", &ReserveRequest::shared(["src/a.rs"], 600))
        .expect("shared lease is advisory")
        .value;
    assert!(!shared.exclusive);

    // The holder's own leases never conflict with a new request.
    reserve(&store, PROJECT, "BlueLake", &ReserveRequest::exclusive(["src/**"], 600))
        .expect("own overlap");
}

#[test]
fn release_is_owner_only_and_idempotent() {
    let (_tmp, store) = test_store();
    let lease = reserve(&store, PROJECT, "BlueLake", &ReserveRequest::exclusive(["Cargo.toml"], 600))
        .expect("reserve")
        .value;

    let err = release(&store, PROJECT, "GreenCastle", lease.id).unwrap_err();
    assert!(matches!(err, MailError::NotOwner { ref holder, .. } if holder == "BlueLake"), "{err:?}");

    let first = release(&store, PROJECT, "BlueLake", lease.id).expect("release").value;
    assert!(first.changed);
    assert_eq!(first.reservation.state, ReservationState::Released);
    assert!(first.reservation.released_ts.is_some());

    let second = release(&store, PROJECT, "BlueLake", lease.id).expect("release again").value;
    assert!(!second.changed);

    reserve(&store, PROJECT, "GreenCastle", &ReserveRequest::exclusive(["Cargo.toml"], 600))
        .expect("released path is free");
}

#[test]
fn zero_ttl_lease_is_expired_on_arrival() {
    let (_tmp, store) = test_store();
    let lease = reserve(&store, PROJECT, "BlueLake", &ReserveRequest::exclusive(["src/main.rs"], 0))
        .expect("reserve")
        .value;
    assert_eq!(lease.state, ReservationState::Expired);

    reserve(&store, PROJECT, "GreenCastle", &ReserveRequest::exclusive(["src/main.rs"], 600))
        .expect("expired lease never conflicts");

    let err = renew(&store, PROJECT, "BlueLake", lease.id, Some(60)).unwrap_err();
    assert!(matches!(err, MailError::ValidationError(_)), "{err:?}");
}

#[test]
fn renew_extends_from_current_expiry() {
    let (_tmp, store) = test_store();
    let lease = reserve(&store, PROJECT, "BlueLake", &ReserveRequest::exclusive(["lib/"], 600))
        .expect("reserve")
        .value;
    let renewed = renew(&store, PROJECT, "BlueLake", lease.id, Some(300)).expect("renew").value;
    assert_eq!(renewed.expires_ts, lease.expires_ts + 300 * 1_000_000);

    let err = renew(&store, PROJECT, "GreenCastle", lease.id, Some(300)).unwrap_err();
    assert!(matches!(err, MailError::NotOwner { .. }));
}

#[test]
fn ttl_bounds_and_empty_paths_are_validated() {
    let (_tmp, store) = test_store();
    let max = store.config.reservations.max_ttl_secs;
    for req in [
        ReserveRequest::exclusive(["a"], -1),
        ReserveRequest::exclusive(["a"], max + 1),
        ReserveRequest::exclusive(Vec::<String>::new(), 60),
    ] {
        let err = reserve(&store, PROJECT, "BlueLake", &req).unwrap_err();
        assert!(matches!(err, MailError::ValidationError(_)), "{err:?}");
    }
}

#[test]
fn release_all_honours_path_filter() {
    let (_tmp, store) = test_store();
    let src = reserve(&store, PROJECT, "BlueLake", &ReserveRequest::exclusive(["src/**"], 600))
        .expect("src")
        .value;
    let docs = reserve(&store, PROJECT, "BlueLake", &ReserveRequest::exclusive(["docs/**"], 600))
        .expect("docs")
        .value;

    let released = release_all(&store, PROJECT, "BlueLake", &["docs/index.md".to_string()])
        .expect("filtered release")
        .value;
    assert_eq!(released.iter().map(|r| r.id).collect::<Vec<_>>(), vec![docs.id]);
    assert!(get_reservation(&store, PROJECT, src.id).expect("get").is_active());

    let rest = release_all(&store, PROJECT, "BlueLake", &[]).expect("release rest").value;
    assert_eq!(rest.len(), 1);
    assert!(
        list_reservations(&store, PROJECT, &ReservationFilter::default())
            .expect("list")
            .is_empty()
    );
    let all = list_reservations(
        &store,
        PROJECT,
        &ReservationFilter {
            agent: Some("BlueLake".to_string()),
            include_inactive: true,
        },
    )
    .expect("list inactive");
    assert_eq!(all.len(), 2);
}

#[test]
fn sweep_marks_lapsed_leases_and_mirrors_them() {
    let (_tmp, store) = test_store();
    let lease = reserve(&store, PROJECT, "BlueLake", &ReserveRequest::exclusive(["tmp/**"], 0))
        .expect("reserve")
        .value;
    assert_eq!(sweep_expired(&store).expect("sweep"), 1);
    assert_eq!(sweep_expired(&store).expect("second sweep"), 0);

    let stored = get_reservation(&store, PROJECT, lease.id).expect("get");
    assert_eq!(stored.state, ReservationState::Expired);

    let project = mailroom::plugins::registry::get_project(&store, PROJECT).expect("project");
    let doc = store
        .project_archive_dir(&project.slug)
        .join(format!("file_reservations/id-{}.json", lease.id));
    assert!(doc.is_file(), "reservation document missing at {}", doc.display());
}
