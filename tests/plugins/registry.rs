use mailroom::core::config::Config;
use mailroom::core::error::MailError;
use mailroom::core::store::Store;
use mailroom::plugins::contacts::ContactPolicy;
use mailroom::plugins::registry::{
    RegisterAgent, deactivate_agent, ensure_project, get_agent, get_project, list_agents,
    project_slug, register_agent, set_contact_policy,
};
use tempfile::TempDir;

const PROJECT: &str = "/work/widgets";

fn test_store() -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tempdir");
    let mut config = Config::default();
    config.archive.lock_timeout_ms = 5_000;
    config.archive.retry_base_ms = 5;
    let store = Store::open_with_config(tmp.path(), config).expect("open store");
    (tmp, store)
}

fn agent(name: &str) -> RegisterAgent {
    RegisterAgent {
        name: name.to_string(),
        program: "codex".to_string(),
        model: "gpt".to_string(),
        task_description: format!("{} task", name),
        contact_policy: None,
    }
}

#[test]
fn ensure_project_is_idempotent_and_mirrored() {
    let (_tmp, store) = test_store();
    let first = ensure_project(&store, PROJECT).expect("create project");
    let second = ensure_project(&store, PROJECT).expect("ensure again");

    assert_eq!(first.value, second.value);
    assert_eq!(first.value.slug, project_slug(PROJECT));
    assert!(first.durability.is_durable(), "{:?}", first.durability);
    assert!(
        store
            .project_archive_dir(&first.value.slug)
            .join("project.json")
            .is_file()
    );

    let by_slug = get_project(&store, &first.value.slug).expect("lookup by slug");
    assert_eq!(by_slug.human_key, PROJECT);
}

#[test]
fn empty_project_key_is_rejected() {
    let (_tmp, store) = test_store();
    let err = ensure_project(&store, "   ").unwrap_err();
    assert!(matches!(err, MailError::ValidationError(_)));
}

#[test]
fn unknown_project_is_not_found() {
    let (_tmp, store) = test_store();
    let err = register_agent(&store, "/nowhere", &agent("BlueLake")).unwrap_err();
    assert!(matches!(err, MailError::NotFound { kind: "project", .. }), "{err:?}");
}

#[test]
fn register_writes_profile_and_rejects_bad_names() {
    let (_tmp, store) = test_store();
    let project = ensure_project(&store, PROJECT).expect("project").value;

    let registered = register_agent(&store, PROJECT, &agent("BlueLake")).expect("register");
    assert_eq!(registered.value.name, "BlueLake");
    assert_eq!(registered.value.contact_policy, ContactPolicy::Auto);
    assert!(registered.value.active);
    assert!(
        store
            .project_archive_dir(&project.slug)
            .join("agents/BlueLake/profile.json")
            .is_file()
    );

    for bad in ["", "-dash", "has space", "a/b"] {
        let err = register_agent(&store, PROJECT, &agent(bad)).unwrap_err();
        assert!(matches!(err, MailError::ValidationError(_)), "{bad:?} -> {err:?}");
    }
}

#[test]
fn reregistration_reactivates_and_keeps_policy() {
    let (_tmp, store) = test_store();
    ensure_project(&store, PROJECT).expect("project");
    let original = register_agent(&store, PROJECT, &agent("BlueLake")).expect("register").value;
    set_contact_policy(&store, PROJECT, "BlueLake", ContactPolicy::ContactsOnly).expect("policy");
    deactivate_agent(&store, PROJECT, "BlueLake").expect("deactivate");

    assert!(list_agents(&store, PROJECT, false).expect("list").is_empty());
    assert_eq!(list_agents(&store, PROJECT, true).expect("list all").len(), 1);

    let mut again = agent("bluelake");
    again.program = "claude".to_string();
    let back = register_agent(&store, PROJECT, &again).expect("re-register").value;
    assert_eq!(back.id, original.id);
    assert_eq!(back.name, "BlueLake", "stored casing wins");
    assert_eq!(back.program, "claude");
    assert!(back.active);
    assert_eq!(back.contact_policy, ContactPolicy::ContactsOnly);

    let fetched = get_agent(&store, PROJECT, "BLUELAKE").expect("case-insensitive lookup");
    assert_eq!(fetched.id, original.id);
}

#[test]
fn same_name_in_two_projects_are_distinct_agents() {
    let (_tmp, store) = test_store();
    ensure_project(&store, PROJECT).expect("project a");
    ensure_project(&store, "/work/gadgets").expect("project b");

    let a = register_agent(&store, PROJECT, &agent("GreenCastle")).expect("a").value;
    let b = register_agent(&store, "/work/gadgets", &agent("GreenCastle")).expect("b").value;
    assert_ne!(a.id, b.id);
    assert_ne!(a.project_id, b.project_id);
}
