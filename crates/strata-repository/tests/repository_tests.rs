//! Integration tests for the repository core.
//!
//! Exercises the full stack (repository, collections, transactions,
//! events) against the memory backend, over a small class hierarchy in
//! which `Person` and `Company` both include `Account`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use strata_repository::{
    record, ClassDescriptor, DeleteOptions, FindOptions, GetOptions, MemoryBackend, PutOptions,
    Repository, RepositoryError, RepositoryEvent, RepositoryRecord, REPOSITORY_VERSION,
};

fn classes() -> Vec<ClassDescriptor> {
    vec![
        ClassDescriptor::new("Account", "id").indexed_on(["accountNumber", "country"]),
        ClassDescriptor::new("Person", "id").including(["Account"]).indexed_on(["lastName"]),
        ClassDescriptor::new("Company", "id").including(["Account"]).indexed_on(["name"]),
    ]
}

fn open_repository() -> Repository<MemoryBackend> {
    Repository::open("crm", "memory:", classes()).expect("repository must open")
}

fn id_of(item: &strata_repository::Item) -> &str {
    item.get("id").and_then(Value::as_str).expect("fixture items carry string ids")
}

/// Six accounts: one plain account, three people, two companies.
async fn seed(repository: &Repository<MemoryBackend>) {
    let accounts = repository.create_collection("Account").unwrap();
    let people = repository.create_collection("Person").unwrap();
    let companies = repository.create_collection("Company").unwrap();

    let fixtures: Vec<(&strata_repository::Collection<MemoryBackend>, Value)> = vec![
        (&accounts, json!({"id": "aaa", "accountNumber": 45829, "country": "France"})),
        (
            &people,
            json!({"id": "bbb", "accountNumber": 3246, "country": "USA", "lastName": "Daniel"}),
        ),
        (
            &companies,
            json!({"id": "ccc", "accountNumber": 7775, "country": "Spain", "name": "Beta Works"}),
        ),
        (
            &people,
            json!({"id": "ddd", "accountNumber": 55498, "country": "USA", "lastName": "Boyer"}),
        ),
        (
            &people,
            json!({"id": "eee", "accountNumber": 888, "country": "France", "lastName": "Rey"}),
        ),
        (
            &companies,
            json!({"id": "fff", "accountNumber": 7002, "country": "France", "name": "Fleur SA"}),
        ),
    ];

    for (collection, value) in fixtures {
        let mut item = collection.create_item(value).unwrap();
        collection.put_item(&mut item, &PutOptions::default()).await.unwrap();
        assert!(!item.is_new());
    }
}

// ============================================================================
// CRUD round trips
// ============================================================================

#[tokio::test]
async fn test_put_get_delete_round_trip() {
    let repository = open_repository();
    let people = repository.create_collection("Person").unwrap();

    let mut manu =
        people.create_item(json!({"id": "m", "firstName": "Manu", "age": 42})).unwrap();
    people.put_item(&mut manu, &PutOptions::default()).await.unwrap();

    let found = people.get_item("m", &GetOptions::default()).await.unwrap().unwrap();
    assert_eq!(found.get("firstName"), Some(&json!("Manu")));
    assert_eq!(found.get("age"), Some(&json!(42)));
    assert_eq!(found.class_name(), "Person");

    let deleted = people.delete_item("m", &DeleteOptions::default()).await.unwrap();
    assert!(deleted);

    let absent = people.get_item("m", &GetOptions::tolerant()).await.unwrap();
    assert!(absent.is_none());
}

#[tokio::test]
async fn test_put_new_item_conflicts_on_existing_key() {
    let repository = open_repository();
    seed(&repository).await;

    let people = repository.create_collection("Person").unwrap();
    let mut duplicate = people.create_item(json!({"id": "bbb"})).unwrap();
    assert!(duplicate.is_new());

    let err = people.put_item(&mut duplicate, &PutOptions::default()).await.unwrap_err();
    assert!(matches!(err, RepositoryError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_delete_missing_item_policies() {
    let repository = open_repository();
    let people = repository.create_collection("Person").unwrap();

    let err = people.delete_item("zzz", &DeleteOptions::default()).await.unwrap_err();
    assert!(matches!(err, RepositoryError::NotFound(_)));

    let deleted = people.delete_item("zzz", &DeleteOptions::tolerant()).await.unwrap();
    assert!(!deleted);
}

// ============================================================================
// Polymorphism
// ============================================================================

#[tokio::test]
async fn test_get_through_base_collection_returns_derived_item() {
    let repository = open_repository();
    seed(&repository).await;

    let accounts = repository.create_collection("Account").unwrap();
    let item = accounts.get_item("bbb", &GetOptions::default()).await.unwrap().unwrap();
    assert_eq!(item.class_name(), "Person");
    assert_eq!(item.get("lastName"), Some(&json!("Daniel")));
}

#[tokio::test]
async fn test_get_item_rebinds_probe_to_derived_class() {
    let repository = open_repository();
    seed(&repository).await;

    // A probe created through the base collection picks up the stored
    // item's true type on refresh.
    let accounts = repository.create_collection("Account").unwrap();
    let mut probe = accounts.create_item(json!({"id": "ccc"})).unwrap();
    let found = repository.get_item(&mut probe, &GetOptions::default()).await.unwrap();
    assert!(found);
    assert_eq!(probe.class_name(), "Company");
    assert_eq!(probe.get("name"), Some(&json!("Beta Works")));
    assert!(!probe.is_new());

    // A probe of the matching class is refreshed in place.
    let mut probe = accounts.create_item(json!({"id": "aaa"})).unwrap();
    assert!(repository.get_item(&mut probe, &GetOptions::default()).await.unwrap());
    assert_eq!(probe.class_name(), "Account");
    assert_eq!(probe.get("accountNumber"), Some(&json!(45829)));

    // An absent key reads back as a miss under the tolerant policy.
    let mut probe = accounts.create_item(json!({"id": "zzz"})).unwrap();
    assert!(!repository.get_item(&mut probe, &GetOptions::tolerant()).await.unwrap());
}

#[tokio::test]
async fn test_bulk_get_materialises_at_derived_classes() {
    let repository = open_repository();
    seed(&repository).await;

    let accounts = repository.create_collection("Account").unwrap();
    let items = accounts.get_items(&["aaa", "ccc"], &GetOptions::default()).await.unwrap();

    let names: Vec<_> = items.iter().map(|item| item.class_name().to_string()).collect();
    assert_eq!(names, ["Account", "Company"]);
    assert_eq!(id_of(&items[0]), "aaa");
    assert_eq!(id_of(&items[1]), "ccc");

    // The item-keyed entry point plucks the keys from probe items.
    let probes = vec![
        accounts.create_item(json!({"id": "aaa"})).unwrap(),
        accounts.create_item(json!({"id": "ccc"})).unwrap(),
    ];
    let items = repository.get_items(&probes, &GetOptions::default()).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].class_name(), "Company");

    let none = repository.get_items(&[], &GetOptions::default()).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_cross_class_query_sees_derived_items() {
    let repository = open_repository();
    seed(&repository).await;

    let accounts = repository.create_collection("Account").unwrap();
    let items = accounts.find_items(&FindOptions::default()).await.unwrap();
    let ids: Vec<_> = items.iter().map(id_of).collect();
    assert_eq!(ids, ["aaa", "bbb", "ccc", "ddd", "eee", "fff"]);

    // Each comes back at its most-derived class.
    let classes: Vec<_> = items.iter().map(|item| item.class_name()).collect();
    assert_eq!(classes, ["Account", "Person", "Company", "Person", "Person", "Company"]);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_find_items_ordered_by_field() {
    let repository = open_repository();
    seed(&repository).await;

    let people = repository.create_collection("Person").unwrap();
    let items = people.find_items(&FindOptions::ordered_by("accountNumber")).await.unwrap();
    let numbers: Vec<_> = items.iter().map(|item| item.get("accountNumber").cloned()).collect();
    assert_eq!(numbers, [Some(json!(888)), Some(json!(3246)), Some(json!(55498))]);
}

#[tokio::test]
async fn test_find_items_with_equality_query() {
    let repository = open_repository();
    seed(&repository).await;

    let accounts = repository.create_collection("Account").unwrap();
    let usa = accounts.find_items(&FindOptions::matching("country", json!("USA"))).await.unwrap();
    let ids: Vec<_> = usa.iter().map(id_of).collect();
    assert_eq!(ids, ["bbb", "ddd"]);

    let companies = repository.create_collection("Company").unwrap();
    let uk = companies.find_items(&FindOptions::matching("country", json!("UK"))).await.unwrap();
    assert!(uk.is_empty());
}

#[tokio::test]
async fn test_count_items() {
    let repository = open_repository();
    seed(&repository).await;

    let people = repository.create_collection("Person").unwrap();
    assert_eq!(people.count_items(&FindOptions::default()).await.unwrap(), 3);

    let accounts = repository.create_collection("Account").unwrap();
    let france = FindOptions::matching("country", json!("France"));
    assert_eq!(accounts.count_items(&france).await.unwrap(), 3);
}

// ============================================================================
// Iteration and bulk delete
// ============================================================================

#[tokio::test]
async fn test_for_each_items_visits_in_key_order() {
    let repository = open_repository();
    seed(&repository).await;

    let accounts = repository.create_collection("Account").unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    let options = FindOptions::default().with_batch_size(2);
    accounts
        .for_each_items(&options, |item| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(id_of(&item).to_string());
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), ["aaa", "bbb", "ccc", "ddd", "eee", "fff"]);
}

#[tokio::test]
async fn test_for_each_items_with_order_streams_sorted() {
    let repository = open_repository();
    seed(&repository).await;

    let accounts = repository.create_collection("Account").unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    accounts
        .for_each_items(&FindOptions::ordered_by("accountNumber"), |item| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(id_of(&item).to_string());
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), ["eee", "bbb", "fff", "ccc", "aaa", "ddd"]);
}

#[tokio::test]
async fn test_for_each_items_pages_numeric_keys() {
    let repository =
        Repository::open("metrics", "memory:", vec![ClassDescriptor::new("Metric", "seq")])
            .unwrap();
    let metrics = repository.create_collection("Metric").unwrap();
    for seq in 1..=5 {
        let mut item = metrics.create_item(json!({ "seq": seq })).unwrap();
        metrics.put_item(&mut item, &PutOptions::default()).await.unwrap();
    }

    // The cursor advances through the stringified keys; each item is
    // visited exactly once even though the keys are numbers.
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let options = FindOptions::default().with_batch_size(2);
    metrics
        .for_each_items(&options, |item| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(item.get("seq").cloned().unwrap());
                Ok(())
            }
        })
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), [json!(1), json!(2), json!(3), json!(4), json!(5)]);

    let deleted = metrics
        .find_and_delete_items(&FindOptions::default().with_batch_size(2))
        .await
        .unwrap();
    assert_eq!(deleted, 5);
    assert_eq!(metrics.count_items(&FindOptions::default()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_for_each_items_reversed_streams_descending() {
    let repository = open_repository();
    seed(&repository).await;

    let accounts = repository.create_collection("Account").unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    // A reversed scan cannot ride the ascending cursor; it streams the
    // fetched result set, each key exactly once.
    let mut options = FindOptions::default().with_batch_size(2);
    options.reverse = true;
    accounts
        .for_each_items(&options, |item| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(id_of(&item).to_string());
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), ["fff", "eee", "ddd", "ccc", "bbb", "aaa"]);
}

#[tokio::test]
async fn test_for_each_handler_error_propagates_unchanged() {
    let repository = open_repository();
    seed(&repository).await;

    let accounts = repository.create_collection("Account").unwrap();
    let err = accounts
        .for_each_items(&FindOptions::default(), |_item| async {
            Err(RepositoryError::user(std::io::Error::other("handler failed")))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RepositoryError::User(_)));
}

#[tokio::test]
async fn test_find_and_delete_items_with_batched_scan() {
    let repository = open_repository();
    seed(&repository).await;

    let accounts = repository.create_collection("Account").unwrap();
    let france = FindOptions::matching("country", json!("France")).with_batch_size(2);

    let deleted = accounts.find_and_delete_items(&france).await.unwrap();
    assert_eq!(deleted, 3);

    let remaining = accounts.find_items(&FindOptions::default()).await.unwrap();
    let ids: Vec<_> = remaining.iter().map(id_of).collect();
    assert_eq!(ids, ["bbb", "ccc", "ddd"]);

    // A re-run finds nothing left to delete.
    let deleted = accounts.find_and_delete_items(&france).await.unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn test_bulk_materialisation_yields_to_other_tasks() {
    let repository = open_repository();
    let accounts = repository.create_collection("Account").unwrap();

    let mut keys = Vec::new();
    for i in 0..600 {
        let key = format!("k{i:04}");
        let mut item = accounts.create_item(json!({ "id": key })).unwrap();
        accounts.put_item(&mut item, &PutOptions::default()).await.unwrap();
        keys.push(key);
    }
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();

    // On the current-thread runtime this task only runs if the bulk get
    // yields somewhere in its materialisation loop.
    let observed = Arc::new(AtomicBool::new(false));
    let flag = observed.clone();
    tokio::spawn(async move {
        flag.store(true, Ordering::SeqCst);
    });

    let items = accounts.get_items(&key_refs, &GetOptions::default()).await.unwrap();
    assert_eq!(items.len(), 600);
    assert!(observed.load(Ordering::SeqCst), "bulk get must respire");
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_transaction_commits_on_success() {
    let repository = open_repository();

    repository
        .transaction(|view| async move {
            assert!(view.is_inside_transaction());
            let people = view.create_collection("Person")?;
            let mut item = people.create_item(json!({"id": "t1", "country": "USA"}))?;
            people.put_item(&mut item, &PutOptions::default()).await?;
            Ok(())
        })
        .await
        .unwrap();

    let people = repository.create_collection("Person").unwrap();
    assert!(people.get_item("t1", &GetOptions::tolerant()).await.unwrap().is_some());
    assert!(!repository.is_inside_transaction());
}

#[tokio::test]
async fn test_failed_transaction_rolls_back_saves() {
    let repository = open_repository();
    seed(&repository).await;

    let result = repository
        .transaction(|view| async move {
            let people = view.create_collection("Person")?;
            let mut person =
                people.get_item("bbb", &GetOptions::default()).await?.expect("seeded");
            person.set("lastName", json!("D."));
            people.put_item(&mut person, &PutOptions::default()).await?;
            Err::<(), _>(RepositoryError::user(std::io::Error::other("changed my mind")))
        })
        .await;
    assert!(matches!(result, Err(RepositoryError::User(_))));

    let people = repository.create_collection("Person").unwrap();
    let person = people.get_item("bbb", &GetOptions::default()).await.unwrap().unwrap();
    assert_eq!(person.get("lastName"), Some(&json!("Daniel")));
}

#[tokio::test]
async fn test_nested_transactions_are_flat() {
    let repository = open_repository();

    let result = repository
        .transaction(|view| async move {
            let people = view.create_collection("Person")?;
            let mut outer = people.create_item(json!({"id": "n1"}))?;
            people.put_item(&mut outer, &PutOptions::default()).await?;

            // The nested call reuses the outermost transaction.
            view.transaction(|inner| async move {
                assert!(inner.is_inside_transaction());
                let people = inner.create_collection("Person")?;
                let mut item = people.create_item(json!({"id": "n2"}))?;
                people.put_item(&mut item, &PutOptions::default()).await?;
                Ok(())
            })
            .await?;

            Err::<(), _>(RepositoryError::user(std::io::Error::other("abort everything")))
        })
        .await;
    assert!(result.is_err());

    // The abort covers the nested write as well.
    let people = repository.create_collection("Person").unwrap();
    assert!(people.get_item("n1", &GetOptions::tolerant()).await.unwrap().is_none());
    assert!(people.get_item("n2", &GetOptions::tolerant()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_user_error_keeps_its_source_through_transaction() {
    let repository = open_repository();

    let err = repository
        .transaction(|_view| async move {
            Err::<(), _>(RepositoryError::user(std::io::Error::other("domain rule broken")))
        })
        .await
        .unwrap_err();

    match err {
        RepositoryError::User(source) => {
            assert_eq!(source.to_string(), "domain rule broken");
        },
        other => panic!("expected a user error, got: {other}"),
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_initialize_is_idempotent_and_emits_once() {
    let repository = open_repository();
    let mut events = repository.subscribe();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let repository = repository.clone();
            tokio::spawn(async move { repository.initialize().await })
        })
        .collect();
    for task in futures::future::join_all(tasks).await {
        task.unwrap().unwrap();
    }
    repository.initialize().await.unwrap();
    assert!(repository.has_been_initialized());
    assert!(!repository.is_initializing());

    let mut initialized = 0;
    let mut created = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RepositoryEvent::DidInitialize => initialized += 1,
            RepositoryEvent::DidCreate => created += 1,
            _ => {},
        }
    }
    assert_eq!(initialized, 1);
    assert_eq!(created, 1);
}

#[tokio::test]
async fn test_repository_id_is_stable_across_reopen() {
    let store = MemoryBackend::new();
    let first = Repository::builder()
        .name("crm")
        .url("memory:")
        .store(store.clone())
        .classes(classes())
        .build()
        .unwrap();

    let id = first.repository_id().await.unwrap();
    assert_eq!(id.len(), 16);
    assert_eq!(first.repository_id().await.unwrap(), id);

    // A new handle over the same store finds the same record.
    let second = Repository::builder()
        .name("crm")
        .url("memory:")
        .store(store)
        .classes(classes())
        .build()
        .unwrap();
    assert_eq!(second.repository_id().await.unwrap(), id);
}

#[tokio::test]
async fn test_downgrade_is_fatal() {
    let store = MemoryBackend::new();
    let newer = RepositoryRecord {
        name: "crm".to_string(),
        version: REPOSITORY_VERSION + 1,
        id: "ffffffffffffffff".to_string(),
    };
    record::save(&store, &newer, true).await.unwrap();

    let repository = Repository::builder()
        .name("crm")
        .url("memory:")
        .store(store)
        .classes(classes())
        .build()
        .unwrap();

    let err = repository.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::CannotDowngrade { found, supported }
            if found == REPOSITORY_VERSION + 1 && supported == REPOSITORY_VERSION
    ));
    assert!(!repository.has_been_initialized());
}

#[tokio::test]
async fn test_destroy_requires_initialization_and_resets_identity() {
    let repository = open_repository();

    let err = repository.destroy().await.unwrap_err();
    assert!(matches!(err, RepositoryError::NotInitialized));

    let mut events = repository.subscribe();
    let first_id = repository.repository_id().await.unwrap();

    repository.destroy().await.unwrap();
    assert!(!repository.has_been_initialized());

    let mut saw_will_destroy = false;
    let mut saw_did_destroy = false;
    while let Ok(event) = events.try_recv() {
        match event {
            RepositoryEvent::WillDestroy => saw_will_destroy = true,
            RepositoryEvent::DidDestroy => saw_did_destroy = true,
            _ => {},
        }
    }
    assert!(saw_will_destroy && saw_did_destroy);

    // The next operation recreates the repository with a fresh identity.
    let second_id = repository.repository_id().await.unwrap();
    assert_ne!(second_id, first_id);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_put_and_delete_emit_item_events() {
    let repository = open_repository();
    repository.initialize().await.unwrap();

    let mut events = repository.subscribe();
    let people = repository.create_collection("Person").unwrap();

    let mut item = people.create_item(json!({"id": "ev1"})).unwrap();
    people.put_item(&mut item, &PutOptions::default()).await.unwrap();
    people.delete_item("ev1", &DeleteOptions::default()).await.unwrap();

    // A tolerant delete of a missing key must not emit.
    people.delete_item("ev1", &DeleteOptions::tolerant()).await.unwrap();

    // The bridge may interleave forwarded store events; look only at the
    // item events.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            RepositoryEvent::DidPutItem { .. } | RepositoryEvent::DidDeleteItem { .. }
        ) {
            seen.push(event);
        }
    }
    assert_eq!(
        seen,
        [
            RepositoryEvent::DidPutItem { class: "Person".to_string(), key: "ev1".to_string() },
            RepositoryEvent::DidDeleteItem { class: "Person".to_string(), key: "ev1".to_string() },
        ]
    );
}

#[tokio::test]
async fn test_store_migration_events_are_forwarded() {
    let repository = open_repository();
    let mut events = repository.subscribe();
    repository.initialize().await.unwrap();

    // The bridge forwards asynchronously; wait for both markers.
    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("bridge must forward store events")
            .unwrap();
        if matches!(
            event,
            RepositoryEvent::MigrationDidStart | RepositoryEvent::MigrationDidStop
        ) {
            seen.push(event);
        }
    }
    assert_eq!(seen, [RepositoryEvent::MigrationDidStart, RepositoryEvent::MigrationDidStop]);
}
