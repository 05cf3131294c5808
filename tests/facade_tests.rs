//! End-to-end tests through the `shoaldb` facade

use shoaldb::{
    ErrorKind, Object, ObjectSchema, Property, PropertyType, Realm, RealmConfig, Schema, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn task_schema(with_done: bool) -> Schema {
    let mut props = vec![Property::new("title", PropertyType::String)];
    if with_done {
        props.push(Property::new("done", PropertyType::Bool).with_default(false));
    }
    vec![ObjectSchema::new("Task", props).with_primary_key("title")].into()
}

fn task(title: &str) -> Object {
    [("title".to_string(), Value::from(title))].into()
}

#[test]
fn test_open_write_migrate_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.shoal");

    {
        let realm =
            Realm::get_shared_realm(RealmConfig::new(&path).schema(task_schema(false)).schema_version(1))
                .unwrap();
        realm.begin_transaction().unwrap();
        realm.create_object("Task", task("write docs"), false).unwrap();
        realm.create_object("Task", task("ship"), false).unwrap();
        realm.commit_transaction().unwrap();
    }

    let migrated = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&migrated);
    let realm = Realm::get_shared_realm(
        RealmConfig::new(&path)
            .schema(task_schema(true))
            .schema_version(2)
            .migration(move |migration| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(migration.old_version(), Some(1));
                for row in 0..migration.object_count("Task") {
                    migration.set_value("Task", row, "done", Value::Bool(true))?;
                }
                Ok(())
            }),
    )
    .unwrap();

    assert_eq!(migrated.load(Ordering::SeqCst), 1);
    assert_eq!(realm.schema_version(), Some(2));
    let tasks = realm.objects("Task").unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.get("done") == Some(&Value::Bool(true))));
}

#[test]
fn test_handles_are_per_thread() {
    let dir = TempDir::new().unwrap();
    let config = RealmConfig::new(dir.path().join("tasks.shoal"))
        .schema(task_schema(false))
        .schema_version(1);

    let realm = Realm::get_shared_realm(config.clone()).unwrap();
    assert!(Arc::ptr_eq(&realm, &Realm::get_shared_realm(config.clone()).unwrap()));

    let shared = Arc::clone(&realm);
    let (kind, same) = thread::spawn(move || {
        let own = Realm::get_shared_realm(config).unwrap();
        (
            shared.begin_transaction().unwrap_err().kind(),
            Arc::ptr_eq(&own, &shared),
        )
    })
    .join()
    .unwrap();

    assert_eq!(kind, ErrorKind::IncorrectThread);
    assert!(!same);
}
