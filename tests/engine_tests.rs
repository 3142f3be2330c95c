//! Engine Integration Tests
//!
//! Nested writes, removals, generic links and notifications through the
//! public `Processor` API over the in-memory store.

use crossbeam::channel::{bounded, Receiver, Sender};
use custodian_core::*;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn schema(b_on_delete: &str) -> Vec<MetaDescription> {
    vec![
        MetaDescription::new("a", "id")
            .with_field(FieldSpec::key("id"))
            .with_field(FieldSpec::new("name", FieldType::String))
            .with_field(FieldSpec::array("bs", "b", "a")),
        MetaDescription::new("b", "id")
            .with_field(FieldSpec::key("id"))
            .with_field(FieldSpec::new("name", FieldType::String).optional())
            .with_field(FieldSpec::object("a", "a").optional().on_delete(b_on_delete))
            .with_field(FieldSpec::array("cs", "c", "b")),
        MetaDescription::new("c", "id")
            .with_field(FieldSpec::key("id"))
            .with_field(FieldSpec::object("b", "b").on_delete("cascade")),
        MetaDescription::new("t", "id")
            .with_field(FieldSpec::key("id"))
            .with_field(FieldSpec::generic("target", &["a", "b"]).optional()),
    ]
}

fn setup_processor(b_on_delete: &str) -> Processor {
    let registry = Arc::new(MetaRegistry::new());
    registry.create_many(schema(b_on_delete)).unwrap();
    let store = Arc::new(MemoryStore::new(registry.clone()));
    Processor::new(registry, store, EngineConfig::default())
}

fn data(value: serde_json::Value) -> ValueMap {
    map_from_json(value)
}

fn exists(processor: &Processor, object: &str, key: i64) -> bool {
    processor.get(object, key, &GetOptions::new()).unwrap().is_some()
}

#[test]
fn test_create_then_get_round_trip() {
    let processor = setup_processor("cascade");
    let created = processor.create_record("a", data(json!({"name": "first"})), None).unwrap();
    assert_eq!(created["id"], Value::Int(1), "Sequence should generate the key");

    let fetched = processor
        .get("a", 1i64, &GetOptions::new().with_depth(1).omit_outers())
        .unwrap()
        .expect("record should exist");
    assert_eq!(fetched["id"], Value::Int(1));
    assert_eq!(fetched["name"], Value::String("first".into()));
    assert!(!fetched.contains_key("bs"));
}

#[test]
fn test_mandatory_field_absent() {
    let processor = setup_processor("cascade");
    let err = processor.create_record("a", ValueMap::new(), None).unwrap_err();
    assert_eq!(err.code(), "mandatory_field_absent");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_nested_array_keeps_submitted_order() {
    let processor = setup_processor("cascade");
    let existing = processor.create_record("b", data(json!({"name": "old"})), None).unwrap();
    assert_eq!(existing["id"], Value::Int(1));

    let created = processor
        .create_record("a", data(json!({"name": "parent", "bs": [{"name": "new"}, 1]})), None)
        .unwrap();
    let parent_key = created["id"].clone();

    let bs = match &created["bs"] {
        Value::List(items) => items.clone(),
        other => panic!("bs should be a list, got {:?}", other),
    };
    assert_eq!(bs.len(), 2);
    let first = bs[0].as_map().unwrap();
    let second = bs[1].as_map().unwrap();
    assert_eq!(first["name"], Value::String("new".into()));
    assert_eq!(first["id"], Value::Int(2));
    assert_eq!(second["id"], Value::Int(1));
    assert_eq!(second["name"], Value::String("old".into()));

    let (rows, total) = processor
        .get_bulk("b", &format!("eq(a,{})", parent_key), &GetOptions::new())
        .unwrap();
    assert_eq!(total, 2, "Both children should reference the parent");
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_update_drops_unlisted_children() {
    let processor = setup_processor("cascade");
    processor
        .create_record("a", data(json!({"name": "p", "bs": [{"name": "x"}, {"name": "y"}]})), None)
        .unwrap();

    processor
        .update_record("a", 1i64, data(json!({"bs": [2]})), None)
        .unwrap();
    assert!(!exists(&processor, "b", 1), "Unlisted child should be cascaded");
    assert!(exists(&processor, "b", 2));
}

#[test]
fn test_update_relisting_children_under_set_null() {
    let processor = setup_processor("setNull");
    processor
        .create_record("a", data(json!({"name": "p", "bs": [{"name": "x"}, {"name": "y"}]})), None)
        .unwrap();

    let updated = processor
        .update_record("a", 1i64, data(json!({"bs": [2]})), None)
        .unwrap();
    assert_eq!(updated["id"], Value::Int(1));

    let dropped = processor
        .get("b", 1i64, &GetOptions::new().omit_outers())
        .unwrap()
        .expect("unlisted child should survive");
    assert!(dropped["a"].is_null(), "Unlisted child should be unlinked");
    let kept = processor
        .get("b", 2i64, &GetOptions::new().omit_outers())
        .unwrap()
        .expect("listed child should survive");
    assert_eq!(kept["a"], Value::Int(1));

    let (_, total) = processor.get_bulk("b", "eq(a,1)", &GetOptions::new()).unwrap();
    assert_eq!(total, 1);
}

#[test]
fn test_cascade_removes_dependents() {
    let processor = setup_processor("cascade");
    processor
        .create_record(
            "a",
            data(json!({"name": "root", "bs": [{"name": "b1", "cs": [{}, {}]}]})),
            None,
        )
        .unwrap();
    assert!(exists(&processor, "c", 2));

    let removed = processor.remove_record("a", 1i64, None).unwrap();
    assert!(removed.contains_key("bs"));
    assert!(!exists(&processor, "a", 1));
    assert!(!exists(&processor, "b", 1));
    assert!(!exists(&processor, "c", 1));
    assert!(!exists(&processor, "c", 2));
}

#[test]
fn test_restrict_keeps_records() {
    let processor = setup_processor("restrict");
    processor
        .create_record("a", data(json!({"name": "root", "bs": [{"name": "b1"}]})), None)
        .unwrap();

    let err = processor.remove_record("a", 1i64, None).unwrap_err();
    assert_eq!(err.code(), "removal_error");
    assert_eq!(err.kind(), ErrorKind::Removal);
    assert!(exists(&processor, "a", 1));
    assert!(exists(&processor, "b", 1));
}

#[test]
fn test_set_null_keeps_dependents() {
    let processor = setup_processor("setNull");
    processor
        .create_record("a", data(json!({"name": "root", "bs": [{"name": "b1"}]})), None)
        .unwrap();

    let removed = processor.remove_record("a", 1i64, None).unwrap();
    assert!(!removed.contains_key("bs"), "Unlinked records are not listed as removed");

    let b = processor
        .get("b", 1i64, &GetOptions::new().omit_outers())
        .unwrap()
        .expect("dependent should survive");
    assert!(b["a"].is_null());
}

#[test]
fn test_generic_link_integrity() {
    let processor = setup_processor("cascade");
    processor.create_record("a", data(json!({"name": "target"})), None).unwrap();

    let err = processor
        .create_record("t", data(json!({"target": {"_object": "a", "id": 42}})), None)
        .unwrap_err();
    assert_eq!(err.code(), "value_does_not_exist");

    let err = processor
        .create_record("t", data(json!({"target": {"_object": "c", "id": 1}})), None)
        .unwrap_err();
    assert_eq!(err.code(), "wrong_field_type");

    let created = processor
        .create_record("t", data(json!({"target": {"_object": "a", "id": 1}})), None)
        .unwrap();
    let target = created["target"].as_map().expect("generic value should be a map");
    assert_eq!(target["_object"], Value::String("a".into()));
    assert_eq!(target["id"], Value::Int(1));
}

#[test]
fn test_generic_nested_record_is_created_first() {
    let processor = setup_processor("cascade");
    let created = processor
        .create_record("t", data(json!({"target": {"_object": "a", "name": "inline"}})), None)
        .unwrap();
    let target = created["target"].as_map().unwrap();
    assert_eq!(target["_object"], Value::String("a".into()));
    assert_eq!(target["id"], Value::Int(1));
    assert!(exists(&processor, "a", 1));
}

#[test]
fn test_get_bulk_filters_sorts_and_pages() {
    let processor = setup_processor("cascade");
    for name in ["x", "y", "z"] {
        processor.create_record("a", data(json!({"name": name})), None).unwrap();
    }

    let (rows, total) = processor.get_bulk("a", "eq(name,y)", &GetOptions::new()).unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0]["id"], Value::Int(2));

    let (rows, total) = processor.get_bulk("a", "sort(-name),limit(2)", &GetOptions::new()).unwrap();
    assert_eq!(total, 3, "Total is counted before paging");
    let names: Vec<&Value> = rows.iter().map(|r| &r["name"]).collect();
    assert_eq!(names, vec![&Value::String("z".into()), &Value::String("y".into())]);

    let (rows, _) = processor.get_bulk("a", "in(name,(x,z))", &GetOptions::new()).unwrap();
    assert_eq!(rows.len(), 2);

    let err = processor.get_bulk("a", "eq(nope,1)", &GetOptions::new()).unwrap_err();
    assert_eq!(err.code(), "wrong_rql");
}

#[test]
fn test_get_bulk_through_relation() {
    let processor = setup_processor("cascade");
    processor
        .create_record("a", data(json!({"name": "left", "bs": [{"name": "l1"}]})), None)
        .unwrap();
    processor
        .create_record("a", data(json!({"name": "right", "bs": [{"name": "r1"}, {"name": "r2"}]})), None)
        .unwrap();

    let (rows, total) = processor.get_bulk("b", "eq(a.name,right)", &GetOptions::new()).unwrap();
    assert_eq!(total, 2);
    assert!(rows.iter().all(|r| r["name"] != Value::String("l1".into())));
}

#[test]
fn test_bulk_update_requires_keys() {
    let processor = setup_processor("cascade");
    processor
        .bulk_create_records("a", vec![data(json!({"name": "x"})), data(json!({"name": "y"}))], None)
        .unwrap();

    let updated = processor
        .bulk_update_records(
            "a",
            vec![data(json!({"id": 1, "name": "x2"})), data(json!({"id": "2", "name": "y2"}))],
            None,
        )
        .unwrap();
    assert_eq!(updated.len(), 2);
    assert_eq!(updated[1]["name"], Value::String("y2".into()));

    let err = processor
        .bulk_update_records("a", vec![data(json!({"id": true, "name": "z"}))], None)
        .unwrap_err();
    assert_eq!(err.code(), "key_value_not_found");

    let removed = processor
        .bulk_delete_records("a", vec![data(json!({"id": 1})), data(json!({"id": 2}))], None)
        .unwrap();
    assert_eq!(removed.len(), 2);
    assert!(!exists(&processor, "a", 2));
}

fn notifying_processor(sink: &TestNotifier) -> Processor {
    let registry = Arc::new(MetaRegistry::new());
    let shared = sink.clone();
    registry.register_notifier_factory(Protocol::Test, move |_args, active_if_not_root| {
        Ok(Arc::new(shared.with_active_if_not_root(active_if_not_root)) as Arc<dyn Notifier>)
    });
    registry
        .create_many(vec![
            MetaDescription::new("b", "id").with_field(FieldSpec::key("id")),
            MetaDescription::new("a", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::new("first_name", FieldType::String))
                .with_field(FieldSpec::new("last_name", FieldType::String))
                .with_field(FieldSpec::object("b", "b").optional())
                .with_action(
                    ActionSpec::new(Method::Create, Protocol::Test)
                        .include("a_last_name", json!("last_name"))
                        .include("b_id", json!("b.id")),
                ),
        ])
        .unwrap();
    let store = Arc::new(MemoryStore::new(registry.clone()));
    Processor::new(registry, store, EngineConfig::default())
}

#[test]
fn test_create_notification_carries_included_values() {
    let sink = TestNotifier::new(false);
    let processor = notifying_processor(&sink);
    processor.create_record("b", ValueMap::new(), None).unwrap();

    let user = User::new("editor");
    processor
        .create_record(
            "a",
            data(json!({"first_name": "Ada", "last_name": "Lovelace", "b": 1})),
            Some(&user),
        )
        .unwrap();

    assert!(sink.wait_closed(1, Duration::from_secs(5)));
    let events = sink.events();
    assert_eq!(events.len(), 1);
    let payload = &events[0].payload;
    assert_eq!(payload["action"], json!("create"));
    assert_eq!(payload["object"], json!("a"));
    assert_eq!(payload["previous"], json!({}));
    assert_eq!(payload["user"]["login"], json!("editor"));

    let current = payload["current"].as_object().unwrap();
    let mut keys: Vec<&str> = current.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["a_last_name", "b", "b_id", "first_name", "id"]);
    assert_eq!(current["a_last_name"], json!("Lovelace"));
    assert_eq!(current["b_id"], json!(1));
}

#[test]
fn test_failed_bulk_create_sends_error_event() {
    let sink = TestNotifier::new(false);
    let processor = notifying_processor(&sink);

    let result = processor.bulk_create_records(
        "a",
        vec![
            data(json!({"first_name": "ok", "last_name": "ok"})),
            data(json!({"first_name": "missing last name"})),
        ],
        None,
    );
    assert!(result.is_err());
    // statements commit one by one
    assert!(processor.get("a", 1i64, &GetOptions::new()).unwrap().is_some());

    assert!(sink.wait_closed(1, Duration::from_secs(5)));
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_error());
}

fn catalog_processor() -> Processor {
    let registry = Arc::new(MetaRegistry::new());
    registry
        .create_many(vec![
            MetaDescription::new("post", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::new("title", FieldType::String))
                .with_field(FieldSpec::objects("tags", "tag"))
                .with_field(FieldSpec::generic_outer("notes", "note", "target")),
            MetaDescription::new("tag", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::new("label", FieldType::String)),
            MetaDescription::new("note", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::new("text", FieldType::String).optional())
                .with_field(FieldSpec::generic("target", &["post"])),
        ])
        .unwrap();
    let store = Arc::new(MemoryStore::new(registry.clone()));
    Processor::new(registry, store, EngineConfig::default())
}

fn key_strings(value: &Value) -> Vec<String> {
    let mut keys: Vec<String> = value
        .as_list()
        .expect("plural field should be a list")
        .iter()
        .map(Value::to_key_string)
        .collect();
    keys.sort();
    keys
}

#[test]
fn test_many_to_many_create_get_update() {
    let processor = catalog_processor();
    processor.create_record("tag", data(json!({"label": "old"})), None).unwrap();

    processor
        .create_record("post", data(json!({"title": "p", "tags": [{"label": "new"}, 1]})), None)
        .unwrap();
    assert!(exists(&processor, "tag", 2), "Nested tag should be created");

    let post = processor
        .get("post", 1i64, &GetOptions::new().with_depth(1))
        .unwrap()
        .expect("post should exist");
    assert_eq!(key_strings(&post["tags"]), vec!["1", "2"]);

    let deep = processor
        .get("post", 1i64, &GetOptions::new().with_depth(2))
        .unwrap()
        .unwrap();
    let mut labels: Vec<String> = deep["tags"]
        .as_list()
        .unwrap()
        .iter()
        .map(|tag| tag.as_map().unwrap()["label"].to_key_string())
        .collect();
    labels.sort();
    assert_eq!(labels, vec!["new", "old"]);

    processor
        .update_record("post", 1i64, data(json!({"tags": [2]})), None)
        .unwrap();
    let (links, total) = processor.get_bulk("post__tag", "eq(post,1)", &GetOptions::new()).unwrap();
    assert_eq!(total, 1, "Only the listed tag stays linked");
    assert_eq!(links[0]["tag"], Value::Int(2));
    assert!(exists(&processor, "tag", 1), "Unlinking keeps the tag itself");

    let post = processor
        .get("post", 1i64, &GetOptions::new().with_depth(1))
        .unwrap()
        .unwrap();
    assert_eq!(key_strings(&post["tags"]), vec!["2"]);
}

#[test]
fn test_generic_outer_nested_write() {
    let processor = catalog_processor();
    processor
        .create_record("post", data(json!({"title": "p", "notes": [{"text": "a"}, {"text": "b"}]})), None)
        .unwrap();

    let (rows, total) = processor
        .get_bulk("note", "eq(target.post.id,1)", &GetOptions::new())
        .unwrap();
    assert_eq!(total, 2, "Both notes should reference the post");
    assert_eq!(rows.len(), 2);

    let note = processor
        .get("note", 1i64, &GetOptions::new().with_depth(1))
        .unwrap()
        .expect("note should exist");
    let target = note["target"].as_map().expect("generic value should be a map");
    assert_eq!(target[GENERIC_OBJECT_KEY], Value::String("post".into()));
    assert_eq!(target["id"], Value::Int(1));

    let post = processor
        .get("post", 1i64, &GetOptions::new().with_depth(1))
        .unwrap()
        .unwrap();
    assert_eq!(key_strings(&post["notes"]), vec!["1", "2"]);

    processor
        .update_record("post", 1i64, data(json!({"notes": [2]})), None)
        .unwrap();
    assert!(!exists(&processor, "note", 1), "Unlisted note should be cascaded");
    assert!(exists(&processor, "note", 2));
}

/// Notifier whose channels are never read until the test asks for them
#[derive(Default)]
struct StalledNotifier {
    receivers: Mutex<Vec<Receiver<Event>>>,
}

impl Notifier for StalledNotifier {
    fn open(&self, capacity: usize) -> Sender<Event> {
        let (sender, receiver) = bounded(capacity);
        self.receivers.lock().push(receiver);
        sender
    }

    fn active_if_not_root(&self) -> bool {
        false
    }
}

#[test]
fn test_stalled_notifier_does_not_block_writes() {
    let stalled = Arc::new(StalledNotifier::default());
    let registry = Arc::new(MetaRegistry::new());
    let shared = stalled.clone();
    registry.register_notifier_factory(Protocol::Test, move |_args, _active_if_not_root| {
        Ok(shared.clone() as Arc<dyn Notifier>)
    });
    registry
        .create(
            MetaDescription::new("a", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::new("name", FieldType::String))
                .with_action(ActionSpec::new(Method::Create, Protocol::Test)),
        )
        .unwrap();
    let store = Arc::new(MemoryStore::new(registry.clone()));
    let processor = Arc::new(Processor::new(
        registry,
        store,
        EngineConfig::default().with_notification_buffer(1),
    ));

    let (done_tx, done_rx) = bounded(1);
    let writer = processor.clone();
    std::thread::spawn(move || {
        let records = ["x", "y", "z"].iter().map(|name| data(json!({"name": name}))).collect();
        let result = writer.bulk_create_records("a", records, None).map(|rows| rows.len());
        let _ = done_tx.send(result);
    });
    let created = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("bulk create should not wait for the notification consumer");
    assert_eq!(created.unwrap(), 3);

    let receivers = stalled.receivers.lock().clone();
    let mut delivered = 0;
    for receiver in receivers {
        while let Ok(event) = receiver.recv_timeout(Duration::from_secs(5)) {
            assert!(!event.is_error());
            delivered += 1;
        }
    }
    assert_eq!(delivered, 3, "Queued events are delivered once the consumer reads");
}
