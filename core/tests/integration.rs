//! End-to-end tests against the live mock server.
//!
//! # Design
//! Each test starts its own mock server on a random port and drives the
//! default ureq transport over real HTTP, so request building, response
//! classification and the typed codec are exercised together. The record
//! tests reuse one small contact schema throughout.

use stockline_core::{
    asc, schema, ApiVersion, Auth, Domain, Error, MemoryCache, Registry, Schema, Session,
    TaskState, Value, ValueMap,
};

/// Start a fresh mock server and return its base endpoint.
fn spawn_server() -> String {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });

    format!("http://{addr}")
}

fn test_session(endpoint: &str) -> Session {
    Session::new("test")
        .with_endpoint(endpoint)
        .with_auth(Auth::api_key("test-key"))
}

fn contact_schema() -> Schema {
    Schema::builder("contact")
        .field(schema::string("name").required())
        .field(schema::string("email"))
        .field(schema::boolean("active").default_value(true))
        .build()
        .unwrap()
}

#[test]
fn contact_lifecycle() {
    let endpoint = spawn_server();
    let session = test_session(&endpoint);
    let mut registry = Registry::new(&session);
    registry.register(contact_schema()).unwrap();

    // Step 1: create through the record layer.
    let mut contact = registry.new_record("contact").unwrap();
    contact.set("name", "Ada Lovelace").unwrap();
    contact.set("email", "ada@example.com").unwrap();
    contact.save(&registry).unwrap();
    assert_eq!(contact.id(), Some(1));
    assert!(!contact.is_dirty());
    assert_eq!(contact.get("active").unwrap(), Value::Bool(true));

    // Step 2: the record is findable by query.
    let query = registry
        .query("contact")
        .unwrap()
        .filter_by("name", "Ada Lovelace");
    assert_eq!(query.count().unwrap(), 1);
    let found = query.one().unwrap();
    assert_eq!(found, contact);
    assert_eq!(found.get("email").unwrap(), Value::from("ada@example.com"));

    // Step 3: change one field and save again.
    contact.set("email", "ada@lovelace.dev").unwrap();
    assert_eq!(contact.changes().len(), 1);
    contact.save(&registry).unwrap();
    let reread = registry.get_by_id("contact", 1).unwrap();
    assert_eq!(reread.get("email").unwrap(), Value::from("ada@lovelace.dev"));

    // Step 4: attach a document to the saved record.
    let attachment = session
        .model("contact")
        .attach(1, "notes.txt", "https://files.example/notes.txt")
        .unwrap();
    assert!(attachment.as_i64().is_some());

    // Step 5: archiving hides the record from plain queries.
    query.archive().unwrap();
    assert!(matches!(query.one().unwrap_err(), Error::NoResultFound));
    let archived = query.get(1).unwrap().unwrap();
    assert_eq!(archived.get("active").unwrap(), Value::Bool(false));

    // Step 6: delete for real.
    archived.delete(&registry).unwrap();
    assert!(matches!(
        registry.get_by_id("contact", 1).unwrap_err(),
        Error::NoResultFound
    ));
}

#[test]
fn relations_and_typed_envelopes_cross_the_wire() {
    let endpoint = spawn_server();
    let session = test_session(&endpoint);
    let mut registry = Registry::new(&session);
    registry
        .register(
            Schema::builder("contact")
                .field(schema::string("name").required())
                .field(schema::decimal("credit_limit"))
                .field(schema::datetime("last_seen"))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            Schema::builder("address")
                .field(schema::string("street").required())
                .field(schema::belongs_to("contact", "contact"))
                .build()
                .unwrap(),
        )
        .unwrap();

    let last_seen = chrono::NaiveDate::from_ymd_opt(2026, 8, 26)
        .unwrap()
        .and_hms_opt(10, 30, 0)
        .unwrap();
    let mut contact = registry.new_record("contact").unwrap();
    contact.set("name", "Ada Lovelace").unwrap();
    contact
        .set("credit_limit", rust_decimal::Decimal::new(9950, 2))
        .unwrap();
    contact.set("last_seen", last_seen).unwrap();
    contact.save(&registry).unwrap();
    let contact_id = contact.id().unwrap();

    let mut address = registry.new_record("address").unwrap();
    address.set("street", "12 Analytical Row").unwrap();
    address.set("contact", contact_id).unwrap();
    address.save(&registry).unwrap();

    // The typed envelopes survived the round trip through the server.
    let found = registry
        .query("contact")
        .unwrap()
        .filter_by("name", "Ada Lovelace")
        .one()
        .unwrap();
    assert_eq!(
        found.get("credit_limit").unwrap(),
        Value::Decimal(rust_decimal::Decimal::new(9950, 2))
    );
    assert_eq!(found.get("last_seen").unwrap(), Value::DateTime(last_seen));

    // belongs-to resolves lazily through the registry.
    let resident = address.related(&registry, "contact").unwrap().unwrap();
    assert_eq!(resident.id(), Some(contact_id));
    assert_eq!(resident.get("name").unwrap(), Value::from("Ada Lovelace"));
}

#[test]
fn queries_stream_in_pages() {
    let endpoint = spawn_server();
    let session = test_session(&endpoint);
    let model = session.model("item");

    let rows: Vec<ValueMap> = (1..=7)
        .map(|n| {
            let mut row = ValueMap::new();
            row.insert("name".to_string(), Value::from(format!("item-{n}")));
            row
        })
        .collect();
    assert_eq!(model.create(&rows, None).unwrap(), vec![1, 2, 3, 4, 5, 6, 7]);

    let query = model.query().order_by(vec![asc("id")]);
    let all: Vec<_> = query.all().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(all.len(), 7);
    assert_eq!(all[0].get("id"), Some(&Value::Int(1)));

    let window: Vec<_> = query
        .offset(2)
        .limit(3)
        .all()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let ids: Vec<i64> = window
        .iter()
        .filter_map(|row| row.get("id")?.as_i64())
        .collect();
    assert_eq!(ids, vec![3, 4, 5]);
}

#[test]
fn wire_failures_map_onto_the_taxonomy() {
    let endpoint = spawn_server();
    let session = test_session(&endpoint);

    // A 400 with a structured body is a user error with its code.
    let err = session
        .model("contact")
        .create(&[ValueMap::new()], None)
        .unwrap_err();
    match err {
        Error::User { code, .. } => assert_eq!(code.as_deref(), Some("required_field")),
        other => panic!("expected a user error, got {other:?}"),
    }

    // A 5xx carries the incident id from the response headers.
    let err = session
        .model("boom")
        .search(&Domain::all(), None, None, None, None)
        .unwrap_err();
    assert_eq!(err.incident_id(), Some("snt-123"));
    assert!(matches!(err, Error::Server { status: 500, .. }));

    // Any other 4xx is a plain client error.
    let err = session.model("contact").get(99, None).unwrap_err();
    assert!(matches!(err, Error::Client { status: 404, .. }));

    // A 401 from stale credentials, and the liveness probe built on it.
    let stale = Session::new("test")
        .with_endpoint(&endpoint)
        .with_auth(Auth::api_key("expired-key"));
    let err = stale
        .model("contact")
        .search(&Domain::all(), None, None, None, None)
        .unwrap_err();
    assert!(err.is_authentication());
    assert!(!stale.is_auth_alive().unwrap());
    assert!(session.is_auth_alive().unwrap());
}

#[test]
fn login_unlocks_the_session() {
    let endpoint = spawn_server();
    let mut session = Session::new("test").with_endpoint(&endpoint);

    assert!(session.login("admin", "wrong").unwrap().is_none());
    assert!(session.auth().is_none());

    let (user_id, key) = session.login("admin", "admin").unwrap().unwrap();
    assert_eq!(user_id, 1);
    assert!(!key.is_empty());
    assert!(session.auth().is_some());
    assert!(session.is_auth_alive().unwrap());

    let context = session.refresh_context().unwrap();
    assert_eq!(context.get("company"), Some(&Value::Int(1)));
    assert_eq!(context.get("locale"), Some(&Value::from("en_US")));
}

#[test]
fn bearer_tokens_use_the_second_api_version() {
    let endpoint = spawn_server();
    let session = Session::new("test")
        .with_endpoint(&endpoint)
        .with_auth(Auth::bearer("tok-1"));
    assert_eq!(session.api_version(), ApiVersion::V2);
    assert!(session.base_url().ends_with("/api/v2"));

    let ids = session
        .model("contact")
        .search(&Domain::all(), None, None, None, None)
        .unwrap();
    assert!(ids.is_empty());
}

#[test]
fn wizard_suspends_then_finishes_over_http() {
    let endpoint = spawn_server();
    let session = test_session(&endpoint);
    let wizard = session.wizard("stock.ship");

    let processed = wizard
        .with_session(None, |ws| {
            // The opening transition suspended on a view and staged its defaults.
            assert!(!ws.is_finished());
            let staged = ws.data().get("start").and_then(|values| values.get("qty"));
            assert_eq!(staged, Some(&Value::Int(1)));

            ws.set_value("start", "qty", 4);
            let step = ws.run("start")?;
            assert!(step.is_finished());
            Ok(step.result().get("processed").cloned())
        })
        .unwrap();

    assert_eq!(processed, Some(Value::Int(4)));
}

#[test]
fn exports_poll_through_to_success() {
    let endpoint = spawn_server();
    let session = test_session(&endpoint);
    let model = session.model("sale.order");

    let mut order = ValueMap::new();
    order.insert("reference".to_string(), Value::from("SO-1"));
    let ids = model.create(&[order], None).unwrap();

    let launched = model
        .call_record(ids[0], "start_export", &[], None)
        .unwrap();
    let task = match launched {
        Value::Task(task) => task,
        other => panic!("expected an async task, got {other:?}"),
    };

    let mut handle = task.bind(&session);
    assert_eq!(handle.state(), TaskState::Pending);
    assert!(!handle.ready().unwrap());
    assert_eq!(handle.state(), TaskState::Started);
    assert!(handle.ready().unwrap());
    assert_eq!(handle.state(), TaskState::Success);
    assert!(!handle.failed().unwrap());
    assert_eq!(handle.result(), Some(&Value::Int(42)));
}

#[test]
fn reports_render_into_bytes() {
    let endpoint = spawn_server();
    let session = test_session(&endpoint);

    let rendered = session
        .report("invoice")
        .execute(&[1, 2], &ValueMap::new(), None)
        .unwrap();
    assert_eq!(rendered, Value::bytes(b"invoice:2".to_vec()));
}

#[test]
fn cached_reads_survive_remote_changes_until_invalidated() {
    let endpoint = spawn_server();
    let session = test_session(&endpoint);
    let mut registry = Registry::new(&session).with_cache(Box::new(MemoryCache::new()));
    registry.register(contact_schema()).unwrap();

    let mut contact = registry.new_record("contact").unwrap();
    contact.set("name", "Ada").unwrap();
    contact.save(&registry).unwrap();

    // Change the row behind the registry's back.
    let mut values = ValueMap::new();
    values.insert("name".to_string(), Value::from("Grace"));
    session.model("contact").write(&[1], &values, None).unwrap();

    // The cache still answers with the snapshot taken at save time.
    let cached = registry.from_cache("contact", 1).unwrap();
    assert_eq!(cached.get("name").unwrap(), Value::from("Ada"));

    // A refresh invalidates the entry and re-reads on the next lookup.
    contact.refresh(&registry).unwrap();
    assert_eq!(contact.get("name").unwrap(), Value::from("Grace"));
    let fresh = registry.from_cache("contact", 1).unwrap();
    assert_eq!(fresh.get("name").unwrap(), Value::from("Grace"));
}
