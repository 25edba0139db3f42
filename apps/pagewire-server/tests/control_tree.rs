//! Command execution against a session's control tree on the in-process cache.

use std::sync::Arc;
use std::time::Duration;

use pagewire_cache::MemoryCache;
use pagewire_server::model::{Command, Page, Session};
use pagewire_server::protocol::{
    client_channel, AddPageControlsPayload, ControlPropsPayload, Message, ADD_PAGE_CONTROLS,
    UPDATE_CONTROL_PROPS,
};
use pagewire_server::session_handler::{new_session, CommandError, SessionHandler};
use pagewire_server::store::{Store, StoreError};

fn command(text: &str) -> Command {
    Command::parse(text, true).unwrap().unwrap()
}

async fn setup(size_limit: usize) -> (Store, SessionHandler) {
    let store = Store::new(Arc::new(MemoryCache::new()), size_limit);
    let mut page = Page::new("acme/todo", true, "", "127.0.0.1");
    store.add_page(&mut page).await.unwrap();
    let session = new_session(
        &store,
        page,
        "s1",
        "127.0.0.1",
        "",
        "",
        "",
        Duration::from_secs(60),
    )
    .await
    .unwrap();
    let handler = SessionHandler::new(&store, session);
    (store, handler)
}

async fn children(store: &Store, session: &Session, id: &str) -> Vec<String> {
    store
        .get_session_control(session, id)
        .await
        .unwrap()
        .map(|c| c.children)
        .unwrap_or_default()
}

#[tokio::test]
async fn nested_add_builds_hierarchical_ids() {
    let (store, handler) = setup(0).await;
    let result = handler
        .execute(&command("add stack id=s\n  text value=a\n  text value=b"))
        .await
        .unwrap();
    assert_eq!(result, "s s:_1 s:_2");

    let session = handler.session();
    assert_eq!(children(&store, session, "page").await, vec!["s"]);
    assert_eq!(children(&store, session, "s").await, vec!["s:_1", "s:_2"]);
    assert_eq!(
        handler.execute(&command("get s:_2 value")).await.unwrap(),
        "b"
    );
}

#[tokio::test]
async fn remove_cascades_to_descendants() {
    let (store, handler) = setup(0).await;
    handler
        .execute(&command("add stack id=s\n  stack id=inner\n    text id=leaf"))
        .await
        .unwrap();
    let session = handler.session();
    assert!(store
        .get_session_control(session, "s:inner:leaf")
        .await
        .unwrap()
        .is_some());

    handler.execute(&command("remove s")).await.unwrap();
    let controls = store.get_all_session_controls(session).await.unwrap();
    assert_eq!(controls.len(), 1);
    assert!(controls.contains_key("page"));
    assert!(children(&store, session, "page").await.is_empty());
}

#[tokio::test]
async fn trim_keeps_oldest_or_newest_children() {
    let (store, handler) = setup(0).await;
    for id in ["a", "b", "c", "d", "e"] {
        handler
            .execute(&command(&format!("add text id={id}")))
            .await
            .unwrap();
    }
    handler.execute(&command("add text id=f trim=3")).await.unwrap();
    let session = handler.session();
    assert_eq!(children(&store, session, "page").await, vec!["d", "e", "f"]);
    assert!(store.get_session_control(session, "a").await.unwrap().is_none());

    handler.execute(&command("add text id=g trim=-2")).await.unwrap();
    assert_eq!(children(&store, session, "page").await, vec!["d", "e"]);
}

#[tokio::test]
async fn set_append_and_get_properties() {
    let (_store, handler) = setup(0).await;
    handler.execute(&command("add textbox id=name")).await.unwrap();

    handler.execute(&command("set name value=x")).await.unwrap();
    handler.execute(&command("append name value=y")).await.unwrap();
    assert_eq!(handler.execute(&command("get name value")).await.unwrap(), "xy");

    handler.execute(&command("set name value=")).await.unwrap();
    assert_eq!(handler.execute(&command("get name value")).await.unwrap(), "");
}

#[tokio::test]
async fn multi_line_set_with_unknown_target_changes_nothing() {
    let (_store, handler) = setup(0).await;
    handler.execute(&command("add text id=a value=0")).await.unwrap();
    handler.execute(&command("add text id=b value=0")).await.unwrap();

    let err = handler
        .execute(&command("set a value=1\n  b value=2\n  missing value=3"))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::ControlNotFound(id) if id == "missing"));
    assert_eq!(handler.execute(&command("get a value")).await.unwrap(), "0");
    assert_eq!(handler.execute(&command("get b value")).await.unwrap(), "0");

    handler
        .execute(&command("append a value=1\n  a value=2"))
        .await
        .unwrap();
    assert_eq!(handler.execute(&command("get a value")).await.unwrap(), "012");
}

#[tokio::test]
async fn set_skips_serialized_key_names() {
    let (store, handler) = setup(0).await;
    handler.execute(&command("add text id=t")).await.unwrap();
    handler
        .execute(&command("set t i=other p=elsewhere value=kept"))
        .await
        .unwrap();

    let control = store
        .get_session_control(handler.session(), "t")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(control.id, "t");
    assert_eq!(control.parent, "page");
    assert_eq!(control.attr("value"), Some("kept"));
}

#[tokio::test]
async fn domain_errors_leave_the_tree_untouched() {
    let (store, handler) = setup(0).await;
    handler.execute(&command("add text id=a")).await.unwrap();

    assert!(matches!(
        handler.execute(&command("set missing value=1")).await,
        Err(CommandError::ControlNotFound(id)) if id == "missing"
    ));
    assert!(matches!(
        handler.execute(&command("remove")).await,
        Err(CommandError::RootNotRemovable)
    ));
    assert!(matches!(
        handler.execute(&command("clean a page at=0")).await,
        Err(CommandError::AtWithIdList)
    ));
    assert!(matches!(
        handler.execute(&command("clean page at=9")).await,
        Err(CommandError::AtOutOfRange)
    ));
    assert!(matches!(
        handler.execute(&command("add text to=nope")).await,
        Err(CommandError::ParentNotFound(id)) if id == "nope"
    ));
    assert!(matches!(
        handler.execute(&command("get a")).await,
        Err(CommandError::MissingGetArguments)
    ));

    assert_eq!(children(&store, handler.session(), "page").await, vec!["a"]);
}

#[tokio::test]
async fn clean_and_remove_by_position() {
    let (store, handler) = setup(0).await;
    handler
        .execute(&command("add stack id=s\n  text id=x\n  text id=y"))
        .await
        .unwrap();
    let session = handler.session();

    handler.execute(&command("remove s at=0")).await.unwrap();
    assert_eq!(children(&store, session, "s").await, vec!["s:y"]);

    handler.execute(&command("clean s")).await.unwrap();
    assert!(children(&store, session, "s").await.is_empty());
    assert!(store.get_session_control(session, "s:y").await.unwrap().is_none());
    assert!(store.get_session_control(session, "s").await.unwrap().is_some());
}

#[tokio::test]
async fn replace_swaps_children() {
    let (store, handler) = setup(0).await;
    handler
        .execute(&command("add stack id=s\n  text id=old"))
        .await
        .unwrap();
    let result = handler
        .execute(&command("replace to=s\n  text id=new"))
        .await
        .unwrap();
    assert_eq!(result, "s:new");

    let session = handler.session();
    assert_eq!(children(&store, session, "s").await, vec!["s:new"]);
    assert!(store.get_session_control(session, "s:old").await.unwrap().is_none());
}

#[tokio::test]
async fn session_size_limit_rejects_oversized_controls() {
    let (store, handler) = setup(400).await;
    let big = "x".repeat(500);
    let err = handler
        .execute(&command(&format!("add text id=big value={big}")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Store(StoreError::SessionSizeExceeded { limit: 400, .. })
    ));

    let session = handler.session();
    assert!(store.get_session_control(session, "big").await.unwrap().is_none());
    assert!(children(&store, session, "page").await.is_empty());

    handler.execute(&command("add text id=small value=ok")).await.unwrap();
    assert_eq!(children(&store, session, "page").await, vec!["small"]);
}

#[tokio::test]
async fn batch_reports_values_and_stops_at_first_failure() {
    let (store, handler) = setup(0).await;
    let results = handler
        .execute_batch(&[
            command("add text id=x value=1"),
            command("set x value=2"),
            command("get x value"),
            command("canaccess"),
        ])
        .await
        .unwrap();
    assert_eq!(results, vec!["x", "2", "true"]);

    let err = handler
        .execute_batch(&[
            command("add text id=y"),
            command("set missing value=1"),
            command("add text id=z"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::ControlNotFound(_)));

    let session = handler.session();
    assert!(store.get_session_control(session, "y").await.unwrap().is_some());
    assert!(store.get_session_control(session, "z").await.unwrap().is_none());
}

#[tokio::test]
async fn canaccess_without_principal_only_passes_open_expressions() {
    let (_store, handler) = setup(0).await;
    assert_eq!(handler.execute(&command("canaccess")).await.unwrap(), "true");
    assert_eq!(handler.execute(&command("canaccess *")).await.unwrap(), "false");
}

#[tokio::test]
async fn deltas_are_published_to_web_clients() {
    let (store, handler) = setup(0).await;
    let session = handler.session().clone();
    let mut subscription = store
        .cache()
        .subscribe(&client_channel("web-1"))
        .await
        .unwrap();
    store
        .add_session_web_client(session.page.id, &session.id, "web-1")
        .await
        .unwrap();

    handler.execute(&command("add text id=t value=hi")).await.unwrap();
    let added = Message::decode(&subscription.receiver.recv().await.unwrap()).unwrap();
    assert_eq!(added.action, ADD_PAGE_CONTROLS);
    let payload: AddPageControlsPayload = added.payload_as().unwrap();
    assert_eq!(payload.controls[0].id, "t");
    assert_eq!(payload.controls[0].attr("value"), Some("hi"));

    handler.execute(&command("set t value=bye")).await.unwrap();
    let updated = Message::decode(&subscription.receiver.recv().await.unwrap()).unwrap();
    assert_eq!(updated.action, UPDATE_CONTROL_PROPS);
    let payload: ControlPropsPayload = updated.payload_as().unwrap();
    assert_eq!(payload.props[0]["i"], "t");
    assert_eq!(payload.props[0]["value"], "bye");
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread", workers = 4)]
async fn concurrent_adds_are_serialised_by_the_session_lock() {
    let (store, handler) = setup(0).await;
    let session = handler.session().clone();

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let handler = SessionHandler::new(&store, session.clone());
            tokio::spawn(async move {
                handler
                    .execute(&command(&format!("add text id=c{i}")))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let mut ids = children(&store, &session, "page").await;
    ids.sort();
    let mut expected: Vec<String> = (0..20).map(|i| format!("c{i}")).collect();
    expected.sort();
    assert_eq!(ids, expected);
}
