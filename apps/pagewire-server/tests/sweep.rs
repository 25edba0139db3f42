use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pagewire_cache::MemoryCache;
use pagewire_server::config::AppConfig;
use pagewire_server::model::Page;
use pagewire_server::protocol::{client_channel, Message, APP_BECOME_INACTIVE};
use pagewire_server::session_handler::new_session;
use pagewire_server::state::AppState;
use pagewire_server::sweep::run_once;

fn app_state() -> AppState {
    AppState::new(Arc::new(MemoryCache::new()), AppConfig::default()).unwrap()
}

async fn app_page(state: &AppState, name: &str) -> Page {
    let mut page = Page::new(name, true, "", "127.0.0.1");
    state.store.add_page(&mut page).await.unwrap();
    page
}

#[tokio::test]
async fn expired_session_is_deleted_with_its_abandoned_page() {
    let state = app_state();
    let page = app_page(&state, "acme/stale").await;
    new_session(&state.store, page.clone(), "old", "127.0.0.1", "", "", "", Duration::ZERO)
        .await
        .unwrap();

    run_once(&state).await.unwrap();

    assert!(state.store.get_session(&page, "old").await.unwrap().is_none());
    assert!(state.store.get_page_by_id(page.id).await.unwrap().is_none());
    assert!(state
        .store
        .get_page_by_name("acme/stale")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn live_sessions_and_served_pages_survive() {
    let state = app_state();
    let page = app_page(&state, "acme/busy").await;
    state.store.add_page_host_client(page.id, "host-1").await.unwrap();
    new_session(&state.store, page.clone(), "old", "127.0.0.1", "", "", "", Duration::ZERO)
        .await
        .unwrap();
    new_session(
        &state.store,
        page.clone(),
        "fresh",
        "127.0.0.1",
        "",
        "",
        "",
        Duration::from_secs(600),
    )
    .await
    .unwrap();

    run_once(&state).await.unwrap();

    assert!(state.store.get_session(&page, "old").await.unwrap().is_none());
    assert!(state.store.get_session(&page, "fresh").await.unwrap().is_some());
    assert!(state.store.get_page_by_id(page.id).await.unwrap().is_some());
}

#[tokio::test]
async fn expired_host_client_takes_its_app_down() {
    let state = app_state();
    let page = app_page(&state, "acme/app").await;
    let session = new_session(
        &state.store,
        page.clone(),
        "s1",
        "127.0.0.1",
        "",
        "",
        "",
        Duration::from_secs(600),
    )
    .await
    .unwrap();
    state.store.add_page_host_client(page.id, "host-1").await.unwrap();
    state
        .store
        .add_session_host_client(page.id, &session.id, "host-1")
        .await
        .unwrap();
    state
        .store
        .add_session_web_client(page.id, &session.id, "web-1")
        .await
        .unwrap();
    let mut web = state
        .store
        .cache()
        .subscribe(&client_channel("web-1"))
        .await
        .unwrap();

    state
        .store
        .set_client_expiration("host-1", Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();
    run_once(&state).await.unwrap();

    let notice = Message::decode(&web.receiver.recv().await.unwrap()).unwrap();
    assert_eq!(notice.action, APP_BECOME_INACTIVE);
    assert!(state.store.get_session(&page, "s1").await.unwrap().is_none());
    assert!(state.store.get_page_by_id(page.id).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_page_name_registrations_are_dropped() {
    let state = app_state();
    state
        .store
        .add_page_name_web_client("acme/soon", "web-1", Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();
    state
        .store
        .add_page_name_web_client("acme/later", "web-2", Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();

    run_once(&state).await.unwrap();

    assert!(state
        .store
        .get_page_name_web_clients("acme/soon")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        state.store.get_page_name_web_clients("acme/later").await.unwrap(),
        vec!["web-2"]
    );
}
