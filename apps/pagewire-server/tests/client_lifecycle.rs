//! Host and web clients talking to the server over in-process connections.

use std::sync::Arc;
use std::time::Duration;

use pagewire_cache::MemoryCache;
use pagewire_server::client::{serve_connection, ConnectionInfo};
use pagewire_server::config::AppConfig;
use pagewire_server::model::{Command, ZERO_SESSION};
use pagewire_server::protocol::{
    ErrorPayload, InactiveAppRequest, Message, MessagePayload, PageCommandRequest,
    PageCommandResponse, PageCommandsBatchRequest, PageCommandsBatchResponse, PageEventPayload,
    RegisterHostClientRequest, RegisterHostClientResponse, RegisterWebClientRequest,
    RegisterWebClientResponse, SessionCreatedPayload, ADD_PAGE_CONTROLS, APP_BECOME_ACTIVE,
    APP_BECOME_INACTIVE, ERROR, INACTIVE_APP_FROM_HOST, INACTIVE_APP_MESSAGE,
    PAGE_COMMANDS_BATCH_FROM_HOST, PAGE_COMMAND_FROM_HOST, PAGE_EVENT_FROM_WEB,
    PAGE_EVENT_TO_HOST, PAGE_NOT_FOUND_MESSAGE, REGISTER_HOST_CLIENT, REGISTER_WEB_CLIENT,
    SESSION_CRASHED, SESSION_CREATED, SIGNIN_REQUIRED_MESSAGE,
};
use pagewire_server::state::AppState;
use pagewire_server::transport::{Connection, LocalConnection, LocalPeer};
use tokio::task::JoinHandle;

const LOCALHOST: &str = "127.0.0.1";

fn app_state(config: AppConfig) -> AppState {
    AppState::new(Arc::new(MemoryCache::new()), config).unwrap()
}

fn connect_from(state: &AppState, client_ip: &str) -> (LocalPeer, JoinHandle<()>) {
    let (conn, peer) = LocalConnection::pair();
    let conn: Arc<dyn Connection> = Arc::new(conn);
    let info = ConnectionInfo {
        client_ip: client_ip.to_string(),
        ..ConnectionInfo::default()
    };
    let task = tokio::spawn(serve_connection(state.clone(), conn, info));
    (peer, task)
}

fn connect(state: &AppState) -> (LocalPeer, JoinHandle<()>) {
    connect_from(state, LOCALHOST)
}

async fn next(peer: &mut LocalPeer) -> Message {
    peer.recv().await.expect("connection closed")
}

async fn register_host(peer: &mut LocalPeer, page_name: &str, is_app: bool) -> RegisterHostClientResponse {
    peer.request(
        "h1",
        REGISTER_HOST_CLIENT,
        &RegisterHostClientRequest {
            page_name: page_name.to_string(),
            is_app,
            ..RegisterHostClientRequest::default()
        },
    );
    let reply = next(peer).await;
    assert_eq!(reply.id, "h1");
    reply.payload_as().unwrap()
}

async fn register_web(peer: &mut LocalPeer, page_name: &str) -> RegisterWebClientResponse {
    peer.request(
        "w1",
        REGISTER_WEB_CLIENT,
        &RegisterWebClientRequest {
            page_name: page_name.to_string(),
            ..RegisterWebClientRequest::default()
        },
    );
    let reply = next(peer).await;
    assert_eq!(reply.action, REGISTER_WEB_CLIENT);
    reply.payload_as().unwrap()
}

fn page_command(page_name: &str, session_id: &str, text: &str) -> PageCommandRequest {
    PageCommandRequest {
        page_name: page_name.to_string(),
        session_id: session_id.to_string(),
        command: Command::parse(text, true).unwrap().unwrap(),
    }
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn shared_page_round_trip() {
    let state = app_state(AppConfig::default());
    let (mut host, _host_task) = connect(&state);
    let registered = register_host(&mut host, "Acme/Board", false).await;
    assert_eq!(registered.error, "");
    assert_eq!(registered.page_name, "acme/board");
    assert_eq!(registered.session_id, "0");
    assert!(!registered.host_client_id.is_empty());

    let (mut web, web_task) = connect(&state);
    let joined = register_web(&mut web, "acme/board").await;
    assert_eq!(joined.error, "");
    let session = joined.session.expect("session");
    assert!(session.controls.contains_key("page"));
    assert_eq!(state.cipher.decrypt(&session.id, LOCALHOST).unwrap(), "0");

    let connected: PageEventPayload = next(&mut host).await.payload_as().unwrap();
    assert_eq!(connected.event_name, "connect");

    host.request(
        "2",
        PAGE_COMMAND_FROM_HOST,
        &page_command("acme/board", "0", "add text id=greeting value=hi"),
    );
    let reply = next(&mut host).await;
    assert_eq!(reply.id, "2");
    let response: PageCommandResponse = reply.payload_as().unwrap();
    assert_eq!(response.result, "greeting");
    assert_eq!(response.error, "");
    assert_eq!(next(&mut web).await.action, ADD_PAGE_CONTROLS);

    web.request(
        "",
        PAGE_EVENT_FROM_WEB,
        &PageEventPayload {
            event_target: "greeting".to_string(),
            event_name: "click".to_string(),
            event_data: "x".to_string(),
            ..PageEventPayload::default()
        },
    );
    let event = next(&mut host).await;
    assert_eq!(event.action, PAGE_EVENT_TO_HOST);
    let event: PageEventPayload = event.payload_as().unwrap();
    assert_eq!(event.page_name, "acme/board");
    assert_eq!(event.session_id, "0");
    assert_eq!(event.event_target, "greeting");

    web.close(true);
    web_task.await.unwrap();
    let disconnected: PageEventPayload = next(&mut host).await.payload_as().unwrap();
    assert_eq!(disconnected.event_name, "disconnect");

    let page = state
        .store
        .get_page_by_name("acme/board")
        .await
        .unwrap()
        .unwrap();
    assert!(state
        .store
        .get_session_web_clients(page.id, "0")
        .await
        .unwrap()
        .is_empty());
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn app_sessions_are_created_per_web_client() {
    let state = app_state(AppConfig::default());
    let (mut host, _host_task) = connect(&state);
    let registered = register_host(&mut host, "acme/app", true).await;
    assert_eq!(registered.error, "");
    assert_eq!(registered.session_id, "");

    let (mut web, _web_task) = connect(&state);
    let joined = register_web(&mut web, "acme/app").await;
    let session_id = state
        .cipher
        .decrypt(&joined.session.expect("session").id, LOCALHOST)
        .unwrap();

    let created = next(&mut host).await;
    assert_eq!(created.action, SESSION_CREATED);
    let created: SessionCreatedPayload = created.payload_as().unwrap();
    assert_eq!(created.page_name, "acme/app");
    assert_eq!(created.session_id, session_id);

    host.request(
        "3",
        PAGE_COMMANDS_BATCH_FROM_HOST,
        &PageCommandsBatchRequest {
            page_name: "acme/app".to_string(),
            session_id: session_id.clone(),
            commands: vec![
                Command::parse("add text id=t value=1", true).unwrap().unwrap(),
                Command::parse("get t value", true).unwrap().unwrap(),
            ],
        },
    );
    let response: PageCommandsBatchResponse = next(&mut host).await.payload_as().unwrap();
    assert_eq!(response.results, vec!["t", "1"]);

    host.request(
        "",
        INACTIVE_APP_FROM_HOST,
        &InactiveAppRequest {
            page_name: "acme/app".to_string(),
        },
    );
    // The batch delta arrives first.
    let mut message = next(&mut web).await;
    while message.action != APP_BECOME_INACTIVE {
        message = next(&mut web).await;
    }
    let inactive: MessagePayload = message.payload_as().unwrap();
    assert_eq!(inactive.message, INACTIVE_APP_MESSAGE);
    assert!(state
        .store
        .get_page_by_name("acme/app")
        .await
        .unwrap()
        .is_none());
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn waiting_web_client_is_woken_when_app_starts() {
    let state = app_state(AppConfig::default());
    let (mut web, _web_task) = connect(&state);
    let waiting = register_web(&mut web, "acme/later").await;
    assert_eq!(waiting.error, PAGE_NOT_FOUND_MESSAGE);
    assert!(waiting.app_inactive);
    assert!(waiting.session.is_none());

    let (mut host, _host_task) = connect(&state);
    assert_eq!(register_host(&mut host, "acme/later", true).await.error, "");

    assert_eq!(next(&mut web).await.action, APP_BECOME_ACTIVE);
    assert!(state
        .store
        .get_page_name_web_clients("acme/later")
        .await
        .unwrap()
        .is_empty());
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn error_command_crashes_the_session() {
    let state = app_state(AppConfig::default());
    let (mut host, _host_task) = connect(&state);
    register_host(&mut host, "acme/fragile", true).await;

    let (mut web, _web_task) = connect(&state);
    let joined = register_web(&mut web, "acme/fragile").await;
    let session_id = state
        .cipher
        .decrypt(&joined.session.expect("session").id, LOCALHOST)
        .unwrap();
    assert_eq!(next(&mut host).await.action, SESSION_CREATED);

    host.request(
        "4",
        PAGE_COMMAND_FROM_HOST,
        &page_command("acme/fragile", &session_id, "error boom"),
    );
    let crashed = next(&mut web).await;
    assert_eq!(crashed.action, SESSION_CRASHED);
    let crashed: MessagePayload = crashed.payload_as().unwrap();
    assert_eq!(crashed.message, "boom");

    let page = state
        .store
        .get_page_by_name("acme/fragile")
        .await
        .unwrap()
        .unwrap();
    let mut gone = false;
    for _ in 0..100 {
        if state
            .store
            .get_session(&page, &session_id)
            .await
            .unwrap()
            .is_none()
        {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gone);
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn protocol_errors_keep_the_connection_open() {
    let state = app_state(AppConfig::default());
    let (mut peer, _task) = connect(&state);

    peer.send_raw(b"{not json");
    let reply = next(&mut peer).await;
    assert_eq!(reply.action, ERROR);
    assert_eq!(reply.id, "");

    peer.request("9", "flyToTheMoon", &serde_json::json!({}));
    let reply = next(&mut peer).await;
    assert_eq!(reply.action, ERROR);
    assert_eq!(reply.id, "9");
    let error: ErrorPayload = reply.payload_as().unwrap();
    assert_eq!(error.error, "unknown action: flyToTheMoon");

    assert_eq!(register_host(&mut peer, "acme/still-here", false).await.error, "");
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn host_registration_is_validated() {
    let state = app_state(AppConfig {
        host_clients_auth_token: Some("secret".to_string()),
        reserved_account_names: Some("admin".to_string()),
        ..AppConfig::default()
    });

    let (mut remote, _remote_task) = connect_from(&state, "203.0.113.5");
    assert_eq!(
        register_host(&mut remote, "acme/x", false).await.error,
        "remote host clients are not allowed"
    );

    let (mut local, _local_task) = connect(&state);
    assert_eq!(
        register_host(&mut local, "acme/x", false).await.error,
        "invalid auth token"
    );

    local.request(
        "h1",
        REGISTER_HOST_CLIENT,
        &RegisterHostClientRequest {
            page_name: "admin/x".to_string(),
            auth_token: "secret".to_string(),
            ..RegisterHostClientRequest::default()
        },
    );
    let reserved: RegisterHostClientResponse = next(&mut local).await.payload_as().unwrap();
    assert_eq!(reserved.error, "account or page name is reserved");
    assert!(reserved.host_client_id.is_empty());
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn page_creation_is_rate_limited_per_ip() {
    let state = app_state(AppConfig {
        limit_pages_per_hour: 1,
        ..AppConfig::default()
    });
    let (mut first, _first_task) = connect(&state);
    assert_eq!(register_host(&mut first, "acme/one", false).await.error, "");

    let (mut second, _second_task) = connect(&state);
    assert_eq!(
        register_host(&mut second, "acme/two", false).await.error,
        "a limit of 1 new pages per hour has been reached"
    );
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn web_clients_cannot_send_host_commands() {
    let state = app_state(AppConfig::default());
    let (mut host, _host_task) = connect(&state);
    register_host(&mut host, "acme/board", false).await;

    let (mut web, _web_task) = connect(&state);
    register_web(&mut web, "acme/board").await;
    assert_eq!(next(&mut host).await.action, PAGE_EVENT_TO_HOST);
    web.request(
        "5",
        PAGE_COMMAND_FROM_HOST,
        &page_command("acme/board", "0", "add text id=x"),
    );
    let response: PageCommandResponse = next(&mut web).await.payload_as().unwrap();
    assert_eq!(response.error, "only host clients may send this message");

    // A host may not become a web client either.
    let joined = register_web(&mut host, "acme/board").await;
    assert!(joined.error.contains("cannot register as web"));
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn refused_host_registration_leaves_shared_page_alone() {
    let state = app_state(AppConfig::default());
    let (mut host, _host_task) = connect(&state);
    register_host(&mut host, "acme/board", false).await;

    let (mut web, _web_task) = connect(&state);
    register_web(&mut web, "acme/board").await;
    assert_eq!(next(&mut host).await.action, PAGE_EVENT_TO_HOST);

    let refused = register_host(&mut web, "acme/board", true).await;
    assert_eq!(
        refused.error,
        "client is registered as web and cannot register as host"
    );

    let page = state
        .store
        .get_page_by_name("acme/board")
        .await
        .unwrap()
        .expect("page");
    assert!(!page.is_app);
    assert!(state
        .store
        .get_session(&page, ZERO_SESSION)
        .await
        .unwrap()
        .is_some());
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn refused_web_registration_creates_no_session() {
    let state = app_state(AppConfig {
        limit_sessions_per_hour: 1,
        ..AppConfig::default()
    });
    let (mut app_host, _app_task) = connect(&state);
    register_host(&mut app_host, "acme/app", true).await;
    let (mut other_host, _other_task) = connect(&state);
    register_host(&mut other_host, "acme/board", false).await;

    let refused = register_web(&mut other_host, "acme/app").await;
    assert_eq!(
        refused.error,
        "client is registered as host and cannot register as web"
    );
    assert!(refused.session.is_none());

    // The refusal used neither a session nor the hourly allowance.
    let (mut web, _web_task) = connect(&state);
    let joined = register_web(&mut web, "acme/app").await;
    assert_eq!(joined.error, "");
    assert_eq!(next(&mut app_host).await.action, SESSION_CREATED);

    let page = state
        .store
        .get_page_by_name("acme/app")
        .await
        .unwrap()
        .expect("page");
    assert_eq!(state.store.get_page_sessions(page.id).await.unwrap().len(), 1);
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn web_client_joins_a_single_page() {
    let state = app_state(AppConfig::default());
    let (mut host, _host_task) = connect(&state);
    register_host(&mut host, "acme/board", false).await;
    register_host(&mut host, "acme/other", false).await;

    let (mut web, _web_task) = connect(&state);
    assert_eq!(register_web(&mut web, "acme/board").await.error, "");
    assert_eq!(next(&mut host).await.action, PAGE_EVENT_TO_HOST);

    let second = register_web(&mut web, "acme/other").await;
    assert_eq!(second.error, "client has already joined page acme/board");

    let other = state
        .store
        .get_page_by_name("acme/other")
        .await
        .unwrap()
        .expect("page");
    assert!(state
        .store
        .get_session_web_clients(other.id, ZERO_SESSION)
        .await
        .unwrap()
        .is_empty());
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn protected_app_requires_signin() {
    let state = app_state(AppConfig::default());
    let (mut host, _host_task) = connect(&state);
    host.request(
        "h1",
        REGISTER_HOST_CLIENT,
        &RegisterHostClientRequest {
            page_name: "acme/private".to_string(),
            is_app: true,
            permissions: "github:*".to_string(),
            ..RegisterHostClientRequest::default()
        },
    );
    let registered: RegisterHostClientResponse = next(&mut host).await.payload_as().unwrap();
    assert_eq!(registered.error, "");

    let (mut web, _web_task) = connect(&state);
    let response = register_web(&mut web, "acme/private").await;
    assert_eq!(response.error, SIGNIN_REQUIRED_MESSAGE);
    assert!(response.signin_required);
    assert!(response.session.is_none());
    assert!(response.signin_options.expect("options").github_enabled);
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn host_client_keeps_its_identity_across_reconnects() {
    let state = app_state(AppConfig::default());
    let (mut first, first_task) = connect(&state);
    let registered = register_host(&mut first, "acme/board", false).await;
    let client_id = state
        .cipher
        .decrypt(&registered.host_client_id, LOCALHOST)
        .unwrap();
    first.close(false);
    first_task.await.unwrap();

    let (mut second, _second_task) = connect(&state);
    second.request(
        "h2",
        REGISTER_HOST_CLIENT,
        &RegisterHostClientRequest {
            host_client_id: registered.host_client_id.clone(),
            page_name: "acme/board".to_string(),
            update: true,
            ..RegisterHostClientRequest::default()
        },
    );
    let again: RegisterHostClientResponse = next(&mut second).await.payload_as().unwrap();
    assert_eq!(again.error, "");
    assert_eq!(
        state.cipher.decrypt(&again.host_client_id, LOCALHOST).unwrap(),
        client_id
    );

    let page = state
        .store
        .get_page_by_name("acme/board")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        state.store.get_session_host_clients(page.id, "0").await.unwrap(),
        vec![client_id]
    );
}
