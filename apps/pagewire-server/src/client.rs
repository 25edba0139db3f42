//! One actor per connection. A client starts unregistered, becomes a host
//! or a web client on its first registration message, and from then on
//! receives asynchronous deliveries through its private pub/sub channel.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use pagewire_cache::{CacheError, SubscriptionId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{get_signin_options, SecurityError, SecurityPrincipal};
use crate::model::{CommandKind, Page, PageName, PageNameError, Session, ZERO_SESSION};
use crate::protocol::{
    client_channel, ControlPropsPayload, EmptyPayload, ErrorPayload, InactiveAppRequest, Message,
    MessagePayload, PageCommandRequest, PageCommandResponse, PageCommandsBatchRequest,
    PageCommandsBatchResponse, PageEventPayload, RegisterHostClientRequest,
    RegisterHostClientResponse, RegisterWebClientRequest, RegisterWebClientResponse,
    SessionCreatedPayload, SessionPayload, APP_BECOME_ACTIVE, APP_BECOME_INACTIVE, ERROR,
    INACTIVE_APP_FROM_HOST, INACTIVE_APP_MESSAGE, PAGE_COMMANDS_BATCH_FROM_HOST,
    PAGE_COMMAND_FROM_HOST, PAGE_EVENT_FROM_WEB, PAGE_EVENT_TO_HOST, PAGE_NOT_FOUND_MESSAGE,
    REGISTER_HOST_CLIENT, REGISTER_WEB_CLIENT, SESSION_CREATED, SIGNIN_REQUIRED_MESSAGE,
    UPDATE_CONTROL_PROPS,
};
use crate::session_handler::{new_session, CommandError, SessionHandler};
use crate::state::AppState;
use crate::store::{RateLimit, Store, StoreError};
use crate::transport::{Connection, MessageHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Web,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Web => f.write_str("web"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    PageName(#[from] PageNameError),
    #[error("client is registered as {current} and cannot register as {requested}")]
    RoleConflict { current: Role, requested: Role },
    #[error("only {0} clients may send this message")]
    RoleRequired(Role),
    #[error("client has already joined page {0}")]
    AlreadyJoined(String),
    /// A refusal shown to the peer as-is.
    #[error("{0}")]
    Denied(String),
}

impl ClientError {
    fn denied(message: impl Into<String>) -> Self {
        ClientError::Denied(message.into())
    }
}

/// What the transport knows about a peer before it says anything.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub client_ip: String,
    pub user_agent: String,
    /// Principal UID from the `pid` cookie.
    pub principal_id: Option<String>,
}

enum PageLookup {
    Active(Page),
    Inactive,
    Missing,
}

pub struct Client {
    id: Mutex<String>,
    role: Mutex<Option<Role>>,
    client_ip: String,
    principal: Mutex<Option<SecurityPrincipal>>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    pages: Mutex<HashMap<String, Page>>,
    waiting_on: Mutex<HashSet<String>>,
    subscription: Mutex<Option<SubscriptionId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    conn: Arc<dyn Connection>,
    state: AppState,
}

/// Runs a client over `conn` until the peer disconnects, then tears it down.
pub async fn serve_connection(state: AppState, conn: Arc<dyn Connection>, info: ConnectionInfo) {
    let principal = resolve_principal(&state.store, &info).await;
    let client = Client::new(state.clone(), Arc::clone(&conn), &info.client_ip, principal);
    state.stats.client_connected();
    info!(client_id = %client.id(), client_ip = %info.client_ip, "client connected");

    let clean = conn.start(&client).await;

    client.unregister(clean).await;
    state.stats.client_disconnected();
}

/// Loads the principal named by the connection's cookie, discarding it when
/// it was issued to another address or browser.
async fn resolve_principal(store: &Store, info: &ConnectionInfo) -> Option<SecurityPrincipal> {
    let principal_id = info.principal_id.as_deref().filter(|id| !id.is_empty())?;
    match store.get_security_principal(principal_id).await {
        Ok(Some(principal)) if principal.matches_client(&info.client_ip, &info.user_agent) => {
            Some(principal)
        }
        Ok(Some(_)) => {
            warn!(
                principal_id,
                client_ip = %info.client_ip,
                "principal presented from another client; discarding it"
            );
            if let Err(err) = store.delete_security_principal(principal_id).await {
                warn!(error = %err, "failed to delete principal");
            }
            None
        }
        Ok(None) => None,
        Err(err) => {
            warn!(error = %err, "failed to load principal");
            None
        }
    }
}

/// Tells web clients whose app went away that it is no longer running.
pub async fn notify_inactive_web_clients(store: &Store, client_ids: &[String]) -> Result<(), ClientError> {
    if client_ids.is_empty() {
        return Ok(());
    }
    let message = Message::broadcast(
        APP_BECOME_INACTIVE,
        &MessagePayload {
            message: INACTIVE_APP_MESSAGE.to_string(),
        },
    )?
    .to_bytes()?;
    for client_id in client_ids {
        store
            .cache()
            .publish(&client_channel(client_id), message.clone())
            .await?;
    }
    Ok(())
}

/// Drops every trace of a gone client and notifies the web clients that
/// lost their app because of it.
pub async fn delete_expired_client(
    store: &Store,
    client_id: &str,
    remove_from_index: bool,
) -> Result<(), ClientError> {
    let web_clients = store
        .delete_expired_client(client_id, remove_from_index)
        .await?;
    notify_inactive_web_clients(store, &web_clients).await
}

fn is_loopback(ip: &str) -> bool {
    matches!(ip, "" | "::1" | "127.0.0.1")
}

#[async_trait]
impl MessageHandler for Client {
    async fn on_message(&self, raw: Bytes) {
        let message = match Message::decode(&raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(client_id = %self.id(), error = %err, "undecodable message");
                self.send_error("", &ClientError::Json(err));
                return;
            }
        };
        debug!(client_id = %self.id(), action = %message.action, "message received");

        let outcome = match message.action.as_str() {
            REGISTER_WEB_CLIENT => self.register_web_client(&message).await,
            REGISTER_HOST_CLIENT => self.register_host_client(&message).await,
            PAGE_COMMAND_FROM_HOST => self.execute_command(&message).await,
            PAGE_COMMANDS_BATCH_FROM_HOST => self.execute_commands_batch(&message).await,
            PAGE_EVENT_FROM_WEB => self.page_event_from_web(&message).await,
            UPDATE_CONTROL_PROPS => self.update_control_props_from_web(&message).await,
            INACTIVE_APP_FROM_HOST => self.inactive_app_from_host(&message).await,
            other => Err(ClientError::UnknownAction(other.to_string())),
        };
        if let Err(err) = outcome {
            warn!(client_id = %self.id(), action = %message.action, error = %err, "message failed");
            self.send_error(&message.id, &err);
        }
    }
}

impl Client {
    fn new(
        state: AppState,
        conn: Arc<dyn Connection>,
        client_ip: &str,
        principal: Option<SecurityPrincipal>,
    ) -> Self {
        Self {
            id: Mutex::new(Uuid::new_v4().to_string()),
            role: Mutex::new(None),
            client_ip: client_ip.to_string(),
            principal: Mutex::new(principal),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pages: Mutex::new(HashMap::new()),
            waiting_on: Mutex::new(HashSet::new()),
            subscription: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            conn,
            state,
        }
    }

    pub fn id(&self) -> String {
        self.id.lock().clone()
    }

    pub fn role(&self) -> Option<Role> {
        *self.role.lock()
    }

    fn store(&self) -> &Store {
        &self.state.store
    }

    fn reply<P: Serialize>(&self, id: &str, action: &str, payload: &P) -> Result<(), ClientError> {
        let bytes = Message::new(id, action, payload)?.to_bytes()?;
        self.conn.send(bytes);
        Ok(())
    }

    fn send_error(&self, id: &str, err: &ClientError) {
        let payload = ErrorPayload {
            error: err.to_string(),
        };
        if let Err(err) = self.reply(id, ERROR, &payload) {
            warn!(error = %err, "failed to encode error reply");
        }
    }

    async fn publish<P: Serialize>(&self, client_id: &str, action: &str, payload: &P) -> Result<(), ClientError> {
        let bytes = Message::broadcast(action, payload)?.to_bytes()?;
        self.store()
            .cache()
            .publish(&client_channel(client_id), bytes)
            .await?;
        Ok(())
    }

    /// Fails when the client already holds the other role. Checked before
    /// any store write so a refused registration leaves no trace.
    fn require_role_compatible(&self, role: Role) -> Result<(), ClientError> {
        match self.role() {
            Some(current) if current != role => Err(ClientError::RoleConflict {
                current,
                requested: role,
            }),
            _ => Ok(()),
        }
    }

    /// Assigns the role once. Registering again in the same role is a no-op.
    async fn register(&self, role: Role) -> Result<(), ClientError> {
        self.require_role_compatible(role)?;
        if self.role().is_some() {
            return Ok(());
        }

        let id = self.id();
        info!(client_id = %id, role = %role, "registering client");
        let subscription = self
            .store()
            .cache()
            .subscribe(&client_channel(&id))
            .await?;
        *self.subscription.lock() = Some(subscription.id);
        *self.role.lock() = Some(role);

        let conn = Arc::clone(&self.conn);
        let mut receiver = subscription.receiver;
        let relay_id = id.clone();
        let relay = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                conn.send(message);
            }
            debug!(client_id = %relay_id, "relay stopped");
        });

        let state = self.state.clone();
        let sessions = Arc::clone(&self.sessions);
        let refresh = tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.config.client_refresh_interval());
            loop {
                interval.tick().await;
                if let Err(err) = refresh_expiration(&state, &id, role, &sessions).await {
                    warn!(client_id = %id, error = %err, "failed to extend expiration");
                }
            }
        });

        self.tasks.lock().extend([relay, refresh]);
        Ok(())
    }

    fn require_role(&self, role: Role) -> Result<(), ClientError> {
        if self.role() == Some(role) {
            Ok(())
        } else {
            Err(ClientError::RoleRequired(role))
        }
    }

    async fn register_session(&self, session: &Session) -> Result<(), ClientError> {
        let id = self.id();
        let role = self.role();
        debug!(client_id = %id, page = %session.page.name, session_id = %session.id, "joining session");
        match role {
            Some(Role::Web) => {
                self.store()
                    .add_session_web_client(session.page.id, &session.id, &id)
                    .await?
            }
            _ => {
                self.store()
                    .add_session_host_client(session.page.id, &session.id, &id)
                    .await?
            }
        }
        self.sessions
            .lock()
            .insert(session.full_id(), session.clone());
        SessionHandler::new(self.store(), session.clone())
            .extend_expiration(self.state.session_lifetime(&session.id))
            .await?;
        Ok(())
    }

    /// The session a web client is attached to. A web connection joins at
    /// most one session, see `register_web_client_core`.
    fn web_session(&self) -> Option<Session> {
        if self.role() != Some(Role::Web) {
            return None;
        }
        self.sessions.lock().values().next().cloned()
    }

    // Host registration

    async fn register_host_client(&self, message: &Message) -> Result<(), ClientError> {
        let request: RegisterHostClientRequest = message.payload_as()?;

        if !request.host_client_id.is_empty() && self.role().is_none() {
            match self
                .state
                .cipher
                .decrypt(&request.host_client_id, &self.client_ip)
            {
                Ok(previous) if previous != self.id() => {
                    info!(client_id = %previous, "host client resumes its previous identity");
                    *self.id.lock() = previous;
                }
                Ok(_) => {}
                Err(err) => warn!(client_ip = %self.client_ip, error = %err, "discarding host client id"),
            }
        }

        let mut response = RegisterHostClientResponse::default();
        match self.register_host_client_core(&request, &mut response).await {
            Ok(()) => match self.state.cipher.encrypt(&self.id(), &self.client_ip) {
                Ok(sealed) => response.host_client_id = sealed,
                Err(err) => warn!(error = %err, "failed to seal host client id"),
            },
            Err(err) => {
                info!(client_id = %self.id(), page = %request.page_name, error = %err, "host registration refused");
                response.error = err.to_string();
            }
        }
        self.reply(&message.id, "", &response)
    }

    async fn register_host_client_core(
        &self,
        request: &RegisterHostClientRequest,
        response: &mut RegisterHostClientResponse,
    ) -> Result<(), ClientError> {
        self.require_role_compatible(Role::Host)?;
        let config = &self.state.config;
        if !config.allow_remote_host_clients && !is_loopback(&self.client_ip) {
            return Err(ClientError::denied("remote host clients are not allowed"));
        }
        if let Some(token) = &config.host_clients_auth_token {
            if *token != request.auth_token {
                return Err(ClientError::denied("invalid auth token"));
            }
        }

        let page_name = PageName::parse(&request.page_name)?;
        response.page_name = page_name.to_string();

        let mut page = match self.store().get_page_by_name(&response.page_name).await? {
            Some(page) => page,
            None => {
                if page_name.is_reserved(&config.reserved_accounts(), &config.reserved_pages()) {
                    return Err(ClientError::denied("account or page name is reserved"));
                }
                if !self
                    .store()
                    .check_rate_limit(RateLimit::Pages, &self.client_ip, config.limit_pages_per_hour)
                    .await?
                {
                    return Err(ClientError::denied(format!(
                        "a limit of {} new pages per hour has been reached",
                        config.limit_pages_per_hour
                    )));
                }
                let mut page = Page::new(
                    &response.page_name,
                    request.is_app,
                    &request.permissions,
                    &self.client_ip,
                );
                self.store().add_page(&mut page).await?;
                page
            }
        };

        if config.check_page_ip && page.client_ip != self.client_ip {
            return Err(ClientError::denied("page name is already taken"));
        }

        if page.permissions != request.permissions {
            page.permissions = request.permissions.clone();
            self.store().update_page(&page).await?;
        }

        if !page.is_app && request.is_app {
            info!(page = %page.name, "converting shared page to an app");
            page.is_app = true;
            self.store().update_page(&page).await?;
            self.store().delete_session(page.id, ZERO_SESSION).await?;
        }

        self.register(Role::Host).await?;

        if page.is_app {
            self.register_page(page).await?;
            return Ok(());
        }

        let session = match self.store().get_session(&page, ZERO_SESSION).await? {
            Some(session) => {
                if !request.update {
                    SessionHandler::new(self.store(), session.clone())
                        .clean_page()
                        .await?;
                }
                session
            }
            None => {
                new_session(
                    self.store(),
                    page,
                    ZERO_SESSION,
                    &self.client_ip,
                    "",
                    "",
                    "",
                    self.state.config.page_lifetime(),
                )
                .await?
            }
        };
        self.register_session(&session).await?;
        response.session_id = session.id;
        Ok(())
    }

    /// Makes this host one of the app's servers and wakes web clients that
    /// were waiting for the app to come up.
    async fn register_page(&self, page: Page) -> Result<(), ClientError> {
        let id = self.id();
        info!(client_id = %id, page = %page.name, "host client serves app");
        self.store().add_page_host_client(page.id, &id).await?;

        let waiting = self.store().get_page_name_web_clients(&page.name).await?;
        for client_id in &waiting {
            self.publish(client_id, APP_BECOME_ACTIVE, &EmptyPayload {})
                .await?;
        }
        if !waiting.is_empty() {
            self.store()
                .remove_page_name_registration(&page.name)
                .await?;
        }
        self.pages.lock().insert(page.name.clone(), page);
        Ok(())
    }

    // Web registration

    async fn register_web_client(&self, message: &Message) -> Result<(), ClientError> {
        let request: RegisterWebClientRequest = message.payload_as()?;
        let mut response = RegisterWebClientResponse::default();

        let joined = match self.register_web_client_core(&request, &mut response).await {
            Ok(joined) => joined,
            Err(err) => {
                info!(client_id = %self.id(), page = %request.page_name, error = %err, "web registration failed");
                response.error = err.to_string();
                None
            }
        };
        self.reply(&message.id, REGISTER_WEB_CLIENT, &response)?;

        if let Some((session, created)) = joined {
            if !created {
                SessionHandler::new(self.store(), session)
                    .send_page_event("connect", "")
                    .await?;
            }
        }
        Ok(())
    }

    async fn lookup_page(&self, page_name: &str) -> Result<PageLookup, ClientError> {
        let Some(page) = self.store().get_page_by_name(page_name).await? else {
            return Ok(PageLookup::Missing);
        };
        if page.is_app && self.store().get_page_host_clients(page.id).await?.is_empty() {
            return Ok(PageLookup::Inactive);
        }
        Ok(PageLookup::Active(page))
    }

    /// Returns the joined session and whether it was created for this
    /// client, or `None` when `response` already explains the refusal.
    async fn register_web_client_core(
        &self,
        request: &RegisterWebClientRequest,
        response: &mut RegisterWebClientResponse,
    ) -> Result<Option<(Session, bool)>, ClientError> {
        self.require_role_compatible(Role::Web)?;
        if let Some(joined) = self.web_session() {
            return Err(ClientError::AlreadyJoined(joined.page.name));
        }
        let page_name = PageName::parse(&request.page_name)?.to_string();

        let mut lookup = self.lookup_page(&page_name).await?;
        if !matches!(lookup, PageLookup::Active(_)) {
            if let Some(fallback) = self.state.config.fallback_page_name.as_deref() {
                if fallback != page_name {
                    if let PageLookup::Active(page) = self.lookup_page(fallback).await? {
                        debug!(page = %page_name, fallback, "using fallback page");
                        lookup = PageLookup::Active(page);
                    }
                }
            }
        }

        let page = match lookup {
            PageLookup::Active(page) => page,
            PageLookup::Inactive => {
                response.error = INACTIVE_APP_MESSAGE.to_string();
                response.app_inactive = true;
                self.wait_on_page_name(&page_name).await?;
                return Ok(None);
            }
            PageLookup::Missing => {
                response.error = PAGE_NOT_FOUND_MESSAGE.to_string();
                response.app_inactive = true;
                self.wait_on_page_name(&page_name).await?;
                return Ok(None);
            }
        };

        let (session, created) = if page.is_app {
            let existing = if request.session_id.is_empty() {
                None
            } else {
                match self
                    .state
                    .cipher
                    .decrypt(&request.session_id, &self.client_ip)
                {
                    Ok(session_id) => self.store().get_session(&page, &session_id).await?,
                    Err(err) => {
                        warn!(client_ip = %self.client_ip, error = %err, "discarding session id");
                        None
                    }
                }
            };

            match existing {
                Some(mut session) => {
                    debug!(page = %page.name, session_id = %session.id, "resuming session");
                    self.update_session_principal(&mut session).await?;
                    if self.require_signin(&page, response) {
                        return Ok(None);
                    }
                    (session, false)
                }
                None => {
                    if !self
                        .store()
                        .check_rate_limit(
                            RateLimit::Sessions,
                            &self.client_ip,
                            self.state.config.limit_sessions_per_hour,
                        )
                        .await?
                    {
                        return Err(ClientError::denied(format!(
                            "A limit of {} new sessions per hour has been reached",
                            self.state.config.limit_sessions_per_hour
                        )));
                    }
                    if self.require_signin(&page, response) {
                        return Ok(None);
                    }
                    let session = new_session(
                        self.store(),
                        page.clone(),
                        &Uuid::new_v4().to_string(),
                        &self.client_ip,
                        &request.page_hash,
                        &request.win_width,
                        &request.win_height,
                        self.state.config.app_lifetime(),
                    )
                    .await?;
                    (session, true)
                }
            }
        } else {
            if self.require_signin(&page, response) {
                return Ok(None);
            }
            let session = match self.store().get_session(&page, ZERO_SESSION).await? {
                Some(session) => session,
                None => {
                    new_session(
                        self.store(),
                        page.clone(),
                        ZERO_SESSION,
                        &self.client_ip,
                        &request.page_hash,
                        &request.win_width,
                        &request.win_height,
                        self.state.config.page_lifetime(),
                    )
                    .await?
                }
            };
            (session, false)
        };

        self.register(Role::Web).await?;
        self.register_session(&session).await?;

        let mut session = session;
        if created {
            // First available host for now; there is no load distribution yet.
            let hosts = self.store().get_page_host_clients(page.id).await?;
            if let Some(host) = hosts.first() {
                self.store()
                    .add_session_host_client(page.id, &session.id, host)
                    .await?;
                self.publish(
                    host,
                    SESSION_CREATED,
                    &SessionCreatedPayload {
                        page_name: page.name.clone(),
                        session_id: session.id.clone(),
                    },
                )
                .await?;
            }
            info!(page = %page.name, session_id = %session.id, "session started");
            self.update_session_principal(&mut session).await?;
        }

        response.session = Some(SessionPayload {
            id: self.state.cipher.encrypt(&session.id, &self.client_ip)?,
            controls: self.store().get_all_session_controls(&session).await?,
        });
        Ok(Some((session, created)))
    }

    async fn wait_on_page_name(&self, page_name: &str) -> Result<(), ClientError> {
        self.register(Role::Web).await?;
        let expires = Utc::now()
            + chrono::Duration::seconds(self.state.config.app_lifetime().as_secs() as i64);
        self.store()
            .add_page_name_web_client(page_name, &self.id(), expires)
            .await?;
        self.waiting_on.lock().insert(page_name.to_string());
        Ok(())
    }

    fn require_signin(&self, page: &Page, response: &mut RegisterWebClientResponse) -> bool {
        if page.permissions.is_empty() {
            return false;
        }
        let allowed = self
            .principal
            .lock()
            .as_ref()
            .map_or(false, |p| p.has_permissions(&page.permissions));
        if allowed {
            return false;
        }
        debug!(page = %page.name, permissions = %page.permissions, "sign-in required");
        response.error = SIGNIN_REQUIRED_MESSAGE.to_string();
        response.signin_required = true;
        response.signin_options = Some(get_signin_options(&page.permissions));
        true
    }

    /// Binds the connection's principal to `session`, publishing the user
    /// attributes on the root control and a signin/signout event to hosts.
    async fn update_session_principal(&self, session: &mut Session) -> Result<(), ClientError> {
        let principal = self.principal.lock().clone();
        let principal_id = principal
            .as_ref()
            .map(|p| p.uid.clone())
            .unwrap_or_default();
        if session.principal_id == principal_id {
            return Ok(());
        }
        debug!(page = %session.page.name, session_id = %session.id, "updating session principal");

        let mut props = BTreeMap::new();
        props.insert("i".to_string(), "page".to_string());
        props.insert("signin".to_string(), String::new());
        for (name, value) in SecurityPrincipal::user_props(principal.as_ref()) {
            props.insert(name.to_string(), value);
        }

        let handler = SessionHandler::new(self.store(), session.clone());
        handler.update_control_props(std::slice::from_ref(&props)).await?;
        self.store()
            .set_session_principal_id(session, &principal_id)
            .await?;

        let event = if principal_id.is_empty() {
            "signout"
        } else {
            "signin"
        };
        let change = serde_json::to_string(&[&props])?;
        handler.send_page_event("change", &change).await?;
        handler.send_page_event(event, "").await?;
        Ok(())
    }

    // Host commands

    async fn find_session(&self, page_name: &str, session_id: &str) -> Result<Session, ClientError> {
        let page = self
            .store()
            .get_page_by_name(page_name)
            .await?
            .ok_or_else(|| ClientError::denied("Page not found or access denied"))?;
        self.store()
            .get_session(&page, session_id)
            .await?
            .ok_or_else(|| ClientError::denied("Session not found or access denied"))
    }

    async fn execute_command(&self, message: &Message) -> Result<(), ClientError> {
        let request: PageCommandRequest = message.payload_as()?;
        let mut response = PageCommandResponse::default();

        if !request.command.is_supported() {
            response.error = format!("unknown command: {}", request.command.name);
            return self.reply(&message.id, "", &response);
        }

        match self.execute_command_core(&request).await {
            Ok(result) => response.result = result,
            Err(err) => response.error = err.to_string(),
        }
        if request.command.should_return() {
            self.reply(&message.id, "", &response)?;
        }
        Ok(())
    }

    async fn execute_command_core(&self, request: &PageCommandRequest) -> Result<String, ClientError> {
        self.require_role(Role::Host)?;
        let session = self
            .find_session(&request.page_name, &request.session_id)
            .await?;
        let lifetime = self.state.session_lifetime(&session.id);
        let handler = SessionHandler::new(self.store(), session);
        let result = handler.execute(&request.command).await?;

        let session = handler.session();
        if request.command.kind() == Some(CommandKind::Error) {
            info!(page = %session.page.name, session_id = %session.id, "session crashed on host; deleting it");
            self.sessions.lock().remove(&session.full_id());
            self.store()
                .delete_session(session.page.id, &session.id)
                .await?;
        } else {
            handler.extend_expiration(lifetime).await?;
        }
        Ok(result)
    }

    async fn execute_commands_batch(&self, message: &Message) -> Result<(), ClientError> {
        let request: PageCommandsBatchRequest = message.payload_as()?;
        let mut response = PageCommandsBatchResponse::default();

        if let Some(unknown) = request.commands.iter().find(|c| !c.is_supported()) {
            response.error = format!("unknown command: {}", unknown.name);
            return self.reply(&message.id, "", &response);
        }

        match self.execute_commands_batch_core(&request).await {
            Ok(results) => response.results = results,
            Err(err) => response.error = err.to_string(),
        }
        self.reply(&message.id, "", &response)
    }

    async fn execute_commands_batch_core(
        &self,
        request: &PageCommandsBatchRequest,
    ) -> Result<Vec<String>, ClientError> {
        self.require_role(Role::Host)?;
        let session = self
            .find_session(&request.page_name, &request.session_id)
            .await?;
        let lifetime = self.state.session_lifetime(&session.id);
        let handler = SessionHandler::new(self.store(), session);
        let results = handler.execute_batch(&request.commands).await?;
        handler.extend_expiration(lifetime).await?;
        Ok(results)
    }

    // Web events

    async fn page_event_from_web(&self, message: &Message) -> Result<(), ClientError> {
        let Some(session) = self.web_session() else {
            return Ok(());
        };
        let mut event: PageEventPayload = message.payload_as()?;
        event.page_name = session.page.name.clone();
        event.session_id = session.id.clone();
        debug!(page = %event.page_name, session_id = %event.session_id, event = %event.event_name, "page event from web");

        for host in self
            .store()
            .get_session_host_clients(session.page.id, &session.id)
            .await?
        {
            self.publish(&host, PAGE_EVENT_TO_HOST, &event).await?;
        }
        Ok(())
    }

    async fn update_control_props_from_web(&self, message: &Message) -> Result<(), ClientError> {
        let Some(session) = self.web_session() else {
            return Ok(());
        };
        let payload: ControlPropsPayload = message.payload_as()?;

        let handler = SessionHandler::new(self.store(), session);
        handler.update_control_props(&payload.props).await?;
        handler
            .send_page_event("change", &serde_json::to_string(&payload.props)?)
            .await?;

        let session = handler.session();
        let relayed = Message::broadcast(UPDATE_CONTROL_PROPS, &payload)?.to_bytes()?;
        let own_id = self.id();
        for web_client in self
            .store()
            .get_session_web_clients(session.page.id, &session.id)
            .await?
        {
            if web_client != own_id {
                self.store()
                    .cache()
                    .publish(&client_channel(&web_client), relayed.clone())
                    .await?;
            }
        }
        Ok(())
    }

    // Host lifecycle

    async fn inactive_app_from_host(&self, message: &Message) -> Result<(), ClientError> {
        let request: InactiveAppRequest = message.payload_as()?;
        let page = self.pages.lock().remove(&request.page_name);
        let Some(page) = page else {
            return Ok(());
        };
        let id = self.id();
        info!(client_id = %id, page = %page.name, "app went inactive");
        self.store().remove_page_host_client(page.id, &id).await?;

        let mut web_clients = Vec::new();
        for session_id in self
            .store()
            .get_page_host_client_sessions(page.id, &id)
            .await?
        {
            self.store()
                .remove_session_host_client(page.id, &session_id, &id)
                .await?;
            for web_client in self
                .store()
                .get_session_web_clients(page.id, &session_id)
                .await?
            {
                self.store()
                    .remove_session_web_client(page.id, &session_id, &web_client)
                    .await?;
                web_clients.push(web_client);
            }
            self.sessions
                .lock()
                .remove(&crate::model::full_session_id(page.id, &session_id));
            self.store().delete_session(page.id, &session_id).await?;
        }
        self.store()
            .remove_page_host_client_sessions(page.id, &id)
            .await?;
        if self.store().get_page_host_clients(page.id).await?.is_empty() {
            self.store().delete_page(page.id).await?;
        }
        notify_inactive_web_clients(self.store(), &web_clients).await
    }

    async fn unregister(&self, clean: bool) {
        let id = self.id();
        debug!(client_id = %id, clean, "client disconnected");
        let Some(role) = self.role() else {
            return;
        };
        info!(client_id = %id, role = %role, sessions = self.sessions.lock().len(), "unregistering client");

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(err) = self.teardown(&id, role, clean).await {
            warn!(client_id = %id, error = %err, "client teardown incomplete; sweep will finish it");
        }
    }

    async fn teardown(&self, id: &str, role: Role, clean: bool) -> Result<(), ClientError> {
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            self.store().cache().unsubscribe(subscription).await?;
        }

        let sessions: Vec<Session> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            match role {
                Role::Web => {
                    self.store()
                        .remove_session_web_client(session.page.id, &session.id, id)
                        .await?;
                    SessionHandler::new(self.store(), session)
                        .send_page_event("disconnect", "")
                        .await?;
                }
                Role::Host => {
                    self.store()
                        .remove_session_host_client(session.page.id, &session.id, id)
                        .await?;
                }
            }
        }

        let pages: Vec<Page> = self.pages.lock().drain().map(|(_, p)| p).collect();
        for page in pages {
            debug!(client_id = %id, page = %page.name, "host client leaves app");
            self.store().remove_page_host_client(page.id, id).await?;
        }

        let waiting: Vec<String> = self.waiting_on.lock().drain().collect();
        for page_name in waiting {
            self.store()
                .remove_page_name_web_client(&page_name, id)
                .await?;
        }

        if clean {
            delete_expired_client(self.store(), id, true).await?;
        }
        Ok(())
    }
}

async fn refresh_expiration(
    state: &AppState,
    client_id: &str,
    role: Role,
    sessions: &Mutex<HashMap<String, Session>>,
) -> Result<(), ClientError> {
    let expires =
        Utc::now() + chrono::Duration::seconds(state.config.client_expiration().as_secs() as i64);
    state
        .store
        .set_client_expiration(client_id, expires)
        .await?;
    if role == Role::Web {
        let sessions: Vec<Session> = sessions.lock().values().cloned().collect();
        for session in sessions {
            let lifetime = state.session_lifetime(&session.id);
            SessionHandler::new(&state.store, session)
                .extend_expiration(lifetime)
                .await?;
        }
    }
    Ok(())
}
