//! Domain layer over the cache: pages, sessions, clients and the index sets
//! tying them together.
//!
//! Key layout:
//!
//! | key | kind | holds |
//! |---|---|---|
//! | `page_next_id` | counter | next page ID |
//! | `pages` | hash | page name -> page ID |
//! | `page:{pid}` | string | page JSON |
//! | `page:{pid}:host_clients` | set | host client IDs serving the page |
//! | `page:{pid}:sessions` | set | session IDs |
//! | `page:{pid}:{client}:host_client_sessions` | set | sessions owned by one host client |
//! | `page_name:{name}:web_clients` | set | web clients waiting on a page name |
//! | `session:{pid}:{sid}` | hash | session record, control counter and size |
//! | `session:{pid}:{sid}:controls` | hash | control ID -> control JSON |
//! | `session:{pid}:{sid}:host_clients` | set | host client IDs |
//! | `session:{pid}:{sid}:web_clients` | set | web client IDs |
//! | `client:{id}:sessions` | set | `pid:sid` the client takes part in |
//! | `principal:{uid}` | string | principal JSON |
//!
//! Expirations live in the `sessions_expired`, `clients_expired` and
//! `page_name_registrations_expired` sorted sets, scored by unix seconds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pagewire_cache::{Cache, CacheError, CacheExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::SecurityPrincipal;
use crate::model::{full_session_id, parse_full_session_id, Control, Page, Session};

const PAGE_NEXT_ID_KEY: &str = "page_next_id";
const PAGES_KEY: &str = "pages";
const PAGE_NAME_REGISTRATIONS_EXPIRED_KEY: &str = "page_name_registrations_expired";
const SESSIONS_EXPIRED_KEY: &str = "sessions_expired";
const CLIENTS_EXPIRED_KEY: &str = "clients_expired";
const SESSION_NEXT_CONTROL_ID_FIELD: &str = "nextControlID";
const SESSION_PRINCIPAL_ID_FIELD: &str = "principalID";

pub const PRINCIPAL_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60 * 60);

fn page_key(page_id: i64) -> String {
    format!("page:{page_id}")
}

fn page_host_clients_key(page_id: i64) -> String {
    format!("page:{page_id}:host_clients")
}

fn page_sessions_key(page_id: i64) -> String {
    format!("page:{page_id}:sessions")
}

fn page_host_client_sessions_key(page_id: i64, client_id: &str) -> String {
    format!("page:{page_id}:{client_id}:host_client_sessions")
}

fn page_name_web_clients_key(page_name: &str) -> String {
    format!("page_name:{page_name}:web_clients")
}

fn session_key(page_id: i64, session_id: &str) -> String {
    format!("session:{page_id}:{session_id}")
}

fn session_controls_key(page_id: i64, session_id: &str) -> String {
    format!("session:{page_id}:{session_id}:controls")
}

fn session_host_clients_key(page_id: i64, session_id: &str) -> String {
    format!("session:{page_id}:{session_id}:host_clients")
}

fn session_web_clients_key(page_id: i64, session_id: &str) -> String {
    format!("session:{page_id}:{session_id}:web_clients")
}

fn client_sessions_key(client_id: &str) -> String {
    format!("client:{client_id}:sessions")
}

fn principal_key(uid: &str) -> String {
    format!("principal:{uid}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("invalid stored json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session {session} size exceeds the maximum of {limit} bytes")]
    SessionSizeExceeded { session: String, limit: usize },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Deserialize)]
struct StoredSession {
    #[serde(default)]
    id: String,
    #[serde(rename = "clientIP", default)]
    client_ip: String,
    #[serde(rename = "principalID", default)]
    principal_id: String,
}

/// Cheap to clone; every clone talks to the same cache.
#[derive(Clone)]
pub struct Store {
    cache: Arc<dyn Cache>,
    session_size_limit: usize,
}

impl Store {
    pub fn new(cache: Arc<dyn Cache>, session_size_limit: usize) -> Self {
        Self {
            cache,
            session_size_limit,
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    // Pages

    pub async fn get_page_by_name(&self, page_name: &str) -> StoreResult<Option<Page>> {
        let Some(raw_id) = self.cache.hash_get(PAGES_KEY, page_name).await? else {
            return Ok(None);
        };
        match raw_id.parse::<i64>() {
            Ok(page_id) => self.get_page_by_id(page_id).await,
            Err(_) => {
                warn!(page = page_name, raw_id, "page index holds a non-numeric id");
                Ok(None)
            }
        }
    }

    pub async fn get_page_by_id(&self, page_id: i64) -> StoreResult<Option<Page>> {
        match self.cache.get_string(&page_key(page_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Assigns the next page ID to `page` and indexes it by name.
    pub async fn add_page(&self, page: &mut Page) -> StoreResult<()> {
        page.id = self.cache.increment(PAGE_NEXT_ID_KEY, 1, None).await?;
        self.cache
            .set_string(&page_key(page.id), &serde_json::to_string(page)?, None)
            .await?;
        self.cache
            .hash_set(PAGES_KEY, &[(page.name.as_str(), page.id.to_string().as_str())])
            .await?;
        info!(page = %page.name, page_id = page.id, "page created");
        Ok(())
    }

    pub async fn update_page(&self, page: &Page) -> StoreResult<()> {
        self.cache
            .set_string(&page_key(page.id), &serde_json::to_string(page)?, None)
            .await?;
        Ok(())
    }

    /// Deletes a page and every one of its sessions. Missing pages are ignored.
    pub async fn delete_page(&self, page_id: i64) -> StoreResult<()> {
        let Some(page) = self.get_page_by_id(page_id).await? else {
            warn!(page_id, "attempt to delete a page that does not exist");
            return Ok(());
        };
        info!(page = %page.name, page_id, "deleting page");
        for session_id in self.get_page_sessions(page_id).await? {
            self.delete_session(page_id, &session_id).await?;
        }
        self.cache
            .remove(&[page_host_clients_key(page_id), page_key(page_id)])
            .await?;
        self.cache
            .hash_remove(PAGES_KEY, &[page.name.as_str()])
            .await?;
        Ok(())
    }

    pub async fn get_page_sessions(&self, page_id: i64) -> StoreResult<Vec<String>> {
        Ok(self.cache.set_members(&page_sessions_key(page_id)).await?)
    }

    pub async fn get_page_host_clients(&self, page_id: i64) -> StoreResult<Vec<String>> {
        Ok(self.cache.set_members(&page_host_clients_key(page_id)).await?)
    }

    pub async fn add_page_host_client(&self, page_id: i64, client_id: &str) -> StoreResult<()> {
        self.cache
            .set_add(&page_host_clients_key(page_id), client_id)
            .await?;
        Ok(())
    }

    pub async fn remove_page_host_client(&self, page_id: i64, client_id: &str) -> StoreResult<()> {
        self.cache
            .set_remove(&page_host_clients_key(page_id), client_id)
            .await?;
        Ok(())
    }

    // Web clients waiting for a page name to come online

    pub async fn get_page_name_web_clients(&self, page_name: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .cache
            .set_members(&page_name_web_clients_key(page_name))
            .await?)
    }

    pub async fn add_page_name_web_client(
        &self,
        page_name: &str,
        client_id: &str,
        expires: DateTime<Utc>,
    ) -> StoreResult<()> {
        debug!(client_id, page = page_name, "web client waiting on page name");
        self.cache
            .set_add(&page_name_web_clients_key(page_name), client_id)
            .await?;
        self.cache
            .sorted_set_add(
                PAGE_NAME_REGISTRATIONS_EXPIRED_KEY,
                page_name,
                expires.timestamp(),
            )
            .await?;
        Ok(())
    }

    pub async fn remove_page_name_web_client(
        &self,
        page_name: &str,
        client_id: &str,
    ) -> StoreResult<()> {
        debug!(client_id, page = page_name, "web client stopped waiting on page name");
        self.cache
            .set_remove(&page_name_web_clients_key(page_name), client_id)
            .await?;
        Ok(())
    }

    pub async fn get_expired_page_name_registrations(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .cache
            .sorted_set_pop_range(PAGE_NAME_REGISTRATIONS_EXPIRED_KEY, 0, Utc::now().timestamp())
            .await?)
    }

    pub async fn remove_page_name_registration(&self, page_name: &str) -> StoreResult<()> {
        self.cache
            .remove(&[page_name_web_clients_key(page_name)])
            .await?;
        Ok(())
    }

    // Clients

    pub async fn set_client_expiration(
        &self,
        client_id: &str,
        expires: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.cache
            .sorted_set_add(CLIENTS_EXPIRED_KEY, client_id, expires.timestamp())
            .await?;
        Ok(())
    }

    pub async fn get_expired_clients(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .cache
            .sorted_set_pop_range(CLIENTS_EXPIRED_KEY, 0, Utc::now().timestamp())
            .await?)
    }

    pub async fn get_client_sessions(&self, client_id: &str) -> StoreResult<Vec<String>> {
        Ok(self.cache.set_members(&client_sessions_key(client_id)).await?)
    }

    /// Detaches a gone client from everything it took part in. For app pages
    /// the sessions it served are deleted too, and the page with them once no
    /// host is left. Returns the web clients that lost their session.
    pub async fn delete_expired_client(
        &self,
        client_id: &str,
        remove_from_index: bool,
    ) -> StoreResult<Vec<String>> {
        if remove_from_index {
            self.cache
                .sorted_set_remove(CLIENTS_EXPIRED_KEY, client_id)
                .await?;
        }
        let mut web_clients = Vec::new();
        for full_id in self.get_client_sessions(client_id).await? {
            let Some((page_id, session_id)) = parse_full_session_id(&full_id) else {
                warn!(client_id, full_id, "malformed session reference");
                continue;
            };
            self.cache
                .set_remove(&session_host_clients_key(page_id, &session_id), client_id)
                .await?;
            self.cache
                .set_remove(&session_web_clients_key(page_id, &session_id), client_id)
                .await?;
            self.cache
                .set_remove(&page_host_clients_key(page_id), client_id)
                .await?;

            let Some(page) = self.get_page_by_id(page_id).await? else {
                continue;
            };
            if !page.is_app {
                continue;
            }
            for owned in self.get_page_host_client_sessions(page_id, client_id).await? {
                self.remove_session_host_client(page_id, &owned, client_id)
                    .await?;
                for web_client in self.get_session_web_clients(page_id, &owned).await? {
                    self.remove_session_web_client(page_id, &owned, &web_client)
                        .await?;
                    web_clients.push(web_client);
                }
                self.delete_session(page_id, &owned).await?;
            }
            self.remove_page_host_client_sessions(page_id, client_id)
                .await?;
            if self.get_page_host_clients(page_id).await?.is_empty() {
                self.delete_page(page_id).await?;
            }
        }
        self.cache.remove(&[client_sessions_key(client_id)]).await?;
        Ok(web_clients)
    }

    // Sessions

    pub async fn get_session(&self, page: &Page, session_id: &str) -> StoreResult<Option<Session>> {
        let stored: Option<StoredSession> = self
            .cache
            .hash_scan(&session_key(page.id, session_id))
            .await?;
        Ok(stored.filter(|s| !s.id.is_empty()).map(|s| Session {
            page: page.clone(),
            id: s.id,
            client_ip: s.client_ip,
            principal_id: s.principal_id,
        }))
    }

    pub async fn add_session(&self, session: &Session) -> StoreResult<()> {
        self.cache
            .hash_set(
                &session_key(session.page.id, &session.id),
                &[
                    ("id", session.id.as_str()),
                    ("clientIP", session.client_ip.as_str()),
                    (SESSION_PRINCIPAL_ID_FIELD, session.principal_id.as_str()),
                ],
            )
            .await?;
        self.cache
            .set_add(&page_sessions_key(session.page.id), &session.id)
            .await?;
        Ok(())
    }

    pub async fn set_session_expiration(
        &self,
        session: &Session,
        expires: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.cache
            .sorted_set_add(SESSIONS_EXPIRED_KEY, &session.full_id(), expires.timestamp())
            .await?;
        Ok(())
    }

    pub async fn get_expired_sessions(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .cache
            .sorted_set_pop_range(SESSIONS_EXPIRED_KEY, 0, Utc::now().timestamp())
            .await?)
    }

    pub async fn set_session_principal_id(
        &self,
        session: &mut Session,
        principal_id: &str,
    ) -> StoreResult<()> {
        session.principal_id = principal_id.to_string();
        self.cache
            .hash_set(
                &session_key(session.page.id, &session.id),
                &[(SESSION_PRINCIPAL_ID_FIELD, principal_id)],
            )
            .await?;
        Ok(())
    }

    /// Removes a session from every index it appears in.
    pub async fn delete_session(&self, page_id: i64, session_id: &str) -> StoreResult<()> {
        let full_id = full_session_id(page_id, session_id);
        for host_client in self.get_session_host_clients(page_id, session_id).await? {
            self.cache
                .set_remove(&client_sessions_key(&host_client), &full_id)
                .await?;
            self.cache
                .set_remove(
                    &page_host_client_sessions_key(page_id, &host_client),
                    session_id,
                )
                .await?;
        }
        for web_client in self.get_session_web_clients(page_id, session_id).await? {
            self.cache
                .set_remove(&client_sessions_key(&web_client), &full_id)
                .await?;
        }
        self.cache
            .set_remove(&page_sessions_key(page_id), session_id)
            .await?;
        self.cache
            .sorted_set_remove(SESSIONS_EXPIRED_KEY, &full_id)
            .await?;
        self.cache
            .remove(&[
                session_key(page_id, session_id),
                session_controls_key(page_id, session_id),
                session_host_clients_key(page_id, session_id),
                session_web_clients_key(page_id, session_id),
            ])
            .await?;
        debug!(session = %full_id, "session deleted");
        Ok(())
    }

    // Controls

    pub async fn next_control_id(&self, session: &Session) -> StoreResult<i64> {
        Ok(self
            .cache
            .hash_increment(
                &session_key(session.page.id, &session.id),
                SESSION_NEXT_CONTROL_ID_FIELD,
                1,
            )
            .await?)
    }

    pub async fn get_session_control(
        &self,
        session: &Session,
        control_id: &str,
    ) -> StoreResult<Option<Control>> {
        let raw = self
            .cache
            .hash_get(&session_controls_key(session.page.id, &session.id), control_id)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all_session_controls(
        &self,
        session: &Session,
    ) -> StoreResult<HashMap<String, Control>> {
        let fields = self
            .cache
            .hash_get_all(&session_controls_key(session.page.id, &session.id))
            .await?;
        let mut controls = HashMap::with_capacity(fields.len());
        for (id, json) in fields {
            match serde_json::from_str::<Control>(&json) {
                Ok(control) => {
                    controls.insert(id, control);
                }
                Err(err) => warn!(control_id = %id, error = %err, "skipping unreadable control"),
            }
        }
        Ok(controls)
    }

    /// Writes a control, failing without side effects when the session would
    /// outgrow the configured size limit.
    pub async fn set_session_control(&self, session: &Session, control: &Control) -> StoreResult<()> {
        let json = serde_json::to_string(control)?;
        let written = self
            .cache
            .set_session_control(
                &session_key(session.page.id, &session.id),
                &session_controls_key(session.page.id, &session.id),
                &control.id,
                &json,
                self.session_size_limit,
            )
            .await?;
        if written {
            Ok(())
        } else {
            Err(StoreError::SessionSizeExceeded {
                session: session.full_id(),
                limit: self.session_size_limit,
            })
        }
    }

    pub async fn delete_session_control(&self, session: &Session, control_id: &str) -> StoreResult<()> {
        self.cache
            .remove_session_control(
                &session_key(session.page.id, &session.id),
                &session_controls_key(session.page.id, &session.id),
                control_id,
            )
            .await?;
        Ok(())
    }

    // Session host clients

    pub async fn get_session_host_clients(
        &self,
        page_id: i64,
        session_id: &str,
    ) -> StoreResult<Vec<String>> {
        Ok(self
            .cache
            .set_members(&session_host_clients_key(page_id, session_id))
            .await?)
    }

    pub async fn get_page_host_client_sessions(
        &self,
        page_id: i64,
        client_id: &str,
    ) -> StoreResult<Vec<String>> {
        Ok(self
            .cache
            .set_members(&page_host_client_sessions_key(page_id, client_id))
            .await?)
    }

    pub async fn add_session_host_client(
        &self,
        page_id: i64,
        session_id: &str,
        client_id: &str,
    ) -> StoreResult<()> {
        self.cache
            .set_add(&session_host_clients_key(page_id, session_id), client_id)
            .await?;
        self.cache
            .set_add(&page_host_client_sessions_key(page_id, client_id), session_id)
            .await?;
        self.cache
            .set_add(
                &client_sessions_key(client_id),
                &full_session_id(page_id, session_id),
            )
            .await?;
        Ok(())
    }

    pub async fn remove_session_host_client(
        &self,
        page_id: i64,
        session_id: &str,
        client_id: &str,
    ) -> StoreResult<()> {
        self.cache
            .set_remove(&session_host_clients_key(page_id, session_id), client_id)
            .await?;
        self.cache
            .set_remove(&page_host_client_sessions_key(page_id, client_id), session_id)
            .await?;
        self.cache
            .set_remove(
                &client_sessions_key(client_id),
                &full_session_id(page_id, session_id),
            )
            .await?;
        Ok(())
    }

    pub async fn remove_page_host_client_sessions(
        &self,
        page_id: i64,
        client_id: &str,
    ) -> StoreResult<()> {
        self.cache
            .remove(&[page_host_client_sessions_key(page_id, client_id)])
            .await?;
        Ok(())
    }

    // Session web clients

    pub async fn get_session_web_clients(
        &self,
        page_id: i64,
        session_id: &str,
    ) -> StoreResult<Vec<String>> {
        Ok(self
            .cache
            .set_members(&session_web_clients_key(page_id, session_id))
            .await?)
    }

    pub async fn add_session_web_client(
        &self,
        page_id: i64,
        session_id: &str,
        client_id: &str,
    ) -> StoreResult<()> {
        self.cache
            .set_add(&session_web_clients_key(page_id, session_id), client_id)
            .await?;
        self.cache
            .set_add(
                &client_sessions_key(client_id),
                &full_session_id(page_id, session_id),
            )
            .await?;
        Ok(())
    }

    pub async fn remove_session_web_client(
        &self,
        page_id: i64,
        session_id: &str,
        client_id: &str,
    ) -> StoreResult<()> {
        self.cache
            .set_remove(&session_web_clients_key(page_id, session_id), client_id)
            .await?;
        self.cache
            .set_remove(
                &client_sessions_key(client_id),
                &full_session_id(page_id, session_id),
            )
            .await?;
        Ok(())
    }

    // Security principals

    pub async fn get_security_principal(
        &self,
        principal_id: &str,
    ) -> StoreResult<Option<SecurityPrincipal>> {
        match self.cache.get_string(&principal_key(principal_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set_security_principal(
        &self,
        principal: &SecurityPrincipal,
        expires: Duration,
    ) -> StoreResult<()> {
        self.cache
            .set_string(
                &principal_key(&principal.uid),
                &serde_json::to_string(principal)?,
                Some(expires),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_security_principal(&self, principal_id: &str) -> StoreResult<()> {
        self.cache.remove(&[principal_key(principal_id)]).await?;
        Ok(())
    }

    // Rate limits

    /// Counts one creation against `ip` in the current hour. Returns whether
    /// the caller is still within `limit`; a zero limit or unknown IP always passes.
    pub async fn check_rate_limit(&self, kind: RateLimit, ip: &str, limit: i64) -> StoreResult<bool> {
        if limit <= 0 || ip.is_empty() {
            return Ok(true);
        }
        let hour = Utc::now().timestamp() / 3600;
        let key = format!("{}:{ip}:{hour}", kind.prefix());
        let count = self
            .cache
            .increment(&key, 1, Some(RATE_LIMIT_WINDOW))
            .await?;
        Ok(count <= limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimit {
    Pages,
    Sessions,
}

impl RateLimit {
    fn prefix(self) -> &'static str {
        match self {
            RateLimit::Pages => "pages_limit",
            RateLimit::Sessions => "sessions_limit",
        }
    }
}
