//! Executes host commands against one session's control tree.
//!
//! Every entry point takes the session's named lock from the cache for its
//! whole duration, so mutations of a session are totally ordered across all
//! server processes sharing the backend. Resulting deltas are published to
//! the session's web clients before the lock is released.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use pagewire_cache::{CacheError, LockGuard};
use tracing::debug;

use crate::auth::has_permissions;
use crate::model::control::{is_auto_id, is_system_attr, AUTO_ID_PREFIX, ID_SEPARATOR};
use crate::model::{Command, CommandKind, Control, Page, ParseError, Session, ROOT_CONTROL_ID};
use crate::protocol::{
    client_channel, AddPageControlsPayload, ControlIdsPayload, ControlPropsPayload, EmptyPayload,
    Message, MessagePayload, PageEventPayload, ReplacePageControlsPayload, ADD_PAGE_CONTROLS,
    APPEND_CONTROL_PROPS, CLEAN_CONTROL, PAGE_CONTROLS_BATCH, PAGE_EVENT_TO_HOST, REMOVE_CONTROL,
    REPLACE_PAGE_CONTROLS, SESSION_CRASHED, SESSION_CRASHED_MESSAGE, SIGNOUT,
    UPDATE_CONTROL_PROPS,
};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("control type is not specified")]
    MissingControlType,
    #[error("'{0}' command should have control ID specified")]
    MissingControlId(&'static str),
    #[error("'get' command should have control ID and property specified")]
    MissingGetArguments,
    #[error("control with ID '{0}' not found")]
    ControlNotFound(String),
    #[error("parent control with id '{0}' not found")]
    ParentNotFound(String),
    #[error("'at' is out of range")]
    AtOutOfRange,
    #[error("'at' cannot be specified with a list of IDs")]
    AtWithIdList,
    #[error("'page' control cannot be removed")]
    RootNotRemovable,
}

pub type CommandResult<T> = Result<T, CommandError>;

/// What one command did: the value returned to the host, if the command
/// produces one, and the delta for web clients, if anything changed.
#[derive(Debug, Default)]
struct Applied {
    result: Option<String>,
    message: Option<Message>,
}

struct Added {
    ids: Vec<String>,
    trim_ids: Vec<String>,
    controls: Vec<Control>,
}

/// Attributes `cleanPage` resets on the root control.
const PAGE_LAYOUT_ATTRS: [&str; 10] = [
    "verticalFill",
    "horizontalAlign",
    "verticalAlign",
    "gap",
    "padding",
    "bgcolor",
    "theme",
    "themePrimaryColor",
    "themeTextColor",
    "themeBackgroundColor",
];

pub struct SessionHandler {
    store: Store,
    session: Session,
}

/// Creates a session with its root control and schedules its expiration.
#[allow(clippy::too_many_arguments)]
pub async fn new_session(
    store: &Store,
    page: Page,
    id: &str,
    client_ip: &str,
    page_hash: &str,
    win_width: &str,
    win_height: &str,
    lifetime: Duration,
) -> CommandResult<Session> {
    let session = Session::new(page, id, client_ip);
    store.add_session(&session).await?;

    let handler = SessionHandler::new(store, session);
    let mut root = Control::new("page", "", ROOT_CONTROL_ID);
    root.set_attr("hash", page_hash);
    root.set_attr("winwidth", win_width);
    root.set_attr("winheight", win_height);
    handler.add_control(&mut root).await?;
    handler.extend_expiration(lifetime).await?;
    debug!(page = %handler.session.page.name, session_id = id, "session created");
    Ok(handler.session)
}

impl SessionHandler {
    pub fn new(store: &Store, session: Session) -> Self {
        Self {
            store: store.clone(),
            session,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    pub async fn extend_expiration(&self, lifetime: Duration) -> CommandResult<()> {
        let expires = Utc::now() + chrono::Duration::seconds(lifetime.as_secs() as i64);
        self.store
            .set_session_expiration(&self.session, expires)
            .await?;
        Ok(())
    }

    /// Runs one command and returns its result (empty for commands that
    /// produce none).
    pub async fn execute(&self, command: &Command) -> CommandResult<String> {
        debug!(
            page = %self.session.page.name,
            session_id = %self.session.id,
            command = %command.name,
            "execute command"
        );
        let guard = self.lock().await?;
        let outcome = self.execute_locked(command).await;
        let released = guard.unlock().await;
        let result = outcome?;
        released?;
        Ok(result)
    }

    async fn execute_locked(&self, command: &Command) -> CommandResult<String> {
        let applied = self.apply(command).await?;
        if let Some(message) = &applied.message {
            self.broadcast_to_web_clients(message).await?;
        }
        Ok(applied.result.unwrap_or_default())
    }

    /// Runs commands in order under a single lock acquisition. Deltas go out
    /// as one `pageControlsBatch`; a failing command stops the batch but the
    /// commands before it stay applied and are still broadcast.
    pub async fn execute_batch(&self, commands: &[Command]) -> CommandResult<Vec<String>> {
        let guard = self.lock().await?;
        let outcome = self.execute_batch_locked(commands).await;
        let released = guard.unlock().await;
        let results = outcome?;
        released?;
        Ok(results)
    }

    async fn execute_batch_locked(&self, commands: &[Command]) -> CommandResult<Vec<String>> {
        let mut results = Vec::new();
        let mut messages = Vec::new();
        let mut failure = None;
        for command in commands {
            match self.apply(command).await {
                Ok(applied) => {
                    results.extend(applied.result);
                    messages.extend(applied.message);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if !messages.is_empty() {
            let batch = Message::broadcast(PAGE_CONTROLS_BATCH, &messages)?;
            self.broadcast_to_web_clients(&batch).await?;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Applies property changes made in a browser. Unknown controls are
    /// skipped, as are system attributes.
    pub async fn update_control_props(&self, props: &[BTreeMap<String, String>]) -> CommandResult<()> {
        let guard = self.lock().await?;
        let outcome = self.update_control_props_locked(props).await;
        let released = guard.unlock().await;
        outcome?;
        released?;
        Ok(())
    }

    async fn update_control_props_locked(&self, props: &[BTreeMap<String, String>]) -> CommandResult<()> {
        for entry in props {
            let Some(id) = entry.get("i") else {
                continue;
            };
            let Some(mut control) = self.get_control(id).await? else {
                continue;
            };
            for (name, value) in entry {
                if !is_system_attr(name) {
                    control.set_attr(name, value);
                }
            }
            self.store
                .set_session_control(&self.session, &control)
                .await?;
        }
        Ok(())
    }

    /// Clears the root control's children and layout attributes, leaving a
    /// blank page for a re-registering host.
    pub async fn clean_page(&self) -> CommandResult<()> {
        let reset = PAGE_LAYOUT_ATTRS
            .iter()
            .fold(Command::new("set", &[ROOT_CONTROL_ID]), |command, attr| {
                command.with_attr(attr, "")
            });
        self.execute_batch(&[Command::new("clean", &[ROOT_CONTROL_ID]), reset])
            .await?;
        Ok(())
    }

    /// Sends a page-level event to every host client serving this session.
    pub async fn send_page_event(&self, event_name: &str, event_data: &str) -> CommandResult<()> {
        let message = Message::broadcast(
            PAGE_EVENT_TO_HOST,
            &PageEventPayload {
                page_name: self.session.page.name.clone(),
                session_id: self.session.id.clone(),
                event_target: ROOT_CONTROL_ID.to_string(),
                event_name: event_name.to_string(),
                event_data: event_data.to_string(),
            },
        )?
        .to_bytes()?;
        let hosts = self
            .store
            .get_session_host_clients(self.session.page.id, &self.session.id)
            .await?;
        for client_id in hosts {
            self.store
                .cache()
                .publish(&client_channel(&client_id), message.clone())
                .await?;
        }
        Ok(())
    }

    async fn apply(&self, command: &Command) -> CommandResult<Applied> {
        let Some(kind) = command.kind() else {
            return Err(CommandError::UnknownCommand(command.name.clone()));
        };
        let applied = match kind {
            CommandKind::Add => {
                let added = self.add_controls(command).await?;
                Applied {
                    result: Some(added.ids.join(" ")),
                    message: Some(Message::broadcast(
                        ADD_PAGE_CONTROLS,
                        &AddPageControlsPayload {
                            controls: added.controls,
                            trim_ids: added.trim_ids,
                        },
                    )?),
                }
            }
            CommandKind::Replace => self.replace(command).await?,
            CommandKind::Set => Applied {
                result: None,
                message: Some(Message::broadcast(
                    UPDATE_CONTROL_PROPS,
                    &self.set_props(command, false).await?,
                )?),
            },
            CommandKind::Append => Applied {
                result: None,
                message: Some(Message::broadcast(
                    APPEND_CONTROL_PROPS,
                    &self.set_props(command, true).await?,
                )?),
            },
            CommandKind::Get => Applied {
                result: Some(self.get(command).await?),
                message: None,
            },
            CommandKind::Clean => {
                let at = parse_at(command)?;
                let ids = target_ids(command);
                if at.is_some() && ids.len() > 1 {
                    return Err(CommandError::AtWithIdList);
                }
                Applied {
                    result: None,
                    message: Some(Message::broadcast(
                        CLEAN_CONTROL,
                        &ControlIdsPayload {
                            ids: self.clean_controls(&ids, at).await?,
                        },
                    )?),
                }
            }
            CommandKind::Remove => {
                let at = parse_at(command)?;
                if command.values.is_empty() && at.is_none() {
                    return Err(CommandError::RootNotRemovable);
                }
                let ids = target_ids(command);
                if at.is_some() && ids.len() > 1 {
                    return Err(CommandError::AtWithIdList);
                }
                Applied {
                    result: None,
                    message: Some(Message::broadcast(
                        REMOVE_CONTROL,
                        &ControlIdsPayload {
                            ids: self.remove_controls(&ids, at).await?,
                        },
                    )?),
                }
            }
            CommandKind::CanAccess => Applied {
                result: Some(self.can_access(command).await?.to_string()),
                message: None,
            },
            CommandKind::Signout => Applied {
                result: None,
                message: Some(Message::broadcast(SIGNOUT, &EmptyPayload {})?),
            },
            CommandKind::Error => {
                let text = command
                    .values
                    .first()
                    .filter(|v| !v.is_empty())
                    .map(String::as_str)
                    .unwrap_or(SESSION_CRASHED_MESSAGE);
                Applied {
                    result: None,
                    message: Some(Message::broadcast(
                        SESSION_CRASHED,
                        &MessagePayload {
                            message: text.to_string(),
                        },
                    )?),
                }
            }
        };
        Ok(applied)
    }

    async fn add_controls(&self, command: &Command) -> CommandResult<Added> {
        let top_parent = command
            .attr("to")
            .filter(|to| !to.is_empty())
            .unwrap_or(ROOT_CONTROL_ID)
            .to_string();
        let mut top_at = parse_at(command)?;
        let trim = command
            .attr("trim")
            .and_then(|t| t.trim().parse::<i64>().ok())
            .unwrap_or(0);

        let items = sub_commands(command, true)?;

        let mut placed: Vec<(usize, String)> = Vec::with_capacity(items.len());
        let mut controls = Vec::with_capacity(items.len());
        let mut affected_parents = HashSet::new();

        for item in &items {
            let Some((control_type, flags)) = item.values.split_first() else {
                return Err(CommandError::MissingControlType);
            };

            let nearest = placed
                .iter()
                .rev()
                .find(|(indent, _)| *indent < item.indent)
                .map(|(_, id)| id.clone());
            let (parent_id, at) = match nearest {
                Some(id) => (id, None),
                None => {
                    let at = top_at;
                    if let Some(next) = top_at.as_mut() {
                        *next += 1;
                    }
                    (top_parent.clone(), at)
                }
            };

            let local_id = match item.attr("id").filter(|id| !id.is_empty()) {
                Some(id) => id.to_string(),
                None => self.next_control_id().await?,
            };
            let id = hierarchical_id(&parent_id, &local_id);

            let mut control = Control::new(control_type, &parent_id, &id);
            control.at = at;
            for flag in flags {
                if !is_system_attr(flag) {
                    control.set_attr(flag, "true");
                }
            }
            for (name, value) in &item.attrs {
                if !is_system_attr(name) && !value.is_empty() {
                    control.set_attr(name, value);
                }
            }

            self.add_control(&mut control).await?;
            affected_parents.insert(parent_id);
            placed.push((item.indent, id));
            controls.push(control);
        }

        // Parents added earlier in this batch gained children since they were saved.
        for control in controls.iter_mut() {
            if affected_parents.contains(&control.id) {
                if let Some(fresh) = self.get_control(&control.id).await? {
                    *control = fresh;
                }
            }
        }

        let mut trim_ids = Vec::new();
        if trim != 0 {
            let children = self
                .get_control(&top_parent)
                .await?
                .map(|parent| parent.children)
                .unwrap_or_default();
            let keep = trim.unsigned_abs() as usize;
            if children.len() > keep {
                trim_ids = if trim < 0 {
                    children[keep..].to_vec()
                } else {
                    children[..children.len() - keep].to_vec()
                };
                self.remove_controls(&trim_ids, None).await?;
            }
        }

        Ok(Added {
            ids: placed.into_iter().map(|(_, id)| id).collect(),
            trim_ids,
            controls,
        })
    }

    async fn replace(&self, command: &Command) -> CommandResult<Applied> {
        let parent_id = command
            .attr("to")
            .filter(|to| !to.is_empty())
            .unwrap_or(ROOT_CONTROL_ID)
            .to_string();
        let at = parse_at(command)?;
        let removed = match at {
            None => self.clean_controls(&[parent_id], None).await?,
            Some(index) => self.remove_controls(&[parent_id], Some(index)).await?,
        };
        let added = self.add_controls(command).await?;
        Ok(Applied {
            result: Some(added.ids.join(" ")),
            message: Some(Message::broadcast(
                REPLACE_PAGE_CONTROLS,
                &ReplacePageControlsPayload {
                    ids: removed,
                    remove: at.is_some(),
                    controls: added.controls,
                },
            )?),
        })
    }

    async fn get(&self, command: &Command) -> CommandResult<String> {
        let [id, property, ..] = command.values.as_slice() else {
            return Err(CommandError::MissingGetArguments);
        };
        let control = self
            .get_control(id)
            .await?
            .ok_or_else(|| CommandError::ControlNotFound(id.clone()))?;
        Ok(control.attr(property).unwrap_or_default().to_string())
    }

    /// Every target is resolved before anything is written, so an unknown
    /// id fails the whole command. A write failing part way still publishes
    /// the lines already stored.
    async fn set_props(&self, command: &Command, append: bool) -> CommandResult<ControlPropsPayload> {
        let (name, action) = if append {
            ("append", APPEND_CONTROL_PROPS)
        } else {
            ("set", UPDATE_CONTROL_PROPS)
        };
        let items = sub_commands(command, false)?;

        let mut controls: HashMap<String, Control> = HashMap::new();
        for item in &items {
            let Some(id) = item.values.first() else {
                return Err(CommandError::MissingControlId(name));
            };
            if !controls.contains_key(id) {
                let control = self
                    .get_control(id)
                    .await?
                    .ok_or_else(|| CommandError::ControlNotFound(id.clone()))?;
                controls.insert(id.clone(), control);
            }
        }

        let mut payload = ControlPropsPayload::default();
        for item in &items {
            let Some((id, flags)) = item.values.split_first() else {
                continue;
            };
            let Some(control) = controls.get_mut(id) else {
                continue;
            };

            let mut attrs = item.attrs.clone();
            for flag in flags {
                attrs.insert(flag.to_lowercase(), "true".to_string());
            }

            let mut props = BTreeMap::new();
            props.insert("i".to_string(), id.clone());
            for (attr, value) in attrs {
                if is_system_attr(&attr) {
                    continue;
                }
                if append {
                    control.append_attr(&attr, &value);
                } else {
                    control.set_attr(&attr, &value);
                }
                props.insert(attr.to_lowercase(), value);
            }
            if let Err(err) = self.store.set_session_control(&self.session, control).await {
                if !payload.props.is_empty() {
                    self.broadcast_to_web_clients(&Message::broadcast(action, &payload)?)
                        .await?;
                }
                return Err(err.into());
            }
            payload.props.push(props);
        }
        Ok(payload)
    }

    async fn can_access(&self, command: &Command) -> CommandResult<bool> {
        let expression = command.values.first().map(String::as_str).unwrap_or("");
        let principal = if self.session.principal_id.is_empty() {
            None
        } else {
            self.store
                .get_security_principal(&self.session.principal_id)
                .await?
        };
        Ok(has_permissions(principal.as_ref(), expression))
    }

    /// Resolves `ids` (or their child at `at`) up front so a bad reference
    /// fails before anything is deleted. Returns the IDs actually targeted.
    async fn resolve_targets(&self, ids: &[String], at: Option<usize>) -> CommandResult<Vec<String>> {
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let control = self
                .get_control(id)
                .await?
                .ok_or_else(|| CommandError::ControlNotFound(id.clone()))?;
            match at {
                Some(index) => {
                    let child = control
                        .children
                        .get(index)
                        .ok_or(CommandError::AtOutOfRange)?;
                    targets.push(child.clone());
                }
                None => targets.push(control.id),
            }
        }
        Ok(targets)
    }

    async fn clean_controls(&self, ids: &[String], at: Option<usize>) -> CommandResult<Vec<String>> {
        let targets = self.resolve_targets(ids, at).await?;
        for id in &targets {
            // An earlier target may have taken this one with it.
            let Some(mut control) = self.get_control(id).await? else {
                continue;
            };
            self.delete_descendants(&control.id).await?;
            control.children.clear();
            self.store
                .set_session_control(&self.session, &control)
                .await?;
        }
        Ok(targets)
    }

    async fn remove_controls(&self, ids: &[String], at: Option<usize>) -> CommandResult<Vec<String>> {
        let targets = self.resolve_targets(ids, at).await?;
        if targets.iter().any(|id| id == ROOT_CONTROL_ID) {
            return Err(CommandError::RootNotRemovable);
        }
        for id in &targets {
            let Some(control) = self.get_control(id).await? else {
                continue;
            };
            self.delete_descendants(&control.id).await?;
            self.store
                .delete_session_control(&self.session, &control.id)
                .await?;
            if let Some(mut parent) = self.get_control(&control.parent).await? {
                parent.remove_child(&control.id);
                self.store
                    .set_session_control(&self.session, &parent)
                    .await?;
            }
        }
        Ok(targets)
    }

    /// Collects the whole subtree first, then deletes it.
    async fn delete_descendants(&self, id: &str) -> CommandResult<()> {
        let mut descendants = Vec::new();
        let mut pending = vec![id.to_string()];
        while let Some(current) = pending.pop() {
            if let Some(control) = self.get_control(&current).await? {
                descendants.extend(control.children.iter().cloned());
                pending.extend(control.children);
            }
        }
        for descendant in descendants {
            self.store
                .delete_session_control(&self.session, &descendant)
                .await?;
        }
        Ok(())
    }

    /// Saves `control`. A control that already exists keeps its children;
    /// a new one is linked into its parent, which must exist.
    async fn add_control(&self, control: &mut Control) -> CommandResult<()> {
        if let Some(existing) = self.get_control(&control.id).await? {
            control.children = existing.children;
            self.store
                .set_session_control(&self.session, control)
                .await?;
            return Ok(());
        }
        if control.parent.is_empty() {
            self.store
                .set_session_control(&self.session, control)
                .await?;
            return Ok(());
        }

        let mut parent = self
            .get_control(&control.parent)
            .await?
            .ok_or_else(|| CommandError::ParentNotFound(control.parent.clone()))?;
        self.store
            .set_session_control(&self.session, control)
            .await?;
        parent.add_child(&control.id, control.at);
        if let Err(err) = self
            .store
            .set_session_control(&self.session, &parent)
            .await
        {
            self.store
                .delete_session_control(&self.session, &control.id)
                .await?;
            return Err(err.into());
        }
        Ok(())
    }

    async fn next_control_id(&self) -> CommandResult<String> {
        let next = self.store.next_control_id(&self.session).await?;
        Ok(format!("{AUTO_ID_PREFIX}{next}"))
    }

    async fn get_control(&self, id: &str) -> CommandResult<Option<Control>> {
        Ok(self.store.get_session_control(&self.session, id).await?)
    }

    async fn broadcast_to_web_clients(&self, message: &Message) -> CommandResult<()> {
        let bytes = message.to_bytes()?;
        let clients = self
            .store
            .get_session_web_clients(self.session.page.id, &self.session.id)
            .await?;
        for client_id in clients {
            self.store
                .cache()
                .publish(&client_channel(&client_id), bytes.clone())
                .await?;
        }
        Ok(())
    }

    async fn lock(&self) -> CommandResult<LockGuard> {
        let key = format!("session-lock-{}", self.session.full_id());
        Ok(self.store.cache().lock(&key).await?)
    }
}

/// Flattens a command with its nested commands and unparsed lines into the
/// items it applies to. With `offset_lines`, lines following a command that
/// itself names a control are indented below it.
fn sub_commands(command: &Command, offset_lines: bool) -> CommandResult<Vec<Command>> {
    let mut items = Vec::new();
    let mut indent = 0;
    if !command.values.is_empty() {
        items.push(command.clone());
        if offset_lines {
            indent = 2;
        }
    }
    items.extend(command.commands.iter().cloned());
    for line in &command.lines {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(mut child) = Command::parse(line, false)? {
            child.indent += indent;
            items.push(child);
        }
    }
    Ok(items)
}

fn target_ids(command: &Command) -> Vec<String> {
    if command.values.is_empty() {
        vec![ROOT_CONTROL_ID.to_string()]
    } else {
        command.values.clone()
    }
}

/// Empty or non-numeric `at` means "not given"; negative values can never
/// address a child.
fn parse_at(command: &Command) -> CommandResult<Option<usize>> {
    match command.attr("at").map(|at| at.trim().parse::<i64>()) {
        Some(Ok(at)) if at < 0 => Err(CommandError::AtOutOfRange),
        Some(Ok(at)) => Ok(Some(at as usize)),
        _ => Ok(None),
    }
}

/// Prefixes `id` with the user-supplied segments of its parent's ID.
fn hierarchical_id(parent_id: &str, id: &str) -> String {
    parent_id
        .split(ID_SEPARATOR)
        .filter(|segment| !segment.is_empty() && !is_auto_id(segment))
        .chain(std::iter::once(id))
        .collect::<Vec<_>>()
        .join(ID_SEPARATOR)
}
