//! JSON envelope exchanged with host and web clients, plus the payload of
//! every action.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::SigninOptions;
use crate::model::{Command, Control};

pub const REGISTER_WEB_CLIENT: &str = "registerWebClient";
pub const REGISTER_HOST_CLIENT: &str = "registerHostClient";
pub const SESSION_CREATED: &str = "sessionCreated";
pub const PAGE_COMMAND_FROM_HOST: &str = "pageCommandFromHost";
pub const PAGE_COMMANDS_BATCH_FROM_HOST: &str = "pageCommandsBatchFromHost";
pub const PAGE_EVENT_FROM_WEB: &str = "pageEventFromWeb";
pub const PAGE_EVENT_TO_HOST: &str = "pageEventToHost";
pub const ADD_PAGE_CONTROLS: &str = "addPageControls";
pub const REPLACE_PAGE_CONTROLS: &str = "replacePageControls";
pub const UPDATE_CONTROL_PROPS: &str = "updateControlProps";
pub const APPEND_CONTROL_PROPS: &str = "appendControlProps";
pub const REMOVE_CONTROL: &str = "removeControl";
pub const CLEAN_CONTROL: &str = "cleanControl";
pub const PAGE_CONTROLS_BATCH: &str = "pageControlsBatch";
pub const APP_BECOME_ACTIVE: &str = "appBecomeActive";
pub const APP_BECOME_INACTIVE: &str = "appBecomeInactive";
pub const SESSION_CRASHED: &str = "sessionCrashed";
pub const SIGNOUT: &str = "signout";
pub const INACTIVE_APP_FROM_HOST: &str = "inactiveAppFromHost";
/// Reply to a message that could not be decoded or routed.
pub const ERROR: &str = "error";

pub const PAGE_NOT_FOUND_MESSAGE: &str = "Page not found or application is not running.";
pub const INACTIVE_APP_MESSAGE: &str =
    "Application is inactive. Please try refreshing this page later.";
pub const SESSION_CRASHED_MESSAGE: &str = "There was an error while processing your request. Please refresh the page to start a new session.";
pub const SIGNIN_REQUIRED_MESSAGE: &str = "signin_required";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new<P: Serialize>(id: &str, action: &str, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.to_string(),
            action: action.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// A server-initiated message; replies reuse the request `id` instead.
    pub fn broadcast<P: Serialize>(action: &str, payload: &P) -> Result<Self, serde_json::Error> {
        Self::new("", action, payload)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.payload.is_null() {
            serde_json::from_value(serde_json::Value::Object(Default::default()))
        } else {
            T::deserialize(&self.payload)
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterHostClientRequest {
    #[serde(rename = "hostClientID")]
    pub host_client_id: String,
    pub page_name: String,
    pub is_app: bool,
    pub update: bool,
    pub auth_token: String,
    pub permissions: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterHostClientResponse {
    #[serde(rename = "hostClientID")]
    pub host_client_id: String,
    pub page_name: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterWebClientRequest {
    pub page_name: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub page_hash: String,
    pub win_width: String,
    pub win_height: String,
    #[serde(rename = "isPWA")]
    pub is_pwa: String,
    pub is_web_view: String,
    pub platform: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPayload {
    pub id: String,
    pub controls: HashMap<String, Control>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterWebClientResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionPayload>,
    pub error: String,
    pub app_inactive: bool,
    pub signin_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signin_options: Option<SigninOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageCommandRequest {
    pub page_name: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub command: Command,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageCommandResponse {
    pub result: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageCommandsBatchRequest {
    pub page_name: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageCommandsBatchResponse {
    pub results: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageEventPayload {
    pub page_name: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub event_target: String,
    pub event_name: String,
    pub event_data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddPageControlsPayload {
    pub controls: Vec<Control>,
    #[serde(rename = "trimIDs")]
    pub trim_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacePageControlsPayload {
    pub ids: Vec<String>,
    pub remove: bool,
    pub controls: Vec<Control>,
}

/// Shared by `updateControlProps` and `appendControlProps`. Each entry
/// carries the control ID under `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPropsPayload {
    pub props: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlIdsPayload {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionCreatedPayload {
    pub page_name: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

/// Carried by `sessionCrashed` and `appBecomeInactive`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagePayload {
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InactiveAppRequest {
    pub page_name: String,
}

/// Name of the pub/sub channel delivering to one client.
pub fn client_channel(client_id: &str) -> String {
    format!("client-{client_id}")
}
