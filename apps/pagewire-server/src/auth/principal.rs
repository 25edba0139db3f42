use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::permissions;

/// An authenticated identity, bound to the client address and browser it
/// signed in from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPrincipal {
    pub uid: String,
    pub auth_provider: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(rename = "clientIP", default)]
    pub client_ip: String,
    #[serde(default)]
    pub user_agent_hash: String,
    /// Provider token, stored encrypted.
    #[serde(default)]
    pub token: String,
}

impl SecurityPrincipal {
    pub fn new(auth_provider: &str, client_ip: &str, user_agent: &str) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            auth_provider: auth_provider.to_lowercase(),
            id: String::new(),
            login: String::new(),
            name: String::new(),
            email: String::new(),
            groups: Vec::new(),
            client_ip: client_ip.to_string(),
            user_agent_hash: hash_user_agent(user_agent),
            token: String::new(),
        }
    }

    pub fn has_permissions(&self, expression: &str) -> bool {
        permissions::has_permissions(Some(self), expression)
    }

    /// Whether this principal may be used by a connection from `client_ip`
    /// presenting `user_agent`.
    pub fn matches_client(&self, client_ip: &str, user_agent: &str) -> bool {
        self.client_ip == client_ip && self.user_agent_hash == hash_user_agent(user_agent)
    }

    /// Page attributes describing the signed-in user; blank when anonymous.
    pub fn user_props(principal: Option<&Self>) -> Vec<(&'static str, String)> {
        let Some(p) = principal else {
            return USER_PROPS
                .iter()
                .map(|name| (*name, String::new()))
                .collect();
        };
        vec![
            ("userauthprovider", p.auth_provider.clone()),
            ("userid", p.id.clone()),
            ("userlogin", p.login.clone()),
            ("username", p.name.clone()),
            ("useremail", p.email.clone()),
            ("userclientip", p.client_ip.clone()),
        ]
    }
}

const USER_PROPS: [&str; 6] = [
    "userauthprovider",
    "userid",
    "userlogin",
    "username",
    "useremail",
    "userclientip",
];

pub fn hash_user_agent(user_agent: &str) -> String {
    hex::encode(Sha256::digest(user_agent.as_bytes()))
}
