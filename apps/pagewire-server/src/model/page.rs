use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub is_app: bool,
    #[serde(default)]
    pub permissions: String,
    #[serde(rename = "clientIP", default)]
    pub client_ip: String,
    #[serde(default)]
    pub assets_dir: String,
}

impl Page {
    /// A page not yet persisted; the store assigns `id`.
    pub fn new(name: &str, is_app: bool, permissions: &str, client_ip: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            is_app,
            permissions: permissions.to_string(),
            client_ip: client_ip.to_string(),
            assets_dir: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PageNameError {
    #[error("page name \"{0}\" has too many segments")]
    TooManySegments(String),
    #[error("page name \"{0}\" contains invalid characters")]
    InvalidCharacters(String),
}

/// Normalised `account/name` page address. The account part is optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageName {
    pub account: String,
    pub name: String,
}

impl PageName {
    pub fn parse(raw: &str) -> Result<Self, PageNameError> {
        let normalized = raw.trim().trim_matches('/').to_lowercase();
        let (account, name) = match normalized.split_once('/') {
            Some((account, name)) => (account.to_string(), name.to_string()),
            None => (String::new(), normalized.clone()),
        };
        if name.contains('/') {
            return Err(PageNameError::TooManySegments(raw.to_string()));
        }
        let valid = |segment: &str| {
            segment
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        };
        if !valid(&account) || !valid(&name) {
            return Err(PageNameError::InvalidCharacters(raw.to_string()));
        }
        Ok(Self { account, name })
    }

    pub fn is_reserved(&self, reserved_accounts: &[String], reserved_pages: &[String]) -> bool {
        let full = self.to_string();
        (!self.account.is_empty() && reserved_accounts.iter().any(|a| *a == self.account))
            || reserved_pages.iter().any(|p| *p == full)
    }
}

impl fmt::Display for PageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.account.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.account, self.name)
        }
    }
}
