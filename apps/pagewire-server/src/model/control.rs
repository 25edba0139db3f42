use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// ID of the root control every session starts with.
pub const ROOT_CONTROL_ID: &str = "page";

/// Prefix of server-generated control IDs.
pub const AUTO_ID_PREFIX: &str = "_";

pub const ID_SEPARATOR: &str = ":";

/// Attribute names hosts cannot set. Besides the structural ones this
/// includes `i`, `p`, `t` and `c`, the short keys a control serializes its
/// id, parent, type and children under; `set`/`append` of any of these is
/// silently skipped.
const SYSTEM_ATTRS: [&str; 11] = [
    "id", "to", "from", "at", "type", "parent", "children", "i", "p", "t", "c",
];

pub fn is_system_attr(name: &str) -> bool {
    SYSTEM_ATTRS.iter().any(|attr| attr.eq_ignore_ascii_case(name))
}

/// True for IDs the server generated and for the root, neither of which
/// take part in hierarchical ID prefixes.
pub fn is_auto_id(id: &str) -> bool {
    id.starts_with(AUTO_ID_PREFIX) || id.eq_ignore_ascii_case(ROOT_CONTROL_ID)
}

/// One node of a session's control tree. Free-form attributes are plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    #[serde(rename = "i")]
    pub id: String,
    #[serde(rename = "p", default)]
    pub parent: String,
    #[serde(rename = "t")]
    pub control_type: String,
    #[serde(rename = "c", default)]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<usize>,
    #[serde(flatten)]
    pub attrs: BTreeMap<String, String>,
}

impl Control {
    pub fn new(control_type: &str, parent: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.to_string(),
            control_type: control_type.to_lowercase(),
            children: Vec::new(),
            at: None,
            attrs: BTreeMap::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Sets an attribute; an empty value removes it.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        let name = name.to_lowercase();
        if value.is_empty() {
            self.attrs.remove(&name);
        } else {
            self.attrs.insert(name, value.to_string());
        }
    }

    pub fn append_attr(&mut self, name: &str, value: &str) {
        self.attrs
            .entry(name.to_lowercase())
            .or_default()
            .push_str(value);
    }

    /// Links `child_id` at `at` (clamped to the end) or appends it.
    pub fn add_child(&mut self, child_id: &str, at: Option<usize>) {
        if self.children.iter().any(|c| c == child_id) {
            return;
        }
        match at {
            Some(index) if index < self.children.len() => {
                self.children.insert(index, child_id.to_string())
            }
            _ => self.children.push(child_id.to_string()),
        }
    }

    pub fn remove_child(&mut self, child_id: &str) {
        self.children.retain(|c| c != child_id);
    }
}
