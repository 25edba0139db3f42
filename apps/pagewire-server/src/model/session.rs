use super::Page;

/// ID of the single implicit session shared by non-app pages.
pub const ZERO_SESSION: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub page: Page,
    pub id: String,
    pub client_ip: String,
    pub principal_id: String,
}

impl Session {
    pub fn new(page: Page, id: &str, client_ip: &str) -> Self {
        Self {
            page,
            id: id.to_string(),
            client_ip: client_ip.to_string(),
            principal_id: String::new(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.id == ZERO_SESSION
    }

    pub fn full_id(&self) -> String {
        full_session_id(self.page.id, &self.id)
    }
}

/// `pageId:sessionId`, the form sessions take in cross-page indexes.
pub fn full_session_id(page_id: i64, session_id: &str) -> String {
    format!("{page_id}:{session_id}")
}

pub fn parse_full_session_id(full_id: &str) -> Option<(i64, String)> {
    let (page_id, session_id) = full_id.split_once(':')?;
    let page_id = page_id.parse().ok()?;
    if session_id.is_empty() {
        return None;
    }
    Some((page_id, session_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ids_round_trip() {
        let session = Session::new(Page::new("p", true, "", ""), "abc", "");
        assert_eq!(session.full_id(), "0:abc");
        assert_eq!(
            parse_full_session_id("12:abc"),
            Some((12, "abc".to_string()))
        );
        assert_eq!(parse_full_session_id("12"), None);
        assert_eq!(parse_full_session_id("x:abc"), None);
        assert_eq!(parse_full_session_id("3:"), None);
    }
}
