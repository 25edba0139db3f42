//! Permission expressions: comma or space separated patterns, each optionally
//! scoped to a provider (`github:octo*`). Patterns containing `/` match
//! groups, patterns containing `@` match the email, anything else the login.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::SecurityPrincipal;

pub const GITHUB_AUTH_PROVIDER: &str = "github";
pub const AZURE_AUTH_PROVIDER: &str = "azure";
pub const GOOGLE_AUTH_PROVIDER: &str = "google";

const PROVIDERS: [&str; 3] = [GITHUB_AUTH_PROVIDER, AZURE_AUTH_PROVIDER, GOOGLE_AUTH_PROVIDER];

/// Which sign-in choices a page with a given expression should offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SigninOptions {
    pub github_enabled: bool,
    pub azure_enabled: bool,
    pub google_enabled: bool,
    pub groups_enabled: bool,
}

struct Pattern<'a> {
    provider: Option<&'static str>,
    value: &'a str,
}

fn patterns(expression: &str) -> impl Iterator<Item = Pattern<'_>> {
    expression
        .split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| {
            if let Some((scope, rest)) = token.split_once(':') {
                if let Some(provider) = PROVIDERS
                    .iter()
                    .find(|provider| provider.eq_ignore_ascii_case(scope))
                {
                    return Pattern {
                        provider: Some(*provider),
                        value: rest,
                    };
                }
            }
            Pattern {
                provider: None,
                value: token,
            }
        })
}

impl Pattern<'_> {
    fn matches(&self, principal: &SecurityPrincipal) -> bool {
        if let Some(provider) = self.provider {
            if !principal.auth_provider.eq_ignore_ascii_case(provider) {
                return false;
            }
        }
        match self.value {
            "" | "*" => true,
            value if value.contains('/') => {
                principal.groups.iter().any(|group| glob_match(value, group))
            }
            value if value.contains('@') => glob_match(value, &principal.email),
            value => glob_match(value, &principal.login),
        }
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?i)^{body}$"))
        .map(|re| re.is_match(candidate))
        .unwrap_or(false)
}

/// Anonymous callers (`None`) pass only the empty expression.
pub fn has_permissions(principal: Option<&SecurityPrincipal>, expression: &str) -> bool {
    let mut patterns = patterns(expression).peekable();
    if patterns.peek().is_none() {
        return true;
    }
    match principal {
        Some(principal) => patterns.any(|pattern| pattern.matches(principal)),
        None => false,
    }
}

pub fn get_signin_options(expression: &str) -> SigninOptions {
    let mut options = SigninOptions::default();
    for pattern in patterns(expression) {
        match pattern.provider {
            Some(GITHUB_AUTH_PROVIDER) => options.github_enabled = true,
            Some(AZURE_AUTH_PROVIDER) => options.azure_enabled = true,
            Some(GOOGLE_AUTH_PROVIDER) => options.google_enabled = true,
            _ => {
                options.github_enabled = true;
                options.azure_enabled = true;
                options.google_enabled = true;
            }
        }
        if pattern.value.contains('/') {
            options.groups_enabled = true;
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(provider: &str, login: &str, email: &str, groups: &[&str]) -> SecurityPrincipal {
        let mut principal = SecurityPrincipal::new(provider, "127.0.0.1", "test");
        principal.login = login.to_string();
        principal.email = email.to_string();
        principal.groups = groups.iter().map(|g| g.to_string()).collect();
        principal
    }

    #[test]
    fn anonymous_only_passes_empty_expression() {
        assert!(has_permissions(None, ""));
        assert!(has_permissions(None, " , "));
        assert!(!has_permissions(None, "*"));
        assert!(!has_permissions(None, "github:*"));
    }

    #[test]
    fn star_allows_any_signed_in_user() {
        let user = principal("google", "jane", "jane@example.com", &[]);
        assert!(user.has_permissions("*"));
        assert!(user.has_permissions(""));
    }

    #[test]
    fn provider_scope_restricts_to_that_provider() {
        let octo = principal("github", "octocat", "", &[]);
        let jane = principal("google", "jane", "jane@example.com", &[]);
        assert!(octo.has_permissions("github:*"));
        assert!(!jane.has_permissions("github:*"));
        assert!(jane.has_permissions("github:*, google:jane"));
        assert!(!jane.has_permissions("github:jane"));
    }

    #[test]
    fn group_patterns_match_by_prefix() {
        let member = principal("github", "octocat", "", &["other/team", "Org/Core"]);
        let outsider = principal("github", "ghost", "", &["else/team"]);
        assert!(member.has_permissions("org/*"));
        assert!(!outsider.has_permissions("org/*"));
    }

    #[test]
    fn email_and_login_globs() {
        let user = principal("azure", "jsmith", "j.smith@contoso.com", &[]);
        assert!(user.has_permissions("*@contoso.com"));
        assert!(!user.has_permissions("*@fabrikam.com"));
        assert!(user.has_permissions("js*"));
        assert!(!user.has_permissions("jsm"));
        assert!(!user.has_permissions("j.smith"));
    }

    #[test]
    fn signin_options_follow_scopes() {
        assert_eq!(
            get_signin_options("github:octocat github:org/*"),
            SigninOptions {
                github_enabled: true,
                groups_enabled: true,
                ..SigninOptions::default()
            }
        );
        let all = get_signin_options("*");
        assert!(all.github_enabled && all.azure_enabled && all.google_enabled);
        assert!(!all.groups_enabled);
    }
}
