//! Trap paths and credential harvesting.

use serde_json::Value;

use crate::deception::Deception;

/// Planted paths, most specific first. `None` serves the generic glitch page.
const TRAPS: &[(&str, Option<Deception>)] = &[
    ("/.env", Some(Deception::EnvFile)),
    ("/.env.local", Some(Deception::EnvFile)),
    ("/.env.production", Some(Deception::EnvFile)),
    ("/.env.bak", Some(Deception::EnvFile)),
    ("/.env.backup", Some(Deception::EnvFile)),
    ("/api/.env", Some(Deception::EnvFile)),
    ("/backend/.env", Some(Deception::EnvFile)),
    ("/.git/config", Some(Deception::GitConfig)),
    ("/.git", None),
    ("/.aws/credentials", Some(Deception::CloudCredentials)),
    ("/.aws", Some(Deception::CloudCredentials)),
    ("/wp-login.php", Some(Deception::WordPressLogin)),
    ("/wp-admin", Some(Deception::WordPressLogin)),
    ("/administrator", Some(Deception::WordPressLogin)),
    ("/admin.php", Some(Deception::WordPressLogin)),
    ("/phpmyadmin", Some(Deception::PhpMyAdmin)),
    ("/pma", Some(Deception::PhpMyAdmin)),
    ("/myadmin", Some(Deception::PhpMyAdmin)),
    ("/dbadmin", Some(Deception::PhpMyAdmin)),
    ("/api/v1/namespaces", Some(Deception::KubernetesApi)),
    ("/api/v1/pods", Some(Deception::KubernetesApi)),
    ("/apis", Some(Deception::KubernetesApi)),
    ("/actuator", Some(Deception::DebugConfig)),
    ("/debug/vars", Some(Deception::DebugConfig)),
    ("/debug/pprof", Some(Deception::DebugConfig)),
    ("/server-status", Some(Deception::DebugConfig)),
    ("/config.json", Some(Deception::DebugConfig)),
    ("/_profiler", Some(Deception::DebugConfig)),
    ("/v2/_catalog", None),
    ("/containers/json", None),
    ("/xmlrpc.php", None),
    ("/wp-content", None),
    ("/wp-includes", None),
    ("/cgi-bin", None),
    ("/shell.php", None),
    ("/phpinfo.php", None),
    ("/vendor/phpunit", None),
    ("/boaform", None),
    ("/hnap1", None),
    ("/telescope", None),
    ("/solr", None),
];

/// Lower-cases and trims a trailing slash so `/WP-Admin/` and `/wp-admin` agree.
pub fn normalize_path(path: &str) -> String {
    let lower = path.to_lowercase();
    match lower.strip_suffix('/') {
        Some(trimmed) if !trimmed.is_empty() => trimmed.to_string(),
        _ => lower,
    }
}

/// Exact or path-segment prefix match against the trap list.
pub fn match_trap(normalized: &str) -> Option<Deception> {
    TRAPS
        .iter()
        .find(|(trap, _)| {
            normalized == *trap
                || normalized
                    .strip_prefix(trap)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .map(|(_, deception)| deception.unwrap_or(Deception::Glitch))
}

const USER_FIELDS: &[&str] = &["log", "user", "username", "email", "login", "pma_username"];
const PASS_FIELDS: &[&str] = &["pwd", "pass", "password", "passwd", "pma_password"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn describe(&self) -> String {
        format!(
            "credential harvest: user={} password={}",
            self.username.as_deref().unwrap_or("-"),
            self.password.as_deref().unwrap_or("-"),
        )
    }
}

/// Pulls login-ish fields out of a JSON or url-encoded body.
pub fn harvest_credentials(content_type: Option<&str>, body: &str) -> Option<Credentials> {
    if body.trim().is_empty() {
        return None;
    }
    let is_json = content_type.is_some_and(|ct| ct.contains("application/json"));

    let fields: Vec<(String, String)> = if is_json {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => map
                .into_iter()
                .filter_map(|(key, value)| match value {
                    Value::String(s) => Some((key, s)),
                    Value::Number(n) => Some((key, n.to_string())),
                    _ => None,
                })
                .collect(),
            _ => return None,
        }
    } else {
        url::form_urlencoded::parse(body.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    };

    let pick = |names: &[&str]| {
        fields
            .iter()
            .find(|(key, value)| !value.is_empty() && names.contains(&key.to_lowercase().as_str()))
            .map(|(_, value)| value.clone())
    };

    let credentials = Credentials {
        username: pick(USER_FIELDS),
        password: pick(PASS_FIELDS),
    };
    if credentials.username.is_none() && credentials.password.is_none() {
        None
    } else {
        Some(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_exact_and_segment_prefixes() {
        assert_eq!(match_trap("/.env"), Some(Deception::EnvFile));
        assert_eq!(match_trap("/wp-admin/install.php"), Some(Deception::WordPressLogin));
        assert_eq!(match_trap("/phpmyadmin/index.php"), Some(Deception::PhpMyAdmin));
        assert_eq!(match_trap("/api/v1/namespaces/default/secrets"), Some(Deception::KubernetesApi));
        assert_eq!(match_trap("/.git/config"), Some(Deception::GitConfig));
        assert_eq!(match_trap("/.git/head"), Some(Deception::Glitch));
        assert_eq!(match_trap("/cgi-bin/luci"), Some(Deception::Glitch));
    }

    #[test]
    fn storefront_paths_are_not_traps() {
        for path in [
            "/",
            "/api/products",
            "/api/v1/products",
            "/admin",
            "/api/auth/login",
            "/environment",
            "/.envoy",
            "/pmart",
            "/wp-admin-guide",
        ] {
            assert_eq!(match_trap(&normalize_path(path)), None, "{path}");
        }
    }

    #[test]
    fn normalization_is_case_and_slash_insensitive() {
        assert_eq!(normalize_path("/WP-Admin/"), "/wp-admin");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(match_trap(&normalize_path("/PhpMyAdmin/")), Some(Deception::PhpMyAdmin));
    }

    #[test]
    fn harvests_wordpress_form_fields() {
        let creds = harvest_credentials(
            Some("application/x-www-form-urlencoded"),
            "log=admin&pwd=hunter2&wp-submit=Log+In",
        )
        .unwrap();
        assert_eq!(creds.username.as_deref(), Some("admin"));
        assert_eq!(creds.password.as_deref(), Some("hunter2"));
        assert_eq!(creds.describe(), "credential harvest: user=admin password=hunter2");
    }

    #[test]
    fn harvests_json_login_bodies() {
        let creds = harvest_credentials(
            Some("application/json"),
            r#"{"Email":"root@example.com","Password":"toor","remember":true}"#,
        )
        .unwrap();
        assert_eq!(creds.username.as_deref(), Some("root@example.com"));
        assert_eq!(creds.password.as_deref(), Some("toor"));
    }

    #[test]
    fn bodies_without_credentials_yield_nothing() {
        assert_eq!(harvest_credentials(None, ""), None);
        assert_eq!(harvest_credentials(None, "q=shoes&page=2"), None);
        assert_eq!(harvest_credentials(Some("application/json"), "not json"), None);
    }
}
