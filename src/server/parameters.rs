//! Session parameter (GUC) tracking.
//!
//! A bounded set of session GUCs is tracked per client and per server,
//! so a pooled server can be aligned to the expectations of whichever
//! client it is handed to next.

use bytes::{BufMut, BytesMut};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::VERSION;

static TRACKED_PARAMETERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "client_encoding",
        "DateStyle",
        "TimeZone",
        "standard_conforming_strings",
        "application_name",
    ])
});

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerParameters {
    // BTreeMap keeps SET generation and welcome messages deterministic.
    parameters: BTreeMap<String, String>,
}

impl ServerParameters {
    pub fn new() -> Self {
        ServerParameters {
            parameters: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Parameters presented by the admin console, which has no real
    /// server behind it.
    pub fn admin() -> Self {
        let mut params = ServerParameters::new();
        params.set_param("client_encoding".into(), "UTF8".into(), false);
        params.set_param("DateStyle".into(), "ISO, MDY".into(), false);
        params.set_param("TimeZone".into(), "Etc/UTC".into(), false);
        params.set_param("server_version".into(), VERSION.into(), true);
        params.set_param("server_encoding".into(), "UTF8".into(), true);
        params.set_param("standard_conforming_strings".into(), "on".into(), false);
        params.set_param("integer_datetimes".into(), "on".into(), false);
        params.set_param("application_name".into(), "pg_warden".into(), false);
        params
    }

    /// If `startup` is false, only tracked parameters are stored.
    pub fn set_param(&mut self, mut key: String, value: String, startup: bool) {
        // Startup parameters may come uncapitalized, while
        // ParameterStatus uses canonical keys.
        if key == "timezone" {
            key = "TimeZone".to_string();
        } else if key == "datestyle" {
            key = "DateStyle".to_string();
        };

        if startup || TRACKED_PARAMETERS.contains(key.as_str()) {
            self.parameters.insert(key, value);
        }
    }

    pub fn set_from_hashmap(&mut self, parameters: &HashMap<String, String>, startup: bool) {
        for (key, value) in parameters {
            self.set_param(key.to_string(), value.to_string(), startup);
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.parameters.get(key)
    }

    pub fn get_application_name(&self) -> &str {
        self.parameters
            .get("application_name")
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// Tracked parameters on which `self` (the server) disagrees with
    /// `wanted` (the client). Deterministic order.
    pub fn diff(&self, wanted: &ServerParameters) -> Vec<(String, String)> {
        let mut diff = Vec::new();
        for (key, wanted_value) in &wanted.parameters {
            if !TRACKED_PARAMETERS.contains(key.as_str()) {
                continue;
            }
            match self.parameters.get(key) {
                Some(value) if value == wanted_value => (),
                // A var the server never reported is left alone; there
                // is no default to compare against.
                None => (),
                Some(_) => diff.push((key.clone(), wanted_value.clone())),
            }
        }
        diff
    }

    /// Build the SET statement that aligns a server to the given
    /// differences. Single quotes in values are doubled.
    pub fn set_query(diff: &[(String, String)]) -> String {
        let mut query = String::new();
        for (key, value) in diff {
            let escaped = value.replace('\'', "''");
            query.push_str(&format!("SET {key} TO '{escaped}';"));
        }
        query
    }
}

impl From<&ServerParameters> for BytesMut {
    /// Render as a run of ParameterStatus messages (the welcome
    /// message payload).
    fn from(server_parameters: &ServerParameters) -> Self {
        let mut bytes = BytesMut::new();
        for (key, value) in &server_parameters.parameters {
            bytes.put_u8(b'S');
            bytes.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
            bytes.put_slice(key.as_bytes());
            bytes.put_u8(0);
            bytes.put_slice(value.as_bytes());
            bytes.put_u8(0);
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> ServerParameters {
        let mut p = ServerParameters::new();
        for (k, v) in pairs {
            p.set_param(k.to_string(), v.to_string(), true);
        }
        p
    }

    #[test]
    fn untracked_params_require_startup() {
        let mut p = ServerParameters::new();
        p.set_param("search_path".into(), "public".into(), false);
        assert!(p.get("search_path").is_none());
        p.set_param("search_path".into(), "public".into(), true);
        assert_eq!(p.get("search_path").unwrap(), "public");
    }

    #[test]
    fn startup_key_aliases_are_canonicalized() {
        let mut p = ServerParameters::new();
        p.set_param("timezone".into(), "UTC".into(), false);
        p.set_param("datestyle".into(), "ISO".into(), false);
        assert_eq!(p.get("TimeZone").unwrap(), "UTC");
        assert_eq!(p.get("DateStyle").unwrap(), "ISO");
    }

    #[test]
    fn diff_returns_only_disagreements() {
        let server = params(&[("TimeZone", "UTC"), ("client_encoding", "UTF8")]);
        let client = params(&[("TimeZone", "Europe/Berlin"), ("client_encoding", "UTF8")]);

        let diff = server.diff(&client);
        assert_eq!(
            diff,
            vec![("TimeZone".to_string(), "Europe/Berlin".to_string())]
        );
    }

    #[test]
    fn diff_after_alignment_is_empty() {
        let mut server = params(&[("TimeZone", "UTC")]);
        let client = params(&[("TimeZone", "Europe/Berlin")]);

        for (key, value) in server.diff(&client) {
            server.set_param(key, value, false);
        }
        assert!(server.diff(&client).is_empty());
    }

    #[test]
    fn diff_order_is_deterministic() {
        let server = params(&[
            ("TimeZone", "UTC"),
            ("DateStyle", "ISO"),
            ("application_name", "a"),
        ]);
        let client = params(&[
            ("TimeZone", "X"),
            ("DateStyle", "Y"),
            ("application_name", "b"),
        ]);

        let diff = server.diff(&client);
        let keys: Vec<&str> = diff.iter().map(|(k, _)| k.as_str()).collect();
        // BTreeMap order.
        assert_eq!(keys, vec!["DateStyle", "TimeZone", "application_name"]);
    }

    #[test]
    fn set_query_escapes_quotes() {
        let query = ServerParameters::set_query(&[(
            "application_name".to_string(),
            "it's me".to_string(),
        )]);
        assert_eq!(query, "SET application_name TO 'it''s me';");
    }
}
