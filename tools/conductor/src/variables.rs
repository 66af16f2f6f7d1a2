use crate::logging::append_run_log;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Per-performance captured values, keyed by symbolic name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableStore {
    values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub text: String,
    pub unresolved: Vec<String>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(defaults: &BTreeMap<String, String>) -> Self {
        Self {
            values: defaults.clone(),
        }
    }

    /// Store `value` under `name`. A second write for the same name wins and is
    /// logged at warn level.
    pub fn set(&mut self, name: &str, value: &str) {
        if let Some(previous) = self.values.insert(name.to_string(), value.to_string()) {
            if previous != value {
                append_run_log(
                    "warn",
                    "variables.overwrite",
                    json!({
                        "name": name,
                        "previous": previous,
                        "value": value,
                    }),
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace `{{name}}` placeholders with stored values. Placeholders naming
    /// nothing in the store are left verbatim and reported in `unresolved`.
    pub fn substitute(&self, template: &str) -> Substitution {
        let mut unresolved = Vec::new();
        let Some(pattern) = placeholder_pattern() else {
            return Substitution {
                text: template.to_string(),
                unresolved,
            };
        };
        let text = pattern
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                match self.values.get(name) {
                    Some(value) => value.clone(),
                    None => {
                        unresolved.push(name.to_string());
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();
        Substitution { text, unresolved }
    }
}

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").ok())
        .as_ref()
}

#[cfg(test)]
mod tests {
    use super::VariableStore;
    use std::collections::BTreeMap;

    #[test]
    fn later_writes_win() {
        let mut store = VariableStore::new();
        store.set("corrId", "abc123");
        store.set("corrId", "def456");
        assert_eq!(store.get("corrId"), Some("def456"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn substitution_resolves_known_names_and_reports_the_rest() {
        let mut store = VariableStore::seeded(&BTreeMap::from([(
            "room".to_string(),
            "lobby@conference.example.com".to_string(),
        )]));
        store.set("corrId", "abc123");

        let out = store.substitute("<iq id='{{ corrId }}' to='{{room}}'><q>{{missing}}</q></iq>");
        assert_eq!(
            out.text,
            "<iq id='abc123' to='lobby@conference.example.com'><q>{{missing}}</q></iq>"
        );
        assert_eq!(out.unresolved, vec!["missing".to_string()]);
    }

    #[test]
    fn text_without_placeholders_is_untouched() {
        let store = VariableStore::new();
        let out = store.substitute("<presence/>");
        assert_eq!(out.text, "<presence/>");
        assert!(out.unresolved.is_empty());
    }
}
