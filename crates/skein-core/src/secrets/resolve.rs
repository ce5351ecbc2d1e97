//! `{{secret:NAME}}` placeholder resolution

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

/// Substituted for placeholders naming an unknown secret
pub const UNKNOWN_SECRET: &str = "[UNKNOWN_SECRET]";

static PLACEHOLDER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\{\{\s*secret\s*:\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid placeholder regex")
});

/// Counts from one resolution pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub resolved: usize,
    /// Names that had no matching secret, lowercased
    pub missing: Vec<String>,
}

/// Replaces `{{secret:NAME}}` tokens with secret values. Names match
/// case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct SecretResolver {
    secrets: HashMap<String, String>,
}

impl SecretResolver {
    pub fn new<I, K, V>(secrets: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let secrets = secrets
            .into_iter()
            .map(|(name, value)| (name.as_ref().trim().to_lowercase(), value.into()))
            .collect();
        Self { secrets }
    }

    pub fn contains_placeholder(text: &str) -> bool {
        PLACEHOLDER_PATTERN.is_match(text)
    }

    pub fn resolve_str(&self, text: &str, outcome: &mut ResolveOutcome) -> String {
        PLACEHOLDER_PATTERN
            .replace_all(text, |caps: &Captures<'_>| {
                let name = caps[1].to_lowercase();
                match self.secrets.get(&name) {
                    Some(value) => {
                        outcome.resolved += 1;
                        value.clone()
                    }
                    None => {
                        if !outcome.missing.contains(&name) {
                            outcome.missing.push(name);
                        }
                        UNKNOWN_SECRET.to_string()
                    }
                }
            })
            .into_owned()
    }

    /// Resolve every placeholder inside an arbitrarily nested JSON value
    pub fn resolve_value(&self, value: &mut Value) -> ResolveOutcome {
        let mut outcome = ResolveOutcome::default();
        self.walk(value, &mut outcome);
        outcome
    }

    fn walk(&self, value: &mut Value, outcome: &mut ResolveOutcome) {
        match value {
            Value::String(s) if Self::contains_placeholder(s) => {
                *s = self.resolve_str(s, outcome);
            }
            Value::Array(items) => items.iter_mut().for_each(|v| self.walk(v, outcome)),
            Value::Object(map) => map.values_mut().for_each(|v| self.walk(v, outcome)),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> SecretResolver {
        SecretResolver::new([("GitHub", "gh-token-123"), ("openai", "sk-test")])
    }

    #[test]
    fn resolves_case_insensitively_in_nested_arguments() {
        let mut args = json!({
            "headers": { "Authorization": "token {{secret:github}}" },
            "list": ["{{ SECRET:OpenAI }}", 3, null],
            "plain": "no placeholders",
        });
        let outcome = resolver().resolve_value(&mut args);

        assert_eq!(outcome.resolved, 2);
        assert!(outcome.missing.is_empty());
        assert_eq!(args["headers"]["Authorization"], "token gh-token-123");
        assert_eq!(args["list"][0], "sk-test");
        assert_eq!(args["list"][1], 3);
        assert_eq!(args["plain"], "no placeholders");
    }

    #[test]
    fn unknown_names_become_a_placeholder() {
        let mut args = json!(["{{secret:nope}} and {{secret:NOPE}}"]);
        let outcome = resolver().resolve_value(&mut args);
        assert_eq!(outcome.resolved, 0);
        assert_eq!(outcome.missing, vec!["nope".to_string()]);
        assert_eq!(args[0], format!("{UNKNOWN_SECRET} and {UNKNOWN_SECRET}"));
    }
}
