//! Masking of known secrets and credential-shaped text

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

/// Known secrets shorter than this are not masked as plain substrings
const MIN_SECRET_LEN: usize = 4;

// `Authorization: Bearer <token>`
static BEARER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bearer\s+)[A-Za-z0-9\-._~+/]{8,}=*").expect("valid bearer regex")
});

// `api_key=...`, `"token": "..."`, `password: ...`
static ASSIGNMENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b((?:api[_-]?key|access[_-]?token|auth[_-]?token|client[_-]?secret|secret|password|token)["']?\s*[=:]\s*["']?)[^\s"'&,;}]+"#,
    )
    .expect("valid assignment regex")
});

// Provider keys of the `sk-...` family
static PROVIDER_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bsk-[A-Za-z0-9_\-]{16,}").expect("valid provider key regex"));

/// Replaces known secret values and generic credential patterns with [`REDACTED`]
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    // Longest first so a secret containing another is masked whole.
    known: Vec<String>,
}

impl SecretMasker {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut known: Vec<String> = secrets
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| s.len() >= MIN_SECRET_LEN)
            .collect();
        known.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        known.dedup();
        Self { known }
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn mask(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for secret in &self.known {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), REDACTED);
            }
        }
        let masked = BEARER_PATTERN.replace_all(&masked, format!("${{1}}{REDACTED}"));
        let masked = ASSIGNMENT_PATTERN.replace_all(&masked, format!("${{1}}{REDACTED}"));
        PROVIDER_KEY_PATTERN.replace_all(&masked, REDACTED).into_owned()
    }

    /// Mask in place, leaving the string untouched when nothing matched
    pub fn mask_in_place(&self, text: &mut String) -> bool {
        let masked = self.mask(text);
        if masked == *text {
            return false;
        }
        *text = masked;
        true
    }

    /// Mask every string inside a JSON value
    pub fn mask_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                self.mask_in_place(s);
            }
            Value::Array(items) => items.iter_mut().for_each(|v| self.mask_value(v)),
            Value::Object(map) => map.values_mut().for_each(|v| self.mask_value(v)),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_known_secrets_anywhere_in_text() {
        let masker = SecretMasker::new(["hunter2-long-secret", "ab"]);
        assert_eq!(masker.known_count(), 1);
        assert_eq!(
            masker.mask("the key is hunter2-long-secret, really"),
            format!("the key is {REDACTED}, really")
        );
        assert_eq!(masker.mask("ab stays"), "ab stays");
    }

    #[test]
    fn masks_credential_shaped_patterns() {
        let masker = SecretMasker::default();
        assert_eq!(
            masker.mask("Authorization: Bearer abcdef123456.xyz"),
            format!("Authorization: Bearer {REDACTED}")
        );
        assert_eq!(
            masker.mask("curl https://x.test/?api_key=12345abc&q=1"),
            format!("curl https://x.test/?api_key={REDACTED}&q=1")
        );
        assert_eq!(
            masker.mask(r#"{"token": "zzz999"}"#),
            format!(r#"{{"token": "{REDACTED}"}}"#)
        );
        assert_eq!(
            masker.mask("use sk-abcdefghijklmnop1234"),
            format!("use {REDACTED}")
        );
        assert_eq!(masker.mask("nothing to see"), "nothing to see");
    }

    #[test]
    fn longer_secret_wins_over_its_prefix() {
        let masker = SecretMasker::new(["secret-value", "secret-value-extended"]);
        assert_eq!(masker.mask("secret-value-extended"), REDACTED);
    }

    #[test]
    fn mask_value_walks_nested_json() {
        let masker = SecretMasker::new(["topsecret"]);
        let mut value = json!({
            "a": ["topsecret", 1, { "b": "x topsecret y" }],
            "c": true,
        });
        masker.mask_value(&mut value);
        assert_eq!(
            value,
            json!({
                "a": [REDACTED, 1, { "b": format!("x {REDACTED} y") }],
                "c": true,
            })
        );
    }
}
