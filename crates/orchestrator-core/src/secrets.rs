use std::collections::{BTreeMap, BTreeSet};

pub const REDACTED: &str = "[REDACTED]";

const SECRET_NAME_PATTERNS: &[&str] = &[
    "TOKEN",
    "PASSWORD",
    "API_KEY",
    "API_SECRET",
    "SECRET",
    "PRIVATE_KEY",
    "ACCESS_KEY",
    "SECRET_KEY",
    "CREDENTIAL",
    "GITHUB_PAT",
    "NPM_AUTH",
];

/// Matches environment variable names case-insensitively against a
/// substring list. Only decides what gets redacted in logs.
#[derive(Debug, Clone, Default)]
pub struct SecretClassifier {
    extra_patterns: Vec<String>,
}

impl SecretClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extra_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extra_patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_uppercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_secret(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        SECRET_NAME_PATTERNS.iter().any(|p| upper.contains(p))
            || self.extra_patterns.iter().any(|p| upper.contains(p.as_str()))
    }

    pub fn classify<'a, I>(&self, names: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        names
            .into_iter()
            .filter(|n| self.is_secret(n))
            .cloned()
            .collect()
    }

    /// Copy of `env` with every secret value replaced by [`REDACTED`].
    pub fn redact_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        env.iter()
            .map(|(k, v)| {
                let value = if self.is_secret(k) {
                    REDACTED.to_string()
                } else {
                    v.clone()
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Names in `env` that the default classifier considers secret.
pub fn classify(env: &BTreeMap<String, String>) -> BTreeSet<String> {
    SecretClassifier::new().classify(env.keys())
}
