use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{BackendError, Result};

/// Environment variable pair consulted when explicit credentials are blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvVars {
    pub account: &'static str,
    pub secret: &'static str,
}

pub const AZURE_ENV: EnvVars = EnvVars {
    account: "AZURE_STORAGE_ACCOUNT",
    secret: "AZURE_STORAGE_ACCESS_KEY",
};

pub const S3_ENV: EnvVars = EnvVars {
    account: "AWS_ACCESS_KEY_ID",
    secret: "AWS_SECRET_ACCESS_KEY",
};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Explicit non-blank values win; each blank field falls back to its
    /// environment variable.
    pub fn resolve(
        account: &str,
        secret: &str,
        vars: EnvVars,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let pick = |explicit: &str, var: &str| {
            let explicit = explicit.trim();
            if explicit.is_empty() {
                lookup(var)
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            } else {
                Some(explicit.to_string())
            }
        };
        match (pick(account, vars.account), pick(secret, vars.secret)) {
            (Some(account), Some(secret)) => Ok(Self { account, secret }),
            _ => Err(BackendError::MissingCredentials {
                account_var: vars.account,
                secret_var: vars.secret,
            }),
        }
    }

    pub fn resolve_env(account: &str, secret: &str, vars: EnvVars) -> Result<Self> {
        Self::resolve(account, secret, vars, |name| std::env::var(name).ok())
    }

    /// Azure shared keys are base64; reject anything else before the first request.
    pub fn ensure_base64_secret(&self) -> Result<()> {
        STANDARD
            .decode(&self.secret)
            .map(|_| ())
            .map_err(|e| BackendError::InvalidConfig(format!("malformed access key: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn explicit_wins_over_environment() {
        let lookup = env(&[
            ("AZURE_STORAGE_ACCOUNT", "env-account"),
            ("AZURE_STORAGE_ACCESS_KEY", "env-key"),
        ]);
        let creds = Credentials::resolve("acct", "key", AZURE_ENV, lookup).unwrap();
        assert_eq!(creds.account, "acct");
        assert_eq!(creds.secret, "key");
    }

    #[test]
    fn blank_fields_fall_back_to_environment() {
        let lookup = env(&[
            ("AZURE_STORAGE_ACCOUNT", "env-account"),
            ("AZURE_STORAGE_ACCESS_KEY", "env-key"),
        ]);
        let creds = Credentials::resolve("", "  ", AZURE_ENV, &lookup).unwrap();
        assert_eq!(creds.account, "env-account");
        assert_eq!(creds.secret, "env-key");

        let creds = Credentials::resolve("acct", "", AZURE_ENV, &lookup).unwrap();
        assert_eq!(creds.account, "acct");
        assert_eq!(creds.secret, "env-key");
    }

    #[test]
    fn missing_everywhere_is_an_explicit_error() {
        let err = Credentials::resolve("", "", S3_ENV, env(&[])).unwrap_err();
        assert!(matches!(
            err,
            BackendError::MissingCredentials {
                account_var: "AWS_ACCESS_KEY_ID",
                secret_var: "AWS_SECRET_ACCESS_KEY",
            }
        ));

        let half = env(&[("AWS_ACCESS_KEY_ID", "id")]);
        let err = Credentials::resolve("", "", S3_ENV, half).unwrap_err();
        assert!(matches!(err, BackendError::MissingCredentials { .. }));
    }

    #[test]
    fn debug_hides_secret() {
        let creds = Credentials {
            account: "a".into(),
            secret: "hunter2".into(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn base64_secret_check() {
        let good = Credentials {
            account: "a".into(),
            secret: STANDARD.encode(b"0123456789abcdef"),
        };
        assert!(good.ensure_base64_secret().is_ok());
        let bad = Credentials {
            account: "a".into(),
            secret: "not base64!".into(),
        };
        assert!(matches!(
            bad.ensure_base64_secret(),
            Err(BackendError::InvalidConfig(_))
        ));
    }
}
