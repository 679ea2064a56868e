//! HSM identities
//!
//! The service logs on with one of two identities: the work user for regular
//! request processing and the setup user for enrolment. Credentials are
//! resolved from configuration with a fixed fallback order:
//! current key, deprecated key, built-in default.

use crate::config::{ConfigKey, ConfigLookup};
use crate::error::{Error, Result};
use crate::secret::SecureString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which HSM user an identity represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Work,
    Setup,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Setup => "setup",
        }
    }

    /// Label used in log lines and display names
    pub fn label(&self) -> &'static str {
        match self {
            Self::Work => "Work",
            Self::Setup => "Setup",
        }
    }

    fn default_username(&self) -> &'static str {
        match self {
            Self::Work => "ERP_WORK",
            Self::Setup => "ERP_SETUP",
        }
    }

    fn username_keys(&self) -> &'static [ConfigKey] {
        match self {
            Self::Work => &[ConfigKey::HsmWorkUsername, ConfigKey::DeprecatedHsmUsername],
            Self::Setup => &[ConfigKey::HsmSetupUsername],
        }
    }

    fn password_keys(&self) -> &'static [ConfigKey] {
        match self {
            Self::Work => &[ConfigKey::HsmWorkPassword, ConfigKey::DeprecatedHsmPassword],
            Self::Setup => &[ConfigKey::HsmSetupPassword],
        }
    }

    fn keyspec_key(&self) -> ConfigKey {
        match self {
            Self::Work => ConfigKey::HsmWorkKeyspec,
            Self::Setup => ConfigKey::HsmSetupKeyspec,
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IdentityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "work" => Ok(Self::Work),
            "setup" => Ok(Self::Setup),
            other => Err(Error::InvalidInput(format!("Unknown identity kind: {}", other))),
        }
    }
}

const DEFAULT_PASSWORD: &str = "password";

/// Credentials for one HSM user
#[derive(Clone)]
pub struct HsmIdentity {
    pub kind: IdentityKind,
    pub username: String,
    pub password: SecureString,
    /// Key specification; takes precedence over the password at logon
    pub keyspec: Option<SecureString>,
}

impl HsmIdentity {
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    /// `"<label> <username>"`; never contains secrets
    pub fn display_name(&self) -> String {
        format!("{} {}", self.label(), self.username)
    }
}

impl fmt::Debug for HsmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmIdentity")
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("keyspec", &self.keyspec.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Resolves identities from configuration
pub struct IdentityResolver<L> {
    lookup: L,
}

impl<L: ConfigLookup> IdentityResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    /// Resolve the credentials for `kind`
    ///
    /// Username and password fall back independently: current key, then the
    /// deprecated key, then the default. The keyspec has no fallback.
    pub fn resolve(&self, kind: IdentityKind) -> HsmIdentity {
        let username = self
            .first_present(kind.username_keys())
            .unwrap_or_else(|| kind.default_username().to_string());
        let password = self
            .first_present(kind.password_keys())
            .unwrap_or_else(|| DEFAULT_PASSWORD.to_string());
        let keyspec = self.present(kind.keyspec_key()).map(SecureString::new);

        HsmIdentity {
            kind,
            username,
            password: SecureString::new(password),
            keyspec,
        }
    }

    pub fn work(&self) -> HsmIdentity {
        self.resolve(IdentityKind::Work)
    }

    pub fn setup(&self) -> HsmIdentity {
        self.resolve(IdentityKind::Setup)
    }

    fn present(&self, key: ConfigKey) -> Option<String> {
        self.lookup.get(key).filter(|value| !value.is_empty())
    }

    fn first_present(&self, keys: &[ConfigKey]) -> Option<String> {
        keys.iter().find_map(|key| self.present(*key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver(pairs: &[(ConfigKey, &str)]) -> IdentityResolver<HashMap<ConfigKey, String>> {
        IdentityResolver::new(
            pairs
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_when_unconfigured() {
        let resolver = resolver(&[]);

        let work = resolver.work();
        assert_eq!(work.username, "ERP_WORK");
        assert_eq!(work.password.as_str(), "password");
        assert!(work.keyspec.is_none());

        let setup = resolver.setup();
        assert_eq!(setup.username, "ERP_SETUP");
        assert_eq!(setup.password.as_str(), "password");
    }

    #[test]
    fn test_deprecated_keys_fill_in_for_work() {
        let resolver = resolver(&[
            (ConfigKey::DeprecatedHsmUsername, "legacy-user"),
            (ConfigKey::DeprecatedHsmPassword, "legacy-pw"),
        ]);

        let work = resolver.work();
        assert_eq!(work.username, "legacy-user");
        assert_eq!(work.password.as_str(), "legacy-pw");
        assert_eq!(work.display_name(), "Work legacy-user");

        // The setup identity never reads the deprecated keys
        assert_eq!(resolver.setup().username, "ERP_SETUP");
    }

    #[test]
    fn test_current_keys_win_independently() {
        let resolver = resolver(&[
            (ConfigKey::HsmWorkUsername, "current-user"),
            (ConfigKey::DeprecatedHsmUsername, "legacy-user"),
            (ConfigKey::DeprecatedHsmPassword, "legacy-pw"),
        ]);

        let work = resolver.work();
        assert_eq!(work.username, "current-user");
        assert_eq!(work.password.as_str(), "legacy-pw");
    }

    #[test]
    fn test_keyspec_has_no_fallback() {
        let resolver = resolver(&[(ConfigKey::HsmSetupKeyspec, "/etc/hsm/setup.key")]);

        assert!(resolver.work().keyspec.is_none());
        assert_eq!(
            resolver.setup().keyspec.as_ref().map(|k| k.as_str()),
            Some("/etc/hsm/setup.key")
        );
    }

    #[test]
    fn test_empty_values_are_absent() {
        let resolver = resolver(&[(ConfigKey::HsmWorkUsername, "")]);
        assert_eq!(resolver.work().username, "ERP_WORK");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = resolver(&[(ConfigKey::HsmWorkPassword, "pw")]);
        let a = resolver.work();
        let b = resolver.work();
        assert_eq!(a.username, b.username);
        assert_eq!(a.password, b.password);
    }

    #[test]
    fn test_debug_and_display_hide_secrets() {
        let resolver = resolver(&[
            (ConfigKey::HsmWorkPassword, "very-secret"),
            (ConfigKey::HsmWorkKeyspec, "spec-secret"),
        ]);
        let work = resolver.work();

        let debug = format!("{:?}", work);
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("spec-secret"));
        assert!(!work.display_name().contains("very-secret"));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("work".parse::<IdentityKind>().unwrap(), IdentityKind::Work);
        assert_eq!("Setup".parse::<IdentityKind>().unwrap(), IdentityKind::Setup);
        assert!("admin".parse::<IdentityKind>().is_err());
    }
}
