/*!
Credential material and the resolvers that produce it.

A [`Credential`] only exists between resolution and the end of a single
transport call. It is not serializable, its `Debug` output is redacted and
its secret bytes are wiped on drop.
*/

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::device::{CredentialRef, CredentialScheme};
use crate::{Result, VaultError};

/// A string that is wiped from memory on drop and never printed
#[derive(Clone, Zeroize, ZeroizeOnDrop, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Self(secret.into())
    }

    /// Borrow the secret for the duration of a protocol call
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(<redacted>)")
    }
}

/// Resolved authentication material for one transport call
#[derive(Clone, Debug)]
pub enum Credential {
    Password {
        username: String,
        password: SecretString,
    },
    Token {
        token: SecretString,
    },
    PrivateKey {
        username: String,
        key_path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

impl Credential {
    pub fn password<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self::Password {
            username: username.into(),
            password: SecretString::new(password),
        }
    }

    pub fn token<T: Into<String>>(token: T) -> Self {
        Self::Token {
            token: SecretString::new(token),
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Self::Password { username, .. } | Self::PrivateKey { username, .. } => Some(username),
            Self::Token { .. } => None,
        }
    }

    /// Short label for audit logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Token { .. } => "token",
            Self::PrivateKey { .. } => "private_key",
        }
    }
}

/// Turns a [`CredentialRef`] into secret material
#[cfg_attr(test, mockall::automock)]
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, reference: &CredentialRef) -> Option<Credential>;
}

/// Reads `<PREFIX>_USERNAME` with `_PASSWORD` or `_KEY_PATH`, or `<PREFIX>_TOKEN`
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialResolver;

impl EnvCredentialResolver {
    fn lookup(&self, var: &str) -> Option<String> {
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

impl CredentialResolver for EnvCredentialResolver {
    fn resolve(&self, reference: &CredentialRef) -> Option<Credential> {
        if reference.scheme() != CredentialScheme::Env {
            return None;
        }
        let prefix = reference.key();
        if let Some(token) = self.lookup(&format!("{prefix}_TOKEN")) {
            return Some(Credential::token(token));
        }
        let username = self.lookup(&format!("{prefix}_USERNAME"))?;
        if let Some(password) = self.lookup(&format!("{prefix}_PASSWORD")) {
            return Some(Credential::password(username, password));
        }
        let key_path = self.lookup(&format!("{prefix}_KEY_PATH"))?;
        Some(Credential::PrivateKey {
            username,
            key_path: PathBuf::from(key_path),
            passphrase: self
                .lookup(&format!("{prefix}_KEY_PASSPHRASE"))
                .map(SecretString::new),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SecretEntry {
    Token {
        token: SecretString,
    },
    Password {
        username: String,
        password: SecretString,
    },
    PrivateKey {
        username: String,
        key_path: PathBuf,
        #[serde(default)]
        passphrase: Option<SecretString>,
    },
}

/// Secrets loaded from a YAML map of `key -> {username, password}` / `{token}` / `{username, key_path}`
pub struct SecretsFileResolver {
    entries: HashMap<String, SecretEntry>,
}

impl SecretsFileResolver {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            VaultError::config(format!(
                "Failed to read secrets file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let entries: HashMap<String, SecretEntry> = serde_yaml::from_str(raw)?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CredentialResolver for SecretsFileResolver {
    fn resolve(&self, reference: &CredentialRef) -> Option<Credential> {
        if reference.scheme() != CredentialScheme::File {
            return None;
        }
        let credential = match self.entries.get(reference.key())? {
            SecretEntry::Token { token } => Credential::Token {
                token: token.clone(),
            },
            SecretEntry::Password { username, password } => Credential::Password {
                username: username.clone(),
                password: password.clone(),
            },
            SecretEntry::PrivateKey {
                username,
                key_path,
                passphrase,
            } => Credential::PrivateKey {
                username: username.clone(),
                key_path: key_path.clone(),
                passphrase: passphrase.clone(),
            },
        };
        Some(credential)
    }
}

/// Tries each resolver in order
#[derive(Default)]
pub struct ChainResolver {
    resolvers: Vec<Box<dyn CredentialResolver>>,
}

impl ChainResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R: CredentialResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }
}

impl CredentialResolver for ChainResolver {
    fn resolve(&self, reference: &CredentialRef) -> Option<Credential> {
        self.resolvers.iter().find_map(|r| r.resolve(reference))
    }
}

/// Fixed map of reference -> credential, for embedding and tests
#[derive(Default, Clone)]
pub struct StaticCredentialResolver {
    entries: HashMap<String, Credential>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, reference: &CredentialRef, credential: Credential) -> Self {
        self.entries.insert(reference.to_string(), credential);
        self
    }
}

impl CredentialResolver for StaticCredentialResolver {
    fn resolve(&self, reference: &CredentialRef) -> Option<Credential> {
        self.entries.get(&reference.to_string()).cloned()
    }
}
