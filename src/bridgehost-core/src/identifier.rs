//! Plugin, accessory and platform identifier parsing.
//!
//! Plugin identifiers come in two shapes: `homebridge-<name>` and the scoped
//! `@scope/homebridge-<name>`, where the scope may itself contain dots.
//! Accessory and platform types are addressed either by a bare local name or by
//! a compound `<plugin identifier>.<local name>`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

/// Prefix every plugin package name must carry.
pub const PLUGIN_NAME_PREFIX: &str = "homebridge-";

static QUALIFIED_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(@[A-Za-z0-9_.\-]+/)?homebridge-[A-Za-z0-9_.\-]+$")
        .expect("invalid plugin identifier regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("'{identifier}' is not a valid plugin identifier")]
    InvalidPlugin { identifier: String },
    #[error("'{identifier}' is not a valid accessory or platform identifier")]
    InvalidType { identifier: String },
}

/// True iff `id` is a well-formed plugin identifier, scoped or not.
pub fn is_qualified_identifier(id: &str) -> bool {
    QUALIFIED_IDENTIFIER.is_match(id)
}

/// Name segment of a plugin identifier. Does not validate.
pub fn extract_name(id: &str) -> &str {
    id.rsplit_once('/').map(|(_, name)| name).unwrap_or(id)
}

/// Scope segment (including the leading `@`) of a plugin identifier, if any.
pub fn extract_scope(id: &str) -> Option<&str> {
    id.rsplit_once('/').map(|(scope, _)| scope)
}

/// Split `<plugin identifier>.<local name>` on its final dot.
///
/// Dots inside a scope never count: the split point must come after the last
/// `/`. Returns `None` when there is no such dot or either side is empty.
pub fn split_compound_identifier(compound: &str) -> Option<(&str, &str)> {
    let name_start = compound.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    let dot = compound[name_start..].rfind('.')? + name_start;
    let (plugin, local) = (&compound[..dot], &compound[dot + 1..]);
    if plugin.is_empty() || local.is_empty() {
        return None;
    }
    Some((plugin, local))
}

/// Plugin identifier portion of a compound accessory/platform identifier.
pub fn plugin_identifier_of(compound: &str) -> Option<&str> {
    split_compound_identifier(compound).map(|(plugin, _)| plugin)
}

/// Local accessory or platform name of a compound identifier.
pub fn local_name_of(compound: &str) -> Option<&str> {
    split_compound_identifier(compound).map(|(_, local)| local)
}

/// A validated plugin identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginIdentifier(String);

impl PluginIdentifier {
    pub fn parse(id: impl Into<String>) -> Result<Self, IdentifierError> {
        let id = id.into();
        if is_qualified_identifier(&id) {
            Ok(Self(id))
        } else {
            Err(IdentifierError::InvalidPlugin { identifier: id })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn name(&self) -> &str {
        extract_name(&self.0)
    }

    pub fn scope(&self) -> Option<&str> {
        extract_scope(&self.0)
    }
}

impl fmt::Display for PluginIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PluginIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PluginIdentifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PluginIdentifier> for String {
    fn from(value: PluginIdentifier) -> Self {
        value.0
    }
}

impl AsRef<str> for PluginIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How a configured accessory or platform type is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeIdentifier {
    /// `<plugin identifier>.<local name>`
    Qualified {
        plugin: PluginIdentifier,
        name: String,
    },
    /// A bare local name, resolved against every loaded plugin.
    Bare(String),
}

impl TypeIdentifier {
    pub fn parse(id: &str) -> Result<Self, IdentifierError> {
        let invalid = || IdentifierError::InvalidType {
            identifier: id.to_string(),
        };
        if id.is_empty() {
            return Err(invalid());
        }
        match split_compound_identifier(id) {
            Some((plugin, name)) => {
                let plugin = PluginIdentifier::parse(plugin).map_err(|_| invalid())?;
                Ok(Self::Qualified {
                    plugin,
                    name: name.to_string(),
                })
            }
            None if id.contains('/') || id.starts_with('@') => Err(invalid()),
            None => Ok(Self::Bare(id.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Qualified { name, .. } => name,
            Self::Bare(name) => name,
        }
    }

    pub fn plugin(&self) -> Option<&PluginIdentifier> {
        match self {
            Self::Qualified { plugin, .. } => Some(plugin),
            Self::Bare(_) => None,
        }
    }
}

impl fmt::Display for TypeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Qualified { plugin, name } => write!(f, "{plugin}.{name}"),
            Self::Bare(name) => f.write_str(name),
        }
    }
}
