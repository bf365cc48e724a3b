//! Criminal identities.

use serde::{Deserialize, Serialize};

/// The person a bounty is issued for. Identity is the name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criminal {
    /// Unique display name.
    pub name: String,
    /// Faction the criminal flies for.
    pub faction: String,
    /// Alternative names users may type.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Criminal {
    pub fn new(name: impl Into<String>, faction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            faction: faction.into(),
            aliases: Vec::new(),
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    /// Case-insensitive match against the name and every alias.
    pub fn is_called(&self, name: &str) -> bool {
        let name = name.trim();
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

impl PartialEq for Criminal {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Criminal {}

impl std::hash::Hash for Criminal {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Display for Criminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
