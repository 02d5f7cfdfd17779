use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use thiserror::Error;

/// Capability flags selecting which subsystems the process brings up.
///
/// Flags combine freely (`AppMode::DAEMON | AppMode::GUI`). In configuration
/// files the set is written as a list of names: `mode = ["daemon", "gui"]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct AppMode(u8);

const NAMES: [(&str, AppMode); 3] = [
    ("daemon", AppMode::DAEMON),
    ("gui", AppMode::GUI),
    ("cli", AppMode::CLI),
];

impl AppMode {
    pub const DAEMON: AppMode = AppMode(0b001);
    pub const GUI: AppMode = AppMode(0b010);
    pub const CLI: AppMode = AppMode(0b100);

    pub const fn empty() -> Self {
        AppMode(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every flag of `other` is set.
    pub const fn contains(self, other: AppMode) -> bool {
        !other.is_empty() && self.0 & other.0 == other.0
    }

    /// True when at least one flag of `other` is set.
    pub const fn intersects(self, other: AppMode) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: AppMode) -> Self {
        AppMode(self.0 | other.0)
    }

    pub const fn without(self, other: AppMode) -> Self {
        AppMode(self.0 & !other.0)
    }

    pub fn names(self) -> Vec<&'static str> {
        NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl BitOr for AppMode {
    type Output = AppMode;

    fn bitor(self, rhs: AppMode) -> AppMode {
        self.union(rhs)
    }
}

impl BitOrAssign for AppMode {
    fn bitor_assign(&mut self, rhs: AppMode) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppMode({})", self)
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join("+"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown app mode '{0}' (expected daemon, gui or cli)")]
pub struct UnknownAppMode(pub String);

impl FromStr for AppMode {
    type Err = UnknownAppMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        NAMES
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, flag)| *flag)
            .ok_or_else(|| UnknownAppMode(s.to_string()))
    }
}

impl TryFrom<Vec<String>> for AppMode {
    type Error = UnknownAppMode;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names
            .iter()
            .try_fold(AppMode::empty(), |mode, name| Ok(mode | name.parse::<AppMode>()?))
    }
}

impl From<AppMode> for Vec<String> {
    fn from(mode: AppMode) -> Self {
        mode.names().into_iter().map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_independently() {
        let mode = AppMode::DAEMON | AppMode::GUI;
        assert!(mode.contains(AppMode::DAEMON));
        assert!(mode.contains(AppMode::GUI));
        assert!(!mode.contains(AppMode::CLI));
        assert!(mode.intersects(AppMode::GUI | AppMode::CLI));
        assert!(!AppMode::CLI.intersects(AppMode::DAEMON | AppMode::GUI));
        assert_eq!(mode.without(AppMode::GUI), AppMode::DAEMON);
    }

    #[test]
    fn empty_mode_contains_nothing() {
        assert!(!AppMode::empty().contains(AppMode::empty()));
        assert_eq!(AppMode::empty().to_string(), "none");
    }

    #[test]
    fn parses_name_lists() {
        let mode = AppMode::try_from(vec!["Daemon".to_string(), "cli".to_string()]).unwrap();
        assert_eq!(mode, AppMode::DAEMON | AppMode::CLI);
        assert_eq!(mode.to_string(), "daemon+cli");
        assert!(AppMode::try_from(vec!["tray".to_string()]).is_err());
    }
}
