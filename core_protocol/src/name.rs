// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};

/// A player's chosen character name. Uniqueness is case-insensitive; the
/// original casing is preserved for display.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PlayerName(ArrayString<16>);

impl PlayerName {
    pub const MIN_LEN: usize = 3;

    /// Accepts ASCII-alphabetic names within length bounds, nothing else.
    /// The login flow re-prompts on [`None`].
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() < Self::MIN_LEN || trimmed.len() > Self::capacity() {
            return None;
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        ArrayString::from(trimmed).ok().map(Self)
    }

    /// Lower-cased form used for uniqueness checks and index keys.
    pub fn canonical(&self) -> String {
        self.0.to_ascii_lowercase().to_string()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub const fn capacity() -> usize {
        16
    }
}

impl Display for PlayerName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::name::PlayerName;

    #[test]
    fn accepts_plain_names() {
        let name = PlayerName::new("  Alice ").unwrap();
        assert_eq!(name.as_str(), "Alice");
        assert_eq!(name.canonical(), "alice");
    }

    #[test]
    fn rejects_garbage() {
        assert!(PlayerName::new("ab").is_none());
        assert!(PlayerName::new("has space").is_none());
        assert!(PlayerName::new("semi;colon").is_none());
        assert!(PlayerName::new("waytoolongforanamefield").is_none());
    }
}
