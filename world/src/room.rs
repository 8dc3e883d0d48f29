// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::id::RoomId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    South,
    East,
    West,
    Up,
    Down,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Self::North,
        Self::South,
        Self::East,
        Self::West,
        Self::Up,
        Self::Down,
    ];

    /// Accepts full names and single-letter abbreviations.
    pub fn parse(word: &str) -> Option<Self> {
        Some(match word.to_ascii_lowercase().as_str() {
            "north" | "n" => Self::North,
            "south" | "s" => Self::South,
            "east" | "e" => Self::East,
            "west" | "w" => Self::West,
            "up" | "u" => Self::Up,
            "down" | "d" => Self::Down,
            _ => return None,
        })
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::North => Self::South,
            Self::South => Self::North,
            Self::East => Self::West,
            Self::West => Self::East,
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::North => "north",
            Self::South => "south",
            Self::East => "east",
            Self::West => "west",
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

/// Interactive fixtures of a room. Doors/levers keep their toggled state in
/// the engine's feature-state map, not here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Feature {
    Door { name: String, to: RoomId },
    Container { id: String, name: String },
    Lever { name: String },
    Sign { name: String, text: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub title: String,
    pub description: String,
    /// Exits within the owning zone.
    pub exits: HashMap<Direction, RoomId>,
    /// Exits that cross a zone boundary; taking one may trigger handoff.
    pub remote_exits: HashMap<Direction, RoomId>,
    pub features: Vec<Feature>,
}

impl Room {
    pub fn new(id: RoomId, title: &str, description: &str) -> Self {
        Self {
            id,
            title: title.to_owned(),
            description: description.to_owned(),
            exits: HashMap::new(),
            remote_exits: HashMap::new(),
            features: Vec::new(),
        }
    }

    /// Any exit in the given direction, local first.
    pub fn exit(&self, direction: Direction) -> Option<&RoomId> {
        self.exits
            .get(&direction)
            .or_else(|| self.remote_exits.get(&direction))
    }

    pub fn exit_summary(&self) -> String {
        let mut names: Vec<String> = Direction::ALL
            .iter()
            .filter(|d| self.exit(**d).is_some())
            .map(|d| d.to_string())
            .collect();
        if names.is_empty() {
            names.push("none".to_owned());
        }
        names.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use crate::room::{Direction, Room};
    use core_protocol::id::RoomId;

    #[test]
    fn direction_parse_and_opposite() {
        assert_eq!(Direction::parse("N"), Some(Direction::North));
        assert_eq!(Direction::parse("down"), Some(Direction::Down));
        assert_eq!(Direction::parse("sideways"), None);
        assert_eq!(Direction::North.opposite(), Direction::South);
    }

    #[test]
    fn remote_exit_resolves() {
        let mut room = Room::new(RoomId::new("hub", "gate"), "Gate", "A gate.");
        room.remote_exits
            .insert(Direction::North, RoomId::new("forest", "edge"));
        assert_eq!(
            room.exit(Direction::North).unwrap().as_str(),
            "forest:edge"
        );
        assert_eq!(room.exit_summary(), "north");
    }
}
