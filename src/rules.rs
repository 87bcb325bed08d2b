// vtmctl - CLI for the Virtual Traffic Manager REST API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Enable/disable encoding of request rule references.
//!
//! The traffic manager keeps a virtual server's request rules as plain
//! strings. A rule is disabled when its reference starts with `/`; the rest
//! of the string is the rule's name and never changes when toggled.

use std::fmt;

const DISABLED_MARKER: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    Enabled,
    Disabled,
}

impl RuleState {
    pub fn of(raw: &str) -> Self {
        if is_disabled(raw) {
            RuleState::Disabled
        } else {
            RuleState::Enabled
        }
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleState::Enabled => f.write_str("enabled"),
            RuleState::Disabled => f.write_str("disabled"),
        }
    }
}

/// Requested transition for a rule reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Enable,
    Disable,
}

impl Direction {
    pub fn apply(self, raw: &str) -> String {
        match self {
            Direction::Enable => enable(raw),
            Direction::Disable => disable(raw),
        }
    }

    pub fn target_state(self) -> RuleState {
        match self {
            Direction::Enable => RuleState::Enabled,
            Direction::Disable => RuleState::Disabled,
        }
    }
}

pub fn display_name(raw: &str) -> &str {
    raw.strip_prefix(DISABLED_MARKER).unwrap_or(raw)
}

pub fn is_disabled(raw: &str) -> bool {
    raw.starts_with(DISABLED_MARKER)
}

pub fn disable(raw: &str) -> String {
    if is_disabled(raw) {
        raw.to_string()
    } else {
        format!("{DISABLED_MARKER}{raw}")
    }
}

pub fn enable(raw: &str) -> String {
    display_name(raw).to_string()
}

/// Suffix match on the display name, so `block-tor` also targets a stored
/// `security/block-tor`.
pub fn matches_target(raw: &str, target_suffix: &str) -> bool {
    display_name(raw).ends_with(target_suffix)
}
