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

//! Shell-glob selection of resource names.

use glob::{MatchOptions, Pattern};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid pattern `{pattern}`: {source}")]
pub struct PatternError {
    pattern: String,
    #[source]
    source: glob::PatternError,
}

const OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    // Resource names are not paths; `*` must be allowed to cross `/`.
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A compiled glob, anchored to the whole candidate.
#[derive(Debug, Clone)]
pub struct Matcher {
    pattern: Pattern,
}

impl Matcher {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let compiled = Pattern::new(pattern).map_err(|source| PatternError {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { pattern: compiled })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.pattern.matches_with(candidate, OPTIONS)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Keeps listing order.
    pub fn select<'a, I>(&self, names: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a String>,
    {
        names
            .into_iter()
            .map(String::as_str)
            .filter(|name| self.matches(name))
            .collect()
    }
}
