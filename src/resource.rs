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

//! Remote resources as fetched from the configuration API.
//!
//! Only a handful of properties are interpreted; the rest of the document is
//! carried through untouched so a write-back never drops settings this tool
//! does not know about.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    VirtualServers,
    Pools,
}

impl Collection {
    /// Path segment under `config/active/`.
    pub fn path(self) -> &'static str {
        match self {
            Collection::VirtualServers => "virtual_servers",
            Collection::Pools => "pools",
        }
    }

    pub fn noun(self) -> &'static str {
        match self {
            Collection::VirtualServers => "vserver",
            Collection::Pools => "pool",
        }
    }
}

/// An integer-seconds property living at `properties.<section>.<key>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarField {
    pub collection: Collection,
    pub section: &'static str,
    pub key: &'static str,
}

impl ScalarField {
    pub fn path(&self) -> String {
        format!("{}.{}", self.section, self.key)
    }
}

pub const CONNECTION_TIMEOUT: ScalarField = ScalarField {
    collection: Collection::VirtualServers,
    section: "connection",
    key: "timeout",
};

pub const MAX_REPLY_TIME: ScalarField = ScalarField {
    collection: Collection::Pools,
    section: "connection",
    key: "max_reply_time",
};

const RULES_SECTION: &str = "basic";
const RULES_KEY: &str = "request_rules";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("{resource}: property `{field}` is missing")]
    Missing { resource: String, field: String },
    #[error("{resource}: property `{field}` has unexpected type (expected {expected})")]
    WrongType {
        resource: String,
        field: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub collection: Collection,
    pub name: String,
    properties: Map<String, Value>,
}

impl Resource {
    pub fn new(collection: Collection, name: impl Into<String>, properties: Map<String, Value>) -> Self {
        Self {
            collection,
            name: name.into(),
            properties,
        }
    }

    /// Builds a resource from a `{"properties": {...}}` document.
    pub fn from_document(
        collection: Collection,
        name: impl Into<String>,
        document: Value,
    ) -> Result<Self, FieldError> {
        let name = name.into();
        match document {
            Value::Object(mut root) => match root.remove("properties") {
                Some(Value::Object(properties)) => Ok(Self::new(collection, name, properties)),
                Some(_) => Err(FieldError::WrongType {
                    resource: name,
                    field: "properties".into(),
                    expected: "object",
                }),
                None => Err(FieldError::Missing {
                    resource: name,
                    field: "properties".into(),
                }),
            },
            _ => Err(FieldError::WrongType {
                resource: name,
                field: "properties".into(),
                expected: "object",
            }),
        }
    }

    pub fn to_document(&self) -> Value {
        serde_json::json!({ "properties": self.properties })
    }

    pub fn scalar(&self, field: &ScalarField) -> Result<u64, FieldError> {
        let value = self.lookup(field.section, field.key)?;
        value.as_u64().ok_or_else(|| self.wrong_type(field.section, field.key, "unsigned integer"))
    }

    pub fn set_scalar(&mut self, field: &ScalarField, value: u64) {
        self.section_mut(field.section)
            .insert(field.key.to_string(), Value::from(value));
    }

    pub fn request_rules(&self) -> Result<Vec<String>, FieldError> {
        let value = self.lookup(RULES_SECTION, RULES_KEY)?;
        let items = value
            .as_array()
            .ok_or_else(|| self.wrong_type(RULES_SECTION, RULES_KEY, "array of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.wrong_type(RULES_SECTION, RULES_KEY, "array of strings"))
            })
            .collect()
    }

    pub fn set_request_rules(&mut self, rules: Vec<String>) {
        self.section_mut(RULES_SECTION)
            .insert(RULES_KEY.to_string(), Value::from(rules));
    }

    fn lookup(&self, section: &str, key: &str) -> Result<&Value, FieldError> {
        self.properties
            .get(section)
            .and_then(|s| s.get(key))
            .ok_or_else(|| FieldError::Missing {
                resource: self.name.clone(),
                field: format!("{section}.{key}"),
            })
    }

    fn section_mut(&mut self, section: &str) -> &mut Map<String, Value> {
        let entry = self
            .properties
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("section was just replaced with an object"),
        }
    }

    fn wrong_type(&self, section: &str, key: &str, expected: &'static str) -> FieldError {
        FieldError::WrongType {
            resource: self.name.clone(),
            field: format!("{section}.{key}"),
            expected,
        }
    }
}
