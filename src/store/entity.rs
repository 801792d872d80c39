//! Typed records held by the entity store.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, ValueRef};

use crate::error::StoreError;

/// Store-assigned identifier of an entity. Stable for the life of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single property value.
///
/// Each variant is persisted with its own type tag, so `Bool(true)`,
/// `Int(1)` and `Text("true")` never compare equal in a store scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

const TAG_TEXT: i64 = 0;
const TAG_INT: i64 = 1;
const TAG_BOOL: i64 = 2;

impl PropertyValue {
    pub(crate) const fn tag(&self) -> i64 {
        match self {
            Self::Text(_) => TAG_TEXT,
            Self::Int(_) => TAG_INT,
            Self::Bool(_) => TAG_BOOL,
        }
    }

    pub(crate) fn from_parts(tag: i64, value: ValueRef<'_>) -> Result<Self, StoreError> {
        match (tag, value) {
            (TAG_TEXT, ValueRef::Text(bytes)) => std::str::from_utf8(bytes)
                .map(|s| Self::Text(s.to_owned()))
                .map_err(|e| StoreError::Corrupt(format!("text property is not UTF-8: {e}"))),
            (TAG_INT, ValueRef::Integer(i)) => Ok(Self::Int(i)),
            (TAG_BOOL, ValueRef::Integer(i)) => Ok(Self::Bool(i != 0)),
            (tag, value) => Err(StoreError::Corrupt(format!(
                "unexpected {:?} value for type tag {tag}",
                value.data_type()
            ))),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl ToSql for PropertyValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Int(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Self::Bool(b) => ToSqlOutput::Borrowed(ValueRef::Integer(i64::from(*b))),
        })
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A fully materialized record: identifier, kind and every property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Entity {
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }
}

/// Records of `a` whose identifier does not appear in `b`, in `a`'s order.
pub fn difference(a: Vec<Entity>, b: &[Entity]) -> Vec<Entity> {
    let exclude: HashSet<EntityId> = b.iter().map(|e| e.id).collect();
    a.into_iter().filter(|e| !exclude.contains(&e.id)).collect()
}
