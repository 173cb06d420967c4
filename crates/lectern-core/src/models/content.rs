//! Typed views over the opaque field maps of sermons and series

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{EntityType, FieldMap};

/// Content type with a typed field representation
pub trait Content: Serialize + DeserializeOwned {
    const ENTITY_TYPE: EntityType;

    /// Convert to the field map stored on a record
    fn to_fields(&self) -> Result<FieldMap> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect()),
            _ => Err(Error::InvalidInput(format!(
                "{} did not serialize to an object",
                Self::ENTITY_TYPE
            ))),
        }
    }

    /// Read from a record's field map, ignoring unknown fields
    fn from_fields(fields: &FieldMap) -> Result<Self> {
        let map: serde_json::Map<String, Value> = fields
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(map))?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SermonStatus {
    #[default]
    Draft,
    Ready,
    Preached,
    Archived,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
    Public,
}

/// A sermon manuscript
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sermon {
    pub title: String,
    /// Markdown body
    pub body: String,
    pub tags: Vec<String>,
    pub status: SermonStatus,
    pub visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preached_on: Option<NaiveDate>,
}

impl Sermon {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = normalize_tags(tags);
        self
    }
}

impl Content for Sermon {
    const ENTITY_TYPE: EntityType = EntityType::Sermon;
}

/// A series grouping sermons
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Series {
    pub title: String,
    pub description: String,
}

impl Series {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
        }
    }
}

impl Content for Series {
    const ENTITY_TYPE: EntityType = EntityType::Series;
}

/// Lowercase, trim and dedupe tags, keeping first-seen order
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim().trim_start_matches('#').to_lowercase();
        if !tag.is_empty() && !normalized.contains(&tag) {
            normalized.push(tag);
        }
    }
    normalized
}
