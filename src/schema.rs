//! Record schema contract shared by the heuristic and model-backed extractors.
//!
//! A [`RecordSchema`] is an ordered list of `(name, type)` pairs built from the
//! user's field selection. The same value renders the JSON schema sent to the
//! model and validates whatever comes back, so there is no per-run type
//! generation.

use std::collections::HashSet;

use serde::Serialize;
use serde::ser::SerializeMap as _;
use serde_json::{Map, Value, json};
use url::Url;

use crate::error::PipelineError;

pub const LISTINGS_KEY: &str = "listings";
pub const PAGE_URLS_KEY: &str = "page_urls";

const EXTRACTION_INSTRUCTIONS: &str = "You are an extraction engine. \
Extract structured listing records from the page content given as input. \
Return pure JSON only, with no text before or after it. \
Use an empty string for any field the page does not provide; never invent values.";

const PAGINATION_INSTRUCTIONS: &str = "You are a pagination detector. \
From the page content given as input, list the URLs of the other result pages of the same listing \
(numbered pages, next/previous links, load-more endpoints). \
Return pure JSON of the form {\"page_urls\": [\"...\"]}. \
Prefer absolute URLs; relative URLs are resolved against the page being analyzed. \
Return an empty list if the page has no pagination.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
}

impl FieldType {
    fn json_type(self) -> &'static str {
        match self {
            FieldType::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSchema {
    fields: Vec<FieldSpec>,
}

impl RecordSchema {
    pub fn new<I, S>(fields: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut specs = Vec::new();
        let mut seen = HashSet::new();
        for raw in fields {
            let name = raw.as_ref().trim();
            if name.is_empty() {
                return Err(PipelineError::Schema("field names must not be blank".to_owned()));
            }
            if !seen.insert(name.to_owned()) {
                return Err(PipelineError::Schema(format!("duplicate field: {name}")));
            }
            specs.push(FieldSpec {
                name: name.to_owned(),
                field_type: FieldType::String,
                description: format!("{name} of the listing"),
            });
        }

        if specs.is_empty() {
            return Err(PipelineError::Schema(
                "at least one field is required".to_owned(),
            ));
        }

        Ok(Self { fields: specs })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Strict structured-output schema for `{"listings": [record, ...]}`.
    pub fn container_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            properties.insert(
                field.name.clone(),
                json!({
                    "type": field.field_type.json_type(),
                    "description": field.description,
                }),
            );
        }
        let required = self
            .fields
            .iter()
            .map(|f| Value::String(f.name.clone()))
            .collect::<Vec<_>>();

        json!({
            "type": "object",
            "properties": {
                LISTINGS_KEY: {
                    "type": "array",
                    "description": "List of listings extracted from the page",
                    "items": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                        "additionalProperties": false,
                    },
                },
            },
            "required": [LISTINGS_KEY],
            "additionalProperties": false,
        })
    }

    pub fn system_prompt(&self) -> String {
        let structure = self
            .fields
            .iter()
            .map(|f| format!("      \"{}\": \"{}\"", f.name, f.field_type.json_type()))
            .collect::<Vec<_>>()
            .join(",\n");

        format!(
            "{EXTRACTION_INSTRUCTIONS}\n\
Strictly follow this schema:\n\
{{\n  \"{LISTINGS_KEY}\": [\n    {{\n{structure}\n    }}\n  ]\n}}\n"
        )
    }

    /// Shape a model response into records with exactly this schema's fields.
    ///
    /// Accepts the `{"listings": [...]}` container or a bare array of records.
    pub fn validate(&self, value: &Value) -> Result<Vec<Record>, PipelineError> {
        let items = match value {
            Value::Array(items) => items,
            Value::Object(map) => match map.get(LISTINGS_KEY) {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(PipelineError::parse(format!(
                        "`{LISTINGS_KEY}` must be an array, got {}",
                        json_kind(other)
                    )));
                }
                None => {
                    return Err(PipelineError::parse(format!(
                        "missing `{LISTINGS_KEY}` array"
                    )));
                }
            },
            other => {
                return Err(PipelineError::parse(format!(
                    "expected object or array, got {}",
                    json_kind(other)
                )));
            }
        };

        items
            .iter()
            .enumerate()
            .map(|(idx, item)| self.record_from_value(idx, item))
            .collect()
    }

    fn record_from_value(&self, idx: usize, item: &Value) -> Result<Record, PipelineError> {
        let Value::Object(map) = item else {
            return Err(PipelineError::parse(format!(
                "listing {idx} must be an object, got {}",
                json_kind(item)
            )));
        };

        let mut record = Record::default();
        for name in self.field_names() {
            let value = match map.get(name) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(other) => {
                    return Err(PipelineError::parse(format!(
                        "listing {idx} field `{name}` must be a string, got {}",
                        json_kind(other)
                    )));
                }
            };
            record.push(name, value);
        }
        Ok(record)
    }
}

/// One extracted record. Field order follows the schema it was built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_any_value(&self) -> bool {
        self.fields.iter().any(|(_, v)| !v.is_empty())
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Persisted form of an extraction result.
#[derive(Debug, Serialize)]
pub struct ListingsContainer<'a> {
    pub listings: &'a [Record],
}

/// Persisted form of a pagination result.
#[derive(Debug, Serialize)]
pub struct PageUrlsContainer<'a> {
    pub page_urls: &'a [String],
}

/// Free-text hints passed alongside a pagination request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationQuery {
    pub indications: String,
}

impl PaginationQuery {
    pub fn new(indications: impl Into<String>) -> Self {
        Self {
            indications: indications.into(),
        }
    }
}

pub fn pagination_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            PAGE_URLS_KEY: {
                "type": "array",
                "items": { "type": "string" },
            },
        },
        "required": [PAGE_URLS_KEY],
        "additionalProperties": false,
    })
}

pub fn pagination_prompt(indications: &str, page_url: &str) -> String {
    let mut prompt = format!("{PAGINATION_INSTRUCTIONS}\nThe page being analyzed is: {page_url}\n");
    if indications.trim().is_empty() {
        prompt.push_str("No special user indications. Just apply the pagination logic.\n");
    } else {
        prompt.push_str("These are the user's indications. Pay attention:\n");
        prompt.push_str(indications.trim());
        prompt.push('\n');
    }
    prompt
}

/// Validate a `{"page_urls": [...]}` response into absolute, deduplicated URLs.
pub fn validate_page_urls(value: &Value, page_url: &str) -> Result<Vec<String>, PipelineError> {
    let items = match value {
        Value::Object(map) => match map.get(PAGE_URLS_KEY) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(PipelineError::parse(format!(
                    "`{PAGE_URLS_KEY}` must be an array, got {}",
                    json_kind(other)
                )));
            }
            None => {
                return Err(PipelineError::parse(format!(
                    "missing `{PAGE_URLS_KEY}` array"
                )));
            }
        },
        other => {
            return Err(PipelineError::parse(format!(
                "expected object, got {}",
                json_kind(other)
            )));
        }
    };

    let base = Url::parse(page_url).ok();
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let Value::String(raw) = item else {
            return Err(PipelineError::parse(format!(
                "page url {idx} must be a string, got {}",
                json_kind(item)
            )));
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let resolved = match &base {
            Some(base) => base.join(raw),
            None => Url::parse(raw),
        };
        let Ok(resolved) = resolved else {
            tracing::debug!(page_url, candidate = raw, "dropping unresolvable page url");
            continue;
        };
        let resolved = resolved.to_string();
        if seen.insert(resolved.clone()) {
            urls.push(resolved);
        }
    }
    Ok(urls)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
