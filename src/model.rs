//! Model-backed strategies and the client seam they call through.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::chain::{Attempt, Page, Provenance, Strategy};
use crate::error::PipelineError;
use crate::schema::{
    PaginationQuery, Record, RecordSchema, pagination_prompt, pagination_schema,
    validate_page_urls,
};
use crate::usage::Usage;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// One structured-output request.
#[derive(Debug, Clone)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub instructions: &'a str,
    pub input: &'a str,
    pub schema_name: &'a str,
    pub schema: &'a Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    /// The structured JSON object produced by the model.
    pub value: Value,
    pub usage: Usage,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: &ModelRequest<'_>) -> Result<ModelReply, PipelineError>;
}

/// Per-million-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

const KNOWN_PRICING: &[(&str, Pricing)] = &[
    ("gpt-4o-mini", Pricing::new(0.15, 0.60)),
    ("gpt-4o", Pricing::new(2.50, 10.00)),
    ("gpt-4.1-nano", Pricing::new(0.10, 0.40)),
    ("gpt-4.1-mini", Pricing::new(0.40, 1.60)),
    ("gpt-4.1", Pricing::new(2.00, 8.00)),
    ("o4-mini", Pricing::new(1.10, 4.40)),
];

impl Pricing {
    pub const FREE: Pricing = Pricing::new(0.0, 0.0);

    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    /// Longest known prefix of `model`, so dated snapshots resolve to their family.
    pub fn for_model(model: &str) -> Option<Self> {
        KNOWN_PRICING
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, pricing)| *pricing)
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_mtok + output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// Answers every request with the empty instance of the requested schema.
///
/// Lets the pipeline run end-to-end without credentials or network access.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopModel;

#[async_trait]
impl ModelClient for NoopModel {
    async fn generate(&self, request: &ModelRequest<'_>) -> Result<ModelReply, PipelineError> {
        tracing::debug!(model = request.model, schema = request.schema_name, "noop model call");
        Ok(ModelReply {
            value: empty_instance(request.schema),
            usage: Usage::ZERO,
        })
    }
}

fn empty_instance(schema: &Value) -> Value {
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            let mut object = Map::new();
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (name, property) in properties {
                    object.insert(name.clone(), empty_instance(property));
                }
            }
            Value::Object(object)
        }
        Some("array") => Value::Array(Vec::new()),
        Some("string") => Value::String(String::new()),
        _ => Value::Null,
    }
}

/// Record extraction through a [`ModelClient`].
pub struct ModelRecordStrategy {
    client: Arc<dyn ModelClient>,
    model: String,
}

impl ModelRecordStrategy {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Strategy<RecordSchema, Record> for ModelRecordStrategy {
    fn name(&self) -> &'static str {
        "model_records"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Model
    }

    async fn attempt(
        &self,
        page: &Page<'_>,
        schema: &RecordSchema,
    ) -> Result<Attempt<Record>, PipelineError> {
        let instructions = schema.system_prompt();
        let container = schema.container_schema();
        let reply = self
            .client
            .generate(&ModelRequest {
                model: &self.model,
                instructions: &instructions,
                input: page.raw,
                schema_name: "listings_container",
                schema: &container,
            })
            .await?;
        let records = schema
            .validate(&reply.value)
            .map_err(|err| err.with_usage(reply.usage))?;
        Ok(Attempt::found(records).with_usage(reply.usage))
    }
}

/// Pagination discovery through a [`ModelClient`].
pub struct ModelPaginationStrategy {
    client: Arc<dyn ModelClient>,
    model: String,
}

impl ModelPaginationStrategy {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Strategy<PaginationQuery, String> for ModelPaginationStrategy {
    fn name(&self) -> &'static str {
        "model_pagination"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Model
    }

    async fn attempt(
        &self,
        page: &Page<'_>,
        query: &PaginationQuery,
    ) -> Result<Attempt<String>, PipelineError> {
        let instructions = pagination_prompt(&query.indications, page.url);
        let schema = pagination_schema();
        let reply = self
            .client
            .generate(&ModelRequest {
                model: &self.model,
                instructions: &instructions,
                input: page.raw,
                schema_name: "page_urls_container",
                schema: &schema,
            })
            .await?;
        let urls = validate_page_urls(&reply.value, page.url)
            .map_err(|err| err.with_usage(reply.usage))?;
        Ok(Attempt::found(urls).with_usage(reply.usage))
    }
}
