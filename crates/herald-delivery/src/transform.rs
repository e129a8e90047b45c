//! Payload transformation.
//!
//! A `TransformEngine` turns an alert batch, or one alert in the context of
//! its batch, into the value a destination expects. Engines are produced by
//! an `EngineFactory` from a `(kind, spec)` pair and cached by
//! `TemplateCache`, so compilation happens once per distinct spec.

use std::sync::Arc;

use herald_core::{Alert, AlertBatch};
use serde_json::Value;

use crate::error::{DeliveryError, Result};

/// Compiled transform, ready to execute.
pub trait TransformEngine: Send + Sync + std::fmt::Debug {
    /// Transforms a whole batch.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::TransformError` if evaluation fails.
    fn transform(&self, batch: &AlertBatch) -> Result<Value>;

    /// Transforms one alert, with its batch available as context.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::TransformError` if evaluation fails.
    fn transform_alert(&self, alert: &Alert, batch: &AlertBatch) -> Result<Value>;
}

/// Shared handle to a compiled engine.
pub type SharedEngine = Arc<dyn TransformEngine>;

/// Compiles transform specs into engines.
pub trait EngineFactory: Send + Sync + std::fmt::Debug {
    /// Compiles `spec` for the engine `kind`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for an unknown kind and
    /// `DeliveryError::TransformError` for a spec that does not compile.
    fn compile(&self, kind: &str, spec: &str) -> Result<SharedEngine>;
}

/// Factory for the engines that ship with herald.
///
/// | kind          | spec                          |
/// |---------------|-------------------------------|
/// | `passthrough` | ignored                       |
/// | `pointer`     | RFC 6901 JSON pointer         |
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEngineFactory;

impl EngineFactory for BuiltinEngineFactory {
    fn compile(&self, kind: &str, spec: &str) -> Result<SharedEngine> {
        match kind {
            "passthrough" => Ok(Arc::new(PassthroughEngine)),
            "pointer" => Ok(Arc::new(PointerEngine::new(spec)?)),
            other => Err(DeliveryError::configuration(format!("unknown transform kind '{other}'"))),
        }
    }
}

fn to_value<T: serde::Serialize>(input: &T) -> Result<Value> {
    serde_json::to_value(input).map_err(|e| DeliveryError::transform(e.to_string()))
}

/// Document a single alert is evaluated against: the batch's group fields
/// with `alerts` replaced by the one `alert`.
pub fn alert_context(alert: &Alert, batch: &AlertBatch) -> Result<Value> {
    let mut document = to_value(&batch.with_alerts(Vec::new()))?;
    if let Value::Object(fields) = &mut document {
        fields.remove("alerts");
        fields.insert("alert".to_string(), to_value(alert)?);
    }
    Ok(document)
}

/// Forwards the batch, or the single alert, unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEngine;

impl TransformEngine for PassthroughEngine {
    fn transform(&self, batch: &AlertBatch) -> Result<Value> {
        to_value(batch)
    }

    fn transform_alert(&self, alert: &Alert, _batch: &AlertBatch) -> Result<Value> {
        to_value(alert)
    }
}

/// Selects a sub-document with a JSON pointer.
#[derive(Debug, Clone)]
pub struct PointerEngine {
    pointer: String,
}

impl PointerEngine {
    /// Validates and stores the pointer.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::TransformError` if the pointer is neither
    /// empty nor starts with `/`.
    pub fn new(pointer: &str) -> Result<Self> {
        let pointer = pointer.trim();
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(DeliveryError::transform(format!(
                "json pointer '{pointer}' must be empty or start with '/'"
            )));
        }
        Ok(Self { pointer: pointer.to_string() })
    }

    fn select(&self, document: &Value) -> Result<Value> {
        document
            .pointer(&self.pointer)
            .cloned()
            .ok_or_else(|| DeliveryError::transform(format!("json pointer '{}' matched nothing", self.pointer)))
    }
}

impl TransformEngine for PointerEngine {
    fn transform(&self, batch: &AlertBatch) -> Result<Value> {
        self.select(&to_value(batch)?)
    }

    fn transform_alert(&self, alert: &Alert, batch: &AlertBatch) -> Result<Value> {
        self.select(&alert_context(alert, batch)?)
    }
}
