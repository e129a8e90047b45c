//! Serialisation of transformed values into request bodies.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DeliveryError, Result};

/// Output encoding for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// `application/json`.
    #[default]
    Json,
    /// `text/plain`; strings are sent unquoted, anything else as JSON text.
    Text,
    /// `application/x-www-form-urlencoded` from a flat object.
    Form,
}

impl Encoding {
    /// Content type sent with bodies of this encoding.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain; charset=utf-8",
            Self::Form => "application/x-www-form-urlencoded",
        }
    }
}

/// Encoded request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedBody {
    /// Body bytes.
    pub body: Bytes,
    /// Value for the `Content-Type` header.
    pub content_type: String,
}

/// Encodes transformed values.
pub trait Formatter: Send + Sync + std::fmt::Debug {
    /// Encodes `value` with `encoding`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::FormatError` if the value cannot be
    /// represented in the encoding.
    fn format(&self, value: &Value, encoding: Encoding) -> Result<FormattedBody>;
}

/// Formatter for the built-in encodings.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFormatter;

impl Formatter for DefaultFormatter {
    fn format(&self, value: &Value, encoding: Encoding) -> Result<FormattedBody> {
        let body = match encoding {
            Encoding::Json => {
                serde_json::to_vec(value).map_err(|e| DeliveryError::format(e.to_string()))?
            },
            Encoding::Text => match value {
                Value::String(text) => text.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            },
            Encoding::Form => encode_form(value)?.into_bytes(),
        };

        Ok(FormattedBody { body: Bytes::from(body), content_type: encoding.content_type().to_string() })
    }
}

fn encode_form(value: &Value) -> Result<String> {
    let Value::Object(fields) = value else {
        return Err(DeliveryError::format("form encoding requires a JSON object"));
    };

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, field) in fields {
        let text = match field {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            Value::Bool(_) | Value::Number(_) => field.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(DeliveryError::format(format!(
                    "form encoding requires scalar values, field '{name}' is nested"
                )));
            },
        };
        serializer.append_pair(name, &text);
    }
    Ok(serializer.finish())
}
