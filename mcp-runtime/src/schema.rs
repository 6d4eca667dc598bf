//! Declared parameter schemas, the string coercion table and the validator.
//!
//! Callers frequently send every argument as text. Coercion converts strings
//! into the declared primitive type once, before validation; anything it
//! cannot convert is left as-is so validation reports it with a field path.

use netdash_core::error::ToolError;
use regex::Regex;
use serde_json::{Map, Number, Value, json};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("field '{field}' declares an invalid pattern: {message}")]
    InvalidPattern { field: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array(Box<FieldType>),
    Object,
}

impl FieldType {
    pub fn array_of(item: FieldType) -> Self {
        FieldType::Array(Box::new(item))
    }

    fn json_type(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array(_) => "array",
            FieldType::Object => "object",
        }
    }

    fn describe(&self) -> String {
        match self {
            FieldType::Array(item) => format!("an array of {}", item.describe_plural()),
            FieldType::Integer => "an integer".to_string(),
            FieldType::Object => "an object".to_string(),
            other => format!("a {}", other.json_type()),
        }
    }

    fn describe_plural(&self) -> String {
        match self {
            FieldType::Array(_) => "arrays".to_string(),
            other => format!("{}s", other.json_type()),
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array(_) => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    /// Coercion table: only string inputs are converted, and only into
    /// scalar or array types. Failed conversions return the input unchanged.
    fn coerce(&self, value: Value) -> Value {
        let Value::String(raw) = value else {
            return value;
        };
        match self {
            FieldType::Integer => match raw.trim().parse::<i64>() {
                Ok(parsed) => Value::from(parsed),
                Err(_) => Value::String(raw),
            },
            FieldType::Number => match raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
            {
                Some(parsed) => Value::Number(parsed),
                None => Value::String(raw),
            },
            FieldType::Boolean => {
                let trimmed = raw.trim();
                if trimmed.eq_ignore_ascii_case("true") {
                    Value::Bool(true)
                } else if trimmed.eq_ignore_ascii_case("false") {
                    Value::Bool(false)
                } else {
                    Value::String(raw)
                }
            }
            FieldType::Array(item) => coerce_text_array(&raw, item).unwrap_or(Value::String(raw)),
            FieldType::String | FieldType::Object => Value::String(raw),
        }
    }
}

fn coerce_text_array(raw: &str, item: &FieldType) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => Some(Value::Array(
                items.into_iter().map(|entry| item.coerce(entry)).collect(),
            )),
            _ => None,
        };
    }
    let items = trimmed
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| item.coerce(Value::String(part.to_string())))
        .collect();
    Some(Value::Array(items))
}

/// A string constraint, anchored and compiled once when the schema is built.
#[derive(Debug, Clone)]
pub struct FieldPattern {
    source: String,
    anchored: Regex,
}

impl FieldPattern {
    pub fn new(field: &str, source: &str) -> Result<Self, SchemaError> {
        let anchored =
            Regex::new(&format!("^(?:{source})$")).map_err(|err| SchemaError::InvalidPattern {
                field: field.to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            source: source.to_string(),
            anchored,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.anchored.is_match(text)
    }
}

impl PartialEq for FieldPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub required: bool,
    pub description: Option<String>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub pattern: Option<FieldPattern>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub allowed: Vec<Value>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self::new(name, ty, true)
    }

    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self::new(name, ty, false)
    }

    fn new(name: impl Into<String>, ty: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            required,
            description: None,
            minimum: None,
            maximum: None,
            pattern: None,
            min_length: None,
            max_length: None,
            allowed: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Result<Self, SchemaError> {
        self.pattern = Some(FieldPattern::new(&self.name, pattern)?);
        Ok(self)
    }

    pub fn length(mut self, min_length: Option<usize>, max_length: Option<usize>) -> Self {
        self.min_length = min_length;
        self.max_length = max_length;
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    fn check(&self, value: &Value) -> Result<(), ToolError> {
        check_type(&self.name, &self.ty, value)?;

        if !self.allowed.is_empty() && !self.allowed.contains(value) {
            let allowed = self
                .allowed
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ToolError::validation(
                &self.name,
                format!("must be one of: {allowed}"),
            ));
        }

        if let Some(number) = value.as_f64() {
            if let Some(minimum) = self.minimum
                && number < minimum
            {
                return Err(ToolError::validation(
                    &self.name,
                    format!("must be >= {minimum}"),
                ));
            }
            if let Some(maximum) = self.maximum
                && number > maximum
            {
                return Err(ToolError::validation(
                    &self.name,
                    format!("must be <= {maximum}"),
                ));
            }
        }

        let length = match value {
            Value::String(text) => Some(text.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let Some(length) = length {
            if let Some(min_length) = self.min_length
                && length < min_length
            {
                return Err(ToolError::validation(
                    &self.name,
                    format!("length must be >= {min_length}"),
                ));
            }
            if let Some(max_length) = self.max_length
                && length > max_length
            {
                return Err(ToolError::validation(
                    &self.name,
                    format!("length must be <= {max_length}"),
                ));
            }
        }

        if let (Some(pattern), Some(text)) = (&self.pattern, value.as_str())
            && !pattern.is_match(text)
        {
            return Err(ToolError::validation(
                &self.name,
                format!("must match pattern {}", pattern.as_str()),
            ));
        }

        Ok(())
    }

    fn to_json_schema(&self) -> Value {
        let mut schema = type_schema(&self.ty);
        if let Some(description) = &self.description {
            schema["description"] = json!(description);
        }
        if let Some(minimum) = self.minimum {
            schema["minimum"] = json!(minimum);
        }
        if let Some(maximum) = self.maximum {
            schema["maximum"] = json!(maximum);
        }
        if let Some(pattern) = &self.pattern {
            schema["pattern"] = json!(pattern.as_str());
        }
        let (min_key, max_key) = if matches!(self.ty, FieldType::Array(_)) {
            ("minItems", "maxItems")
        } else {
            ("minLength", "maxLength")
        };
        if let Some(min_length) = self.min_length {
            schema[min_key] = json!(min_length);
        }
        if let Some(max_length) = self.max_length {
            schema[max_key] = json!(max_length);
        }
        if !self.allowed.is_empty() {
            schema["enum"] = Value::Array(self.allowed.clone());
        }
        schema
    }
}

fn type_schema(ty: &FieldType) -> Value {
    match ty {
        FieldType::Array(item) => json!({ "type": "array", "items": type_schema(item) }),
        other => json!({ "type": other.json_type() }),
    }
}

fn check_type(path: &str, ty: &FieldType, value: &Value) -> Result<(), ToolError> {
    if !ty.accepts(value) {
        return Err(ToolError::validation(
            path,
            format!("must be {}", ty.describe()),
        ));
    }
    if let (FieldType::Array(item), Value::Array(items)) = (ty, value) {
        for (index, entry) in items.iter().enumerate() {
            check_type(&format!("{path}[{index}]"), item, entry)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    fields: Vec<FieldSpec>,
}

impl ParamSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn coerce(&self, params: &mut Map<String, Value>) {
        for field in &self.fields {
            if let Some(value) = params.remove(&field.name) {
                params.insert(field.name.clone(), field.ty.coerce(value));
            }
        }
    }

    /// Fails fast on the first offending field: unknown names first (in key
    /// order), then declared fields in declaration order.
    pub fn validate(&self, params: &Map<String, Value>) -> Result<(), ToolError> {
        if let Some(unknown) = params.keys().find(|key| !self.declares(key)) {
            return Err(ToolError::validation(unknown, "unknown parameter"));
        }
        for field in &self.fields {
            match params.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(ToolError::validation(&field.name, "is required"));
                }
                None | Some(Value::Null) => {}
                Some(value) => field.check(value)?,
            }
        }
        Ok(())
    }

    pub fn to_json_schema(&self) -> Value {
        let properties = self
            .fields
            .iter()
            .map(|field| (field.name.clone(), field.to_json_schema()))
            .collect::<Map<String, Value>>();
        let required = self
            .fields
            .iter()
            .filter(|field| field.required)
            .map(|field| Value::String(field.name.clone()))
            .collect::<Vec<_>>();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false
        })
    }
}
