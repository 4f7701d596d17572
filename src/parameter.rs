use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;

use crate::errors::{Error, Result};

/// How a stored raw string turns into the value handed to a group or route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterType {
    /// One of a fixed set of options. Storage does not check membership.
    Choice { options: Vec<String> },
    List { separator: String },
    /// Free-form multi-line text; resolves like a plain parameter.
    TextField,
}

impl ParameterType {
    pub fn choice<I, S>(options: I) -> ParameterType
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        return ParameterType::Choice {
            options: options.into_iter().map(Into::into).collect(),
        };
    }

    pub fn list() -> ParameterType {
        return ParameterType::list_with_separator(",");
    }

    pub fn list_with_separator(separator: &str) -> ParameterType {
        return ParameterType::List {
            separator: separator.to_string(),
        };
    }

    pub fn process_value(&self, raw: &str) -> ParamValue {
        return match self {
            ParameterType::Choice { .. } | ParameterType::TextField => {
                ParamValue::Text(raw.to_string())
            }
            ParameterType::List { separator } => {
                if raw.trim().is_empty() {
                    ParamValue::List(Vec::new())
                } else if separator.is_empty() {
                    ParamValue::List(vec![raw.to_string()])
                } else {
                    ParamValue::List(raw.split(separator.as_str()).map(str::to_string).collect())
                }
            }
        };
    }

    pub fn options(&self) -> Option<&[String]> {
        return match self {
            ParameterType::Choice { options } => Some(options),
            _ => None,
        };
    }

    pub fn type_name(&self) -> &'static str {
        return match self {
            ParameterType::Choice { .. } => "choice",
            ParameterType::List { .. } => "list",
            ParameterType::TextField => "text",
        };
    }
}

/// A resolved parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn is_empty(&self) -> bool {
        return match self {
            ParamValue::Text(text) => text.is_empty(),
            ParamValue::List(items) => items.is_empty(),
        };
    }

    pub fn as_text(&self) -> Option<&str> {
        return match self {
            ParamValue::Text(text) => Some(text),
            ParamValue::List(_) => None,
        };
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        return match self {
            ParamValue::Text(text) => write!(f, "{}", text),
            ParamValue::List(items) => write!(f, "[{}]", items.join(", ")),
        };
    }
}

/// Produces a fresh candidate value for a parameter on demand.
pub trait Generator: Send + Sync {
    fn generate(&self) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinGenerator {
    Uuid,
    Timestamp,
    Digits(usize),
}

impl BuiltinGenerator {
    pub fn from_name(name: &str) -> Option<BuiltinGenerator> {
        return match name {
            "uuid" => Some(BuiltinGenerator::Uuid),
            "timestamp" => Some(BuiltinGenerator::Timestamp),
            "digits" => Some(BuiltinGenerator::Digits(8)),
            _ => None,
        };
    }
}

impl Generator for BuiltinGenerator {
    fn generate(&self) -> Result<String> {
        let value = match self {
            BuiltinGenerator::Uuid => uuid::Uuid::new_v4().to_string(),
            BuiltinGenerator::Timestamp => chrono::Utc::now().to_rfc3339(),
            BuiltinGenerator::Digits(len) => random_digits(*len),
        };
        return Ok(value);
    }
}

pub fn random_digits(len: usize) -> String {
    let mut rng = rand::thread_rng();
    return (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect();
}

/// Adapts a plain closure into a [`Generator`].
pub struct FnGenerator<F>(pub F);

impl<F> Generator for FnGenerator<F>
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> Result<String> {
        return Ok((self.0)());
    }
}

/// A declared parameter of a group or route. Immutable once built.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    default: Option<String>,
    required: bool,
    generator: Option<Arc<dyn Generator>>,
    param_type: Option<ParameterType>,
    id: Option<String>,
}

impl Parameter {
    pub fn new(name: &str) -> Parameter {
        return Parameter {
            name: name.to_string(),
            default: None,
            required: true,
            generator: None,
            param_type: None,
            id: None,
        };
    }

    pub fn with_default(mut self, default: &str) -> Parameter {
        self.default = Some(default.to_string());
        return self;
    }

    pub fn required(mut self, required: bool) -> Parameter {
        self.required = required;
        return self;
    }

    pub fn optional(self) -> Parameter {
        return self.required(false);
    }

    pub fn with_type(mut self, param_type: ParameterType) -> Parameter {
        self.param_type = Some(param_type);
        return self;
    }

    /// Stores the value under `globals.param.<id>` so that every parameter
    /// declared with the same id sees the same value.
    pub fn shared(mut self, id: &str) -> Parameter {
        self.id = Some(id.to_string());
        return self;
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Parameter {
        self.generator = Some(generator);
        return self;
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn default(&self) -> Option<&str> {
        return self.default.as_deref();
    }

    pub fn is_required(&self) -> bool {
        return self.required;
    }

    pub fn param_type(&self) -> Option<&ParameterType> {
        return self.param_type.as_ref();
    }

    pub fn id(&self) -> Option<&str> {
        return self.id.as_deref();
    }

    pub fn has_generator(&self) -> bool {
        return self.generator.is_some();
    }

    pub fn storage_key(&self, prefix: &str) -> String {
        return match &self.id {
            Some(id) => format!("globals.param.{}", id),
            None => format!("{}.param.{}", prefix, self.name),
        };
    }

    pub fn process_value(&self, raw: &str) -> ParamValue {
        return match &self.param_type {
            Some(param_type) => param_type.process_value(raw),
            None => ParamValue::Text(raw.to_string()),
        };
    }

    pub fn generate(&self) -> Result<String> {
        return match &self.generator {
            Some(generator) => generator.generate(),
            None => Err(Error::NoGenerator(self.name.clone())),
        };
    }
}

impl Debug for Parameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        return f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("required", &self.required)
            .field("generator", &self.generator.is_some())
            .field("type", &self.param_type)
            .field("id", &self.id)
            .finish();
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Parameter) -> bool {
        let same_generator = match (&self.generator, &other.generator) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        return self.name == other.name
            && self.default == other.default
            && self.required == other.required
            && self.param_type == other.param_type
            && self.id == other.id
            && same_generator;
    }
}

/// Resolved values of one scope, looked up by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParameterValues {
    entries: Vec<(String, Option<ParamValue>)>,
}

impl ParameterValues {
    pub fn new() -> ParameterValues {
        return ParameterValues::default();
    }

    pub fn insert(&mut self, name: &str, value: Option<ParamValue>) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        return self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_ref());
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        return self.get(name).and_then(ParamValue::as_text);
    }

    pub fn contains(&self, name: &str) -> bool {
        return self.entries.iter().any(|(n, _)| n == name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&ParamValue>)> {
        return self.entries.iter().map(|(n, v)| (n.as_str(), v.as_ref()));
    }

    pub fn len(&self) -> usize {
        return self.entries.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }
}

impl FromIterator<(String, Option<ParamValue>)> for ParameterValues {
    fn from_iter<T: IntoIterator<Item = (String, Option<ParamValue>)>>(iter: T) -> Self {
        let mut values = ParameterValues::new();
        for (name, value) in iter {
            values.insert(&name, value);
        }
        return values;
    }
}
