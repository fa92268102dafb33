//! Namespace-scoped key/value store for small sync metadata (cursors,
//! session ids, last user). Values are primitives only; anything nested is
//! rejected so callers serialize complex state explicitly.

use async_trait::async_trait;
use serde_json::Value;
use snafu::{Location, Snafu};

use crate::StorageError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Unsupported config value type `{kind}`"))]
    UnsupportedType {
        kind: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage { source: StorageError },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// The primitive shapes a config entry may hold.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    StringList(Vec<String>),
}

impl ConfigValue {
    pub fn into_json(self) -> Value {
        match self {
            ConfigValue::String(s) => Value::String(s),
            ConfigValue::Int(i) => Value::from(i),
            ConfigValue::Double(d) => Value::from(d),
            ConfigValue::Bool(b) => Value::Bool(b),
            ConfigValue::StringList(items) => {
                Value::Array(items.into_iter().map(Value::String).collect())
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            ConfigValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            ConfigValue::StringList(items) => Some(items),
            _ => None,
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl TryFrom<Value> for ConfigValue {
    type Error = ConfigError;

    fn try_from(value: Value) -> ConfigResult<Self> {
        match value {
            Value::String(s) => Ok(ConfigValue::String(s)),
            Value::Bool(b) => Ok(ConfigValue::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(ConfigValue::Int(i)),
                None => match n.as_f64() {
                    Some(d) => Ok(ConfigValue::Double(d)),
                    None => UnsupportedTypeSnafu { kind: "number" }.fail(),
                },
            },
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => UnsupportedTypeSnafu {
                        kind: kind_of(&other),
                    }
                    .fail(),
                })
                .collect::<ConfigResult<Vec<_>>>()
                .map(ConfigValue::StringList),
            Value::Null => UnsupportedTypeSnafu { kind: "null" }.fail(),
            Value::Object(_) => UnsupportedTypeSnafu { kind: "object" }.fail(),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_owned())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Double(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(value: Vec<String>) -> Self {
        ConfigValue::StringList(value)
    }
}

/// Namespace-scoped primitive key/value store.
///
/// Switching namespaces hides the previous namespace's entries without
/// deleting them; `clear` wipes the current namespace only.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    async fn set(&self, key: &str, value: ConfigValue) -> ConfigResult<()>;
    async fn get(&self, key: &str) -> ConfigResult<Option<ConfigValue>>;
    async fn contains(&self, key: &str) -> ConfigResult<bool>;
    async fn remove(&self, key: &str) -> ConfigResult<()>;
    async fn keys(&self) -> ConfigResult<Vec<String>>;
    async fn clear(&self) -> ConfigResult<()>;
    async fn use_namespace(&self, namespace: &str) -> ConfigResult<()>;
}
