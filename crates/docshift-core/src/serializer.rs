//! Document serialization.

use crate::error::MigrationError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Converts documents between their stored text and a JSON value tree.
pub trait Serializer: Send + Sync {
    /// Serialize a document.
    fn to_text(&self, value: &Value) -> Result<String, MigrationError>;

    /// Parse a stored document.
    fn from_text(&self, text: &str) -> Result<Value, MigrationError>;
}

/// Compact JSON serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn to_text(&self, value: &Value) -> Result<String, MigrationError> {
        serde_json::to_string(value).map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    fn from_text(&self, text: &str) -> Result<Value, MigrationError> {
        serde_json::from_str(text).map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Convert a typed document to a value tree.
pub fn to_value<T: Serialize>(document: &T) -> Result<Value, MigrationError> {
    serde_json::to_value(document).map_err(|e| MigrationError::Serialization(e.to_string()))
}

/// Convert a value tree to a typed document.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, MigrationError> {
    serde_json::from_value(value).map_err(|e| MigrationError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entity {
        name: String,
        count: u32,
    }

    #[test]
    fn test_json_serializer() {
        let text = JsonSerializer.to_text(&json!({"a": [1, 2]})).unwrap();
        assert_eq!(text, r#"{"a":[1,2]}"#);
        assert_eq!(JsonSerializer.from_text(&text).unwrap(), json!({"a": [1, 2]}));

        match JsonSerializer.from_text("{oops") {
            Err(MigrationError::Deserialization(_)) => {}
            other => panic!("Expected Deserialization error, got {:?}", other),
        }
    }

    #[test]
    fn test_typed_conversion() {
        let entity = Entity {
            name: "x".to_string(),
            count: 3,
        };
        let value = to_value(&entity).unwrap();
        assert_eq!(value, json!({"name": "x", "count": 3}));
        assert_eq!(from_value::<Entity>(value).unwrap(), entity);
        assert!(from_value::<Entity>(json!({"name": 1})).is_err());
    }
}
