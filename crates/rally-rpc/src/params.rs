//! Positional parameter extraction for handlers.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::HandlerError;

/// Deserialize the required argument at `index`.
pub fn arg<T: DeserializeOwned>(params: &[Value], index: usize, name: &str) -> Result<T, HandlerError> {
    let value = params
        .get(index)
        .ok_or_else(|| HandlerError::invalid_params(format!("Missing parameter '{name}'")))?;
    serde_json::from_value(value.clone()).map_err(|e| {
        HandlerError::invalid_params(format!("Invalid parameter '{name}': {e}"))
    })
}

/// Deserialize the optional argument at `index`; absent or `null` yields `None`.
pub fn opt_arg<T: DeserializeOwned>(
    params: &[Value],
    index: usize,
    name: &str,
) -> Result<Option<T>, HandlerError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg(params, index, name).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_string() {
        let params = vec![json!("room1"), json!("hello")];
        let topic: String = arg(&params, 0, "topic").unwrap();
        let text: String = arg(&params, 1, "text").unwrap();
        assert_eq!((topic.as_str(), text.as_str()), ("room1", "hello"));
    }

    #[test]
    fn missing_required_names_parameter() {
        let err = arg::<String>(&[], 0, "topic").unwrap_err();
        assert_eq!(err.wire_message(), "Missing parameter 'topic'");
    }

    #[test]
    fn wrong_type_is_invalid_params() {
        let err = arg::<u32>(&[json!("x")], 0, "count").unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParams { .. }));
        assert!(err.wire_message().contains("count"));
    }

    #[test]
    fn optional_absent_and_null() {
        assert_eq!(opt_arg::<u32>(&[], 0, "n").unwrap(), None);
        assert_eq!(opt_arg::<u32>(&[Value::Null], 0, "n").unwrap(), None);
        assert_eq!(opt_arg::<u32>(&[json!(5)], 0, "n").unwrap(), Some(5));
    }
}
