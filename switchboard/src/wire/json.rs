use serde_json::Value;

/// Extracts the JSON `"id"` member from a request body, if any. String
/// ids are used verbatim; numeric ids keep their literal representation.
pub fn extract_id(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_and_number_ids() {
        assert_eq!(
            extract_id(br#"{"id": "abc", "method": "x"}"#),
            Some("abc".to_string())
        );
        assert_eq!(extract_id(br#"{"id": 42}"#), Some("42".to_string()));
    }

    #[test]
    fn absent_or_unusable_ids() {
        assert_eq!(extract_id(br#"{"method": "x"}"#), None);
        assert_eq!(extract_id(br#"{"id": null}"#), None);
        assert_eq!(extract_id(b"not json"), None);
        assert_eq!(extract_id(b""), None);
    }
}
