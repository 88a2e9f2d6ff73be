use serde_json::Value;

/// Canonical completion field of the generate endpoint.
pub const PRIMARY_FIELD: &str = "response";

/// Fields consulted, in order, when the primary field is absent.
pub const ALTERNATE_FIELDS: [&str; 3] = ["output", "text", "result"];

/// The recognised shapes of a buffered upstream response.
///
/// Classification follows a fixed preference order: the primary completion
/// field, then the alternate fields, then chat-style nesting. Anything else is
/// [`ResponseShape::Opaque`] and is rendered back as JSON text.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseShape<'a> {
    /// `{"response": "..."}`
    Completion(&'a str),
    /// `{"output" | "text" | "result": "..."}`
    Alternate { field: &'static str, text: &'a str },
    /// `{"choices": [{"message": {"content": "..."}}]}` or `{"message": {"content": "..."}}`
    Chat(&'a str),
    Opaque(&'a Value),
}

impl<'a> ResponseShape<'a> {
    pub fn classify(response: &'a Value) -> Self {
        if let Some(text) = response.get(PRIMARY_FIELD).and_then(Value::as_str) {
            return ResponseShape::Completion(text);
        }

        for field in ALTERNATE_FIELDS {
            if let Some(text) = response.get(field).and_then(Value::as_str) {
                return ResponseShape::Alternate { field, text };
            }
        }

        if let Some(text) = chat_content(response) {
            return ResponseShape::Chat(text);
        }

        ResponseShape::Opaque(response)
    }

    pub fn into_text(self) -> String {
        match self {
            ResponseShape::Completion(text)
            | ResponseShape::Alternate { text, .. }
            | ResponseShape::Chat(text) => text.to_string(),
            ResponseShape::Opaque(value) => value.to_string(),
        }
    }
}

fn chat_content(response: &Value) -> Option<&str> {
    let message = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .or_else(|| response.get("message"))?;
    message.get("content").and_then(Value::as_str)
}

/// Returns the completion text of an upstream response. Never fails.
pub fn extract_text(response: &Value) -> String {
    ResponseShape::classify(response).into_text()
}
