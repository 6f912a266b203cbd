//! Normalise provider-specific tool calls into the backend's shape.

use std::{fmt, str::FromStr};

use {
    serde_json::{Map, Value},
    tracing::warn,
};

use atp_protocol::FormattedToolCall;

/// LLM provider whose tool-call shape the input follows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Provider {
    /// `{id, function: {name, arguments}}`
    #[default]
    OpenAi,
    /// `{id, name, input}`
    Anthropic,
    /// `{id, name | function.name, arguments}` with string arguments parsed as JSON.
    Mistral,
    /// Anything else; common field names are tried in turn.
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Mistral => "mistral",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Self::OpenAi,
            "anthropic" => Self::Anthropic,
            "mistral" | "mistralai" => Self::Mistral,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<&str> for Provider {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(provider) => provider,
            Err(never) => match never {},
        }
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn function_obj(obj: &Map<String, Value>) -> Option<&Map<String, Value>> {
    obj.get("function").and_then(Value::as_object)
}

fn parse_arguments(raw: Value) -> Value {
    match raw {
        Value::String(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!(error = %e, "tool call arguments are not valid JSON");
            Value::Object(Map::new())
        }),
        other => other,
    }
}

/// Normalise one provider tool call.
///
/// Non-object input yields an entry with `function: "unknown"` and an
/// `error`, so a batch keeps one entry per input call.
pub fn format_tool_call(call: &Value, provider: &Provider, index: usize) -> FormattedToolCall {
    let Some(obj) = call.as_object() else {
        return FormattedToolCall {
            id: format!("error_{index}"),
            function: "unknown".into(),
            arguments: Value::Object(Map::new()),
            r#type: "function".into(),
            error: Some(format!("tool call must be a JSON object, got {call}")),
        };
    };

    let id = str_field(obj, "id").unwrap_or_default();
    let empty = || Value::Object(Map::new());
    let (function, arguments) = match provider {
        Provider::OpenAi => {
            let func = function_obj(obj);
            (
                func.and_then(|f| str_field(f, "name")).unwrap_or_default(),
                func.and_then(|f| f.get("arguments").cloned())
                    .unwrap_or_else(empty),
            )
        },
        Provider::Anthropic => (
            str_field(obj, "name").unwrap_or_default(),
            obj.get("input").cloned().unwrap_or_else(empty),
        ),
        Provider::Mistral => {
            let func = function_obj(obj);
            let name = str_field(obj, "name")
                .or_else(|| func.and_then(|f| str_field(f, "name")))
                .unwrap_or_default();
            let raw = obj
                .get("arguments")
                .or_else(|| func.and_then(|f| f.get("arguments")))
                .cloned()
                .unwrap_or_else(empty);
            (name, parse_arguments(raw))
        },
        Provider::Other(_) => {
            let name = str_field(obj, "function")
                .or_else(|| function_obj(obj).and_then(|f| str_field(f, "name")))
                .or_else(|| str_field(obj, "name"))
                .unwrap_or_default();
            let arguments = obj
                .get("arguments")
                .or_else(|| obj.get("input"))
                .or_else(|| function_obj(obj).and_then(|f| f.get("arguments")))
                .cloned()
                .unwrap_or_else(empty);
            (name, arguments)
        },
    };

    FormattedToolCall {
        id,
        function,
        arguments,
        r#type: "function".into(),
        error: None,
    }
}

pub fn format_tool_calls(calls: &[Value], provider: &Provider) -> Vec<FormattedToolCall> {
    calls
        .iter()
        .enumerate()
        .map(|(i, call)| format_tool_call(call, provider, i))
        .collect()
}
