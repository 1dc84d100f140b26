use schemars::schema_for;
use serde::Serialize;
use serde_json::{json, Value};

use super::{MethodCategory, MethodInfo, Registry};
use crate::error::AppError;

/// A registry entry: metadata + JSON schema for the params.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub category: MethodCategory,
    pub mutates: bool,
    pub requires_project: bool,
    pub project_param: Option<&'static str>,
    pub param_schema: Value,
}

pub(super) fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {}, "additionalProperties": false })
}

pub(super) fn schema_value<T: schemars::JsonSchema>() -> Value {
    let root = schema_for!(T);
    serde_json::to_value(root).unwrap_or_else(|_| empty_object_schema())
}

pub(super) fn entry(info: MethodInfo, param_schema: Value) -> MethodDescriptor {
    MethodDescriptor {
        name: info.name,
        description: info.description,
        category: info.category,
        mutates: info.mutates,
        requires_project: info.project_param.is_some(),
        project_param: info.project_param,
        param_schema,
    }
}

/// Deserialize params, classifying failures for the wire.
///
/// Non-object input and JSON type/value mismatches are `INVALID_INPUT`;
/// missing, unknown or duplicate fields and unknown variants are
/// `VALIDATION_FAILED`.
pub(super) fn de<T: serde::de::DeserializeOwned>(input: &Value) -> Result<T, AppError> {
    let input = match input {
        Value::Null => json!({}),
        Value::Object(_) => input.clone(),
        other => {
            return Err(AppError::invalid_input(format!(
                "params must be an object, got {}",
                json_kind(other)
            )))
        }
    };
    serde_json::from_value(input).map_err(|e| classify(&e.to_string()))
}

pub(super) fn expect_no_params(name: &str, input: &Value) -> Result<(), AppError> {
    match input {
        Value::Null => Ok(()),
        Value::Object(map) if map.is_empty() => Ok(()),
        Value::Object(map) => Err(AppError::validation(format!(
            "{name} takes no params, got: {}",
            map.keys().cloned().collect::<Vec<_>>().join(", ")
        ))),
        other => Err(AppError::invalid_input(format!(
            "params must be an object, got {}",
            json_kind(other)
        ))),
    }
}

fn classify(message: &str) -> AppError {
    let coercion = ["invalid type", "invalid value", "invalid length"]
        .iter()
        .any(|marker| message.contains(marker));
    if coercion {
        AppError::invalid_input(format!("invalid params: {message}"))
    } else {
        AppError::validation(format!("invalid params: {message}"))
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Method discovery in three tiers: no topic → every descriptor plus a
/// category summary; category slug → that category's descriptors; method
/// name → that single descriptor.
pub fn describe(registry: &Registry, topic: Option<&str>) -> Result<Value, AppError> {
    match topic {
        None => {
            let categories: Vec<Value> = MethodCategory::all()
                .iter()
                .map(|cat| {
                    let count = registry.descriptors().filter(|d| d.category == *cat).count();
                    json!({
                        "slug": cat.slug(),
                        "description": cat.description(),
                        "count": count,
                    })
                })
                .collect();
            let methods: Vec<&MethodDescriptor> = registry.descriptors().collect();
            Ok(json!({ "categories": categories, "methods": methods }))
        }
        Some(topic) => {
            if let Some(descriptor) = registry.get(topic) {
                return Ok(json!({ "methods": [descriptor] }));
            }
            let cat_lower = topic.to_lowercase();
            let matching: Vec<&MethodDescriptor> = registry
                .descriptors()
                .filter(|d| d.category.slug() == cat_lower)
                .collect();
            if matching.is_empty() {
                Err(AppError::not_found(format!(
                    "unknown topic '{topic}': pass a category or a method name"
                )))
            } else {
                Ok(json!({ "methods": matching }))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_describe_tiers() {
        let registry = Registry::builtin().unwrap();

        let all = describe(&registry, None).unwrap();
        assert_eq!(all["methods"].as_array().unwrap().len(), registry.len());
        let scene = all["categories"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["slug"] == "scene")
            .unwrap();
        assert_eq!(scene["count"], 7);

        let render = describe(&registry, Some("render")).unwrap();
        assert_eq!(render["methods"].as_array().unwrap().len(), 2);

        let one = describe(&registry, Some("project.undo")).unwrap();
        assert_eq!(one["methods"][0]["name"], "project.undo");
        assert_eq!(one["methods"][0]["requiresProject"], true);
        assert_eq!(one["methods"][0]["projectParam"], "project");
        assert!(one["methods"][0]["paramSchema"].is_object());

        let err = describe(&registry, Some("nope")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_classify_messages() {
        assert_eq!(
            classify("invalid type: integer `7`, expected a string").code(),
            ErrorCode::InvalidInput
        );
        assert_eq!(classify("missing field `project`").code(), ErrorCode::ValidationFailed);
        assert_eq!(
            classify("unknown field `x`, expected one of `project`").code(),
            ErrorCode::ValidationFailed
        );
    }
}
