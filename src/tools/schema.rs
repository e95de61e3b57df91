//! 工具 Schema：一等类型，同时用于本地参数校验与向补全 API 声明
//!
//! 同一个 ToolSchema 既校验 execute 的参数，又经 to_wire 翻译成具体 API 的工具格式，
//! 避免「本地执行的定义」与「告诉模型的定义」各写一份而悄悄分叉。
//! 另外用 schemars 生成意图分类输出的 JSON Schema，拼入分类 system prompt。

use schemars::schema_for;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::IntentClassification;

/// 补全 API 的工具声明格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFormat {
    /// {"type":"function","function":{name, description, parameters}}
    OpenAi,
    /// {name, description, input_schema}
    Anthropic,
}

/// 参数类型（JSON Schema 基本类型）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    fn accepts(&self, v: &Value) -> bool {
        match self {
            ParamType::String => v.is_string(),
            ParamType::Number => v.is_number(),
            ParamType::Integer => v.is_i64() || v.is_u64(),
            ParamType::Boolean => v.is_boolean(),
            ParamType::Array => v.is_array(),
            ParamType::Object => v.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }
}

/// 工具声明：名称、描述、带类型与必填标记的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, p: ToolParameter) -> Self {
        self.parameters.push(p);
        self
    }

    /// 参数对象的 JSON Schema
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                json!({"type": p.param_type.as_str(), "description": p.description}),
            );
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// 翻译为指定 API 的工具声明
    pub fn to_wire(&self, format: ToolFormat) -> Value {
        match format {
            ToolFormat::OpenAi => json!({
                "type": "function",
                "function": {
                    "name": self.name,
                    "description": self.description,
                    "parameters": self.to_json_schema(),
                }
            }),
            ToolFormat::Anthropic => json!({
                "name": self.name,
                "description": self.description,
                "input_schema": self.to_json_schema(),
            }),
        }
    }

    /// 校验参数：必须是对象，必填项存在且非 null，已给出的参数类型匹配
    pub fn validate(&self, params: &Value) -> Result<(), String> {
        let obj = match params {
            Value::Object(o) => o,
            Value::Null if self.parameters.iter().all(|p| !p.required) => return Ok(()),
            _ => return Err("parameters must be a JSON object".to_string()),
        };
        for p in &self.parameters {
            match obj.get(&p.name) {
                None | Some(Value::Null) if p.required => {
                    return Err(format!("missing required parameter '{}'", p.name));
                }
                Some(v) if !v.is_null() && !p.param_type.accepts(v) => {
                    return Err(format!(
                        "parameter '{}' must be of type {}",
                        p.name,
                        p.param_type.as_str()
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// 意图分类输出的 JSON Schema 字符串，可拼入 system prompt
pub fn classification_schema_json() -> String {
    let schema = schema_for!(IntentClassification);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ToolSchema {
        ToolSchema::new("fetch_page", "Fetch a web page")
            .param(ToolParameter::required("url", ParamType::String, "Page URL"))
            .param(ToolParameter::optional("max_chars", ParamType::Integer, "Truncate length"))
    }

    #[test]
    fn test_openai_wire_format() {
        let v = schema().to_wire(ToolFormat::OpenAi);
        assert_eq!(v["type"], json!("function"));
        assert_eq!(v["function"]["name"], json!("fetch_page"));
        assert_eq!(v["function"]["parameters"]["required"], json!(["url"]));
        assert_eq!(
            v["function"]["parameters"]["properties"]["max_chars"]["type"],
            json!("integer")
        );
    }

    #[test]
    fn test_anthropic_wire_format() {
        let v = schema().to_wire(ToolFormat::Anthropic);
        assert_eq!(v["name"], json!("fetch_page"));
        assert_eq!(v["input_schema"]["type"], json!("object"));
        assert!(v.get("function").is_none());
    }

    #[test]
    fn test_validate() {
        let s = schema();
        assert!(s.validate(&json!({"url": "https://a.b"})).is_ok());
        assert!(s.validate(&json!({"url": "https://a.b", "max_chars": 10})).is_ok());
        assert!(s.validate(&json!({})).unwrap_err().contains("url"));
        assert!(s.validate(&json!({"url": null})).is_err());
        assert!(s.validate(&json!({"url": 5})).unwrap_err().contains("string"));
        assert!(s.validate(&json!("https://a.b")).is_err());
        assert!(ToolSchema::new("noop", "").validate(&Value::Null).is_ok());
    }

    #[test]
    fn test_classification_schema_mentions_fields() {
        let s = classification_schema_json();
        assert!(s.contains("primaryIntent"));
        assert!(s.contains("secondaryIntents"));
        assert!(s.contains("analyze_nutrition"));
    }
}
