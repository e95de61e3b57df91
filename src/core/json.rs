//! 模型 JSON 回复的宽松解析
//!
//! 两段式：先整体直接解析；失败则剥掉 Markdown 代码块（```json ... ```）或取首个 `{` 到末个 `}`
//! 再解析一次。解析失败是正常结果，返回 None，由调用方走降级路径。

use serde::de::DeserializeOwned;

/// 解析模型输出为 T；两段都失败时返回 None
pub fn parse_json_reply<T: DeserializeOwned>(output: &str) -> Option<T> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str::<T>(trimmed) {
        return Some(v);
    }
    let inner = unwrap_payload(trimmed)?;
    match serde_json::from_str::<T>(inner) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(error = %e, "model reply is not valid JSON");
            None
        }
    }
}

/// 取出代码块内部；无代码块时取最外层花括号 / 方括号片段
fn unwrap_payload(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        // 跳过语言标记（json / JSON / 空）
        let rest = match rest.find('\n') {
            Some(nl) if rest[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => &rest[nl + 1..],
            _ => rest,
        };
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some(body.trim());
    }
    let open = text.find(['{', '['])?;
    let close_char = if text[open..].starts_with('{') { '}' } else { ']' };
    let close = text.rfind(close_char)?;
    (close > open).then(|| &text[open..=close])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::Value;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pick {
        name: String,
    }

    #[test]
    fn test_direct_json() {
        let p: Option<Pick> = parse_json_reply(r#"{"name": "Tacos"}"#);
        assert_eq!(p, Some(Pick { name: "Tacos".into() }));
    }

    #[test]
    fn test_fenced_json() {
        let text = "Here you go:\n```json\n{\"name\": \"Curry\"}\n```\nEnjoy!";
        let p: Option<Pick> = parse_json_reply(text);
        assert_eq!(p, Some(Pick { name: "Curry".into() }));

        let text = "```\n{\"name\": \"Soup\"}\n```";
        let p: Option<Pick> = parse_json_reply(text);
        assert_eq!(p, Some(Pick { name: "Soup".into() }));
    }

    #[test]
    fn test_embedded_object_without_fence() {
        let text = "Sure! {\"name\": \"Salad\"} is my pick.";
        let p: Option<Pick> = parse_json_reply(text);
        assert_eq!(p, Some(Pick { name: "Salad".into() }));
    }

    #[test]
    fn test_unparseable_is_none() {
        assert!(parse_json_reply::<Pick>("I think you should cook pasta.").is_none());
        assert!(parse_json_reply::<Pick>("").is_none());
        assert!(parse_json_reply::<Pick>("```json\n{not json}\n```").is_none());
        assert!(parse_json_reply::<Value>("{\"a\": 1").is_none());
    }
}
