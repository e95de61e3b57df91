//! Token 用量与计费
//!
//! 单价表按每百万 token 美元计；cost 在响应时按当次 model 计算。
//! 不同 model 的 cost 不可直接比较，需要时请用原始 token 数重新计算。

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// 单次（或合并后的）补全用量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub cost: f64,
}

impl TokenUsage {
    /// 按单价表计算 cost
    pub fn priced(model: &str, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            model: model.to_string(),
            cost: estimate_cost_usd(model, input_tokens, output_tokens),
        }
    }

    /// 累加：token 数与 cost 相加，model 保留 self（首次调用）的标签
    pub fn merge(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            model: self.model.clone(),
            cost: self.cost + other.cost,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// 累加可选用量：任一为 None 时取另一方
pub fn merge_usage(acc: Option<TokenUsage>, next: Option<&TokenUsage>) -> Option<TokenUsage> {
    match (acc, next) {
        (Some(a), Some(b)) => Some(a.merge(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

/// 一轮内的用量累计器：克隆共享同一份合计
///
/// 补全客户端每次成功调用都记一笔，调用方随后是否返回 Err 不影响合计。
#[derive(Debug, Clone, Default)]
pub struct UsageMeter(Arc<Mutex<Option<TokenUsage>>>);

impl UsageMeter {
    pub fn record(&self, usage: &TokenUsage) {
        if let Ok(mut total) = self.0.lock() {
            *total = merge_usage(total.take(), Some(usage));
        }
    }

    pub fn total(&self) -> Option<TokenUsage> {
        self.0.lock().ok().and_then(|t| t.clone())
    }
}

/// 输入 / 输出单价（USD / 1M tokens）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

pub fn model_price(model: &str) -> ModelPrice {
    // 去掉 "openai/" 之类的前缀
    let m = model.rsplit('/').next().unwrap_or(model);
    match m {
        s if s.starts_with("gpt-4o-mini") || s.starts_with("gpt-4.1-mini") => {
            ModelPrice { input: 0.15, output: 0.60 }
        }
        s if s.starts_with("gpt-4.1-nano") => ModelPrice { input: 0.10, output: 0.40 },
        s if s.starts_with("gpt-4o") || s.starts_with("gpt-4.1") => {
            ModelPrice { input: 2.50, output: 10.00 }
        }
        s if s.starts_with("claude-3-haiku") => ModelPrice { input: 0.25, output: 1.25 },
        s if s.starts_with("claude-3-5-haiku") || s.starts_with("claude-haiku-4") => {
            ModelPrice { input: 0.80, output: 4.00 }
        }
        s if s.starts_with("claude-3-5-sonnet")
            || s.starts_with("claude-3-7-sonnet")
            || s.starts_with("claude-sonnet-4") =>
        {
            ModelPrice { input: 3.00, output: 15.00 }
        }
        s if s.starts_with("claude-3-opus") || s.starts_with("claude-opus-4") => {
            ModelPrice { input: 15.00, output: 75.00 }
        }
        s if s.starts_with("deepseek-chat") => ModelPrice { input: 0.27, output: 1.10 },
        s if s.starts_with("deepseek-reasoner") => ModelPrice { input: 0.55, output: 2.19 },
        "mock" => ModelPrice { input: 0.0, output: 0.0 },
        _ => ModelPrice { input: 0.50, output: 2.00 },
    }
}

pub fn estimate_cost_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let p = model_price(model);
    (input_tokens as f64 * p.input + output_tokens as f64 * p.output) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64, model: &str, cost: f64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            model: model.to_string(),
            cost,
        }
    }

    #[test]
    fn test_merge_is_additive_and_keeps_primary_model() {
        let a = usage(10, 5, "gpt-4o-mini", 0.01);
        let b = usage(3, 2, "claude-3-haiku", 0.002);
        let m = a.merge(&b);
        assert_eq!(m.input_tokens, 13);
        assert_eq!(m.output_tokens, 7);
        assert!((m.cost - 0.012).abs() < 1e-12);
        assert_eq!(m.model, "gpt-4o-mini");
    }

    #[test]
    fn test_merge_usage_options() {
        let a = usage(1, 1, "a", 0.0);
        assert!(merge_usage(None, None).is_none());
        assert_eq!(merge_usage(None, Some(&a)).unwrap().model, "a");
        let b = usage(2, 2, "b", 0.0);
        let m = merge_usage(Some(a), Some(&b)).unwrap();
        assert_eq!(m.total_tokens(), 6);
        assert_eq!(m.model, "a");
    }

    #[test]
    fn test_meter_clones_share_total() {
        let meter = UsageMeter::default();
        assert!(meter.total().is_none());
        let handle = meter.clone();
        handle.record(&usage(10, 5, "gpt-4o-mini", 0.01));
        meter.record(&usage(3, 2, "gpt-4o-mini", 0.002));
        let total = meter.total().unwrap();
        assert_eq!(total.input_tokens, 13);
        assert_eq!(handle.total().unwrap().output_tokens, 7);
    }

    #[test]
    fn test_cost_from_price_table() {
        let u = TokenUsage::priced("gpt-4o-mini", 1_000_000, 1_000_000);
        assert!((u.cost - 0.75).abs() < 1e-9);
        let u = TokenUsage::priced("openai/gpt-4o", 1_000_000, 0);
        assert!((u.cost - 2.50).abs() < 1e-9);
        assert_eq!(TokenUsage::priced("mock", 500, 500).cost, 0.0);
    }
}
