/// Billing report extraction from the billing tool's stdout.
///
/// Accepts a JSON object when the tool emits one, otherwise scans the
/// human-readable report for labeled fields like:
/// - `记录数: 12 条` / `Record count: 12 items`
/// - `总费用: ¥3.50 (3.50元)` / `Total cost: $0.49 (3.50 CNY)`
/// - `总输入Token: 1,234` / `Input tokens: 1,234` (also output and total)
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static RECORD_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:记录数|record count):\s+(\d+)\s+(?:条|items?)").unwrap());
static COST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:总费用|total cost):\s+[^\d\s]?([\d.]+)\s+\(([\d.]+)[^)]*\)").unwrap()
});
static INPUT_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:总输入Token|input tokens):\s+([\d,]+)").unwrap());
static OUTPUT_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:总输出Token|output tokens):\s+([\d,]+)").unwrap());
static TOTAL_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:总Token|total tokens):\s+([\d,]+)").unwrap());

/// Usage and cost for one session window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingReport {
    pub record_count: u64,
    /// Primary cost amount, kept as printed.
    pub cost: String,
    /// Second denomination printed next to the cost. Logged, never displayed.
    pub cost_secondary: Option<String>,
    /// Token counters keep the tool's grouping separators; absent ones read "0".
    pub input_tokens: String,
    pub output_tokens: String,
    pub total_tokens: String,
}

/// Extract a report from raw stdout.
///
/// Returns `None` when record count or cost cannot be found, which covers
/// both "nothing was billed" and output this parser does not understand.
pub fn parse_report(stdout: &str) -> Option<BillingReport> {
    parse_structured(stdout).or_else(|| parse_text(stdout))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Field {
    Number(serde_json::Number),
    Text(String),
}

impl Field {
    fn into_amount(self) -> String {
        match self {
            Field::Number(n) => n.to_string(),
            Field::Text(s) => s,
        }
    }

    fn into_count(self) -> String {
        match self {
            Field::Number(n) => match n.as_u64() {
                Some(v) => group_thousands(v),
                None => n.to_string(),
            },
            Field::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StructuredReport {
    record_count: u64,
    cost: Field,
    #[serde(default)]
    cost_secondary: Option<Field>,
    #[serde(default)]
    input_tokens: Option<Field>,
    #[serde(default)]
    output_tokens: Option<Field>,
    #[serde(default)]
    total_tokens: Option<Field>,
}

fn parse_structured(stdout: &str) -> Option<BillingReport> {
    let trimmed = stdout.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let raw: StructuredReport = match serde_json::from_str(trimmed) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "billing output is not a structured report");
            return None;
        }
    };
    let count = |f: Option<Field>| f.map(Field::into_count).unwrap_or_else(zero);
    Some(BillingReport {
        record_count: raw.record_count,
        cost: raw.cost.into_amount(),
        cost_secondary: raw.cost_secondary.map(Field::into_amount),
        input_tokens: count(raw.input_tokens),
        output_tokens: count(raw.output_tokens),
        total_tokens: count(raw.total_tokens),
    })
}

fn parse_text(stdout: &str) -> Option<BillingReport> {
    let record_count = RECORD_COUNT
        .captures(stdout)
        .and_then(|c| c[1].parse::<u64>().ok())?;
    let cost = COST.captures(stdout)?;

    Some(BillingReport {
        record_count,
        cost: cost[1].to_string(),
        cost_secondary: cost.get(2).map(|m| m.as_str().to_string()),
        input_tokens: first_group(&INPUT_TOKENS, stdout),
        output_tokens: first_group(&OUTPUT_TOKENS, stdout),
        total_tokens: first_group(&TOTAL_TOKENS, stdout),
    })
}

fn first_group(pattern: &Regex, text: &str) -> String {
    pattern
        .captures(text)
        .map(|c| c[1].to_string())
        .unwrap_or_else(zero)
}

fn zero() -> String {
    "0".to_string()
}

/// Format an integer with comma thousands separators (`1234567` -> `1,234,567`).
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
