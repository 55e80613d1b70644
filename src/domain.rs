use std::sync::LazyLock;

use chrono::{Datelike, Local, NaiveDate};
use regex::Regex;
use serde_json::{Value, json};

use crate::error::{GatewayError, ValidationKind};

/// Operators accepted in domain triples.
pub const ALLOWED_OPERATORS: &[&str] = &[
    "=", "!=", "<", "<=", ">", ">=", "like", "ilike", "not like", "not ilike", "=like", "=ilike",
    "in", "not in", "child_of", "parent_of",
];

/// Prefix logical tokens accepted in raw domains.
const LOGICAL_TOKENS: &[&str] = &["&", "|", "!"];

const MAX_DOMAIN_DEPTH: usize = 10;

static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_.]*$").expect("field name regex"));

/// Runtime values substituted for placeholder tokens before compilation.
#[derive(Debug, Clone)]
pub struct DomainContext {
    pub uid: i64,
    pub company_ids: Vec<i64>,
    pub today: NaiveDate,
}

impl DomainContext {
    pub fn new(uid: i64, company_ids: Vec<i64>) -> Self {
        Self {
            uid,
            company_ids,
            today: Local::now().date_naive(),
        }
    }

    /// Fixed resolver table for placeholder tokens.
    fn resolve(&self, token: &str) -> Option<Value> {
        match token {
            "__current_user_id__" => Some(json!(self.uid)),
            "__current_company_ids__" => Some(json!(self.company_ids)),
            "__today__" => Some(json!(self.today.format("%Y-%m-%d").to_string())),
            "__yesterday__" => {
                let d = self.today.pred_opt().unwrap_or(self.today);
                Some(json!(d.format("%Y-%m-%d").to_string()))
            }
            "__tomorrow__" => {
                let d = self.today.succ_opt().unwrap_or(self.today);
                Some(json!(d.format("%Y-%m-%d").to_string()))
            }
            "__start_of_month__" => {
                let d = self.today.with_day(1).unwrap_or(self.today);
                Some(json!(d.format("%Y-%m-%d").to_string()))
            }
            "__start_of_year__" => {
                let d = NaiveDate::from_ymd_opt(self.today.year(), 1, 1).unwrap_or(self.today);
                Some(json!(d.format("%Y-%m-%d").to_string()))
            }
            "__current_month__" => Some(json!(self.today.month())),
            "__current_year__" => Some(json!(self.today.year())),
            _ => None,
        }
    }
}

/// Compilation output: canonical prefix-notation clauses plus the warnings
/// gathered while coercing degenerate inputs.
#[derive(Debug, Clone, Default)]
pub struct CompiledDomain {
    pub clauses: Vec<Value>,
    pub warnings: Vec<String>,
}

/// Full validation report, shaped for the `odoo.domain.validate` tool.
#[derive(Debug, Clone, Default)]
pub struct DomainReport {
    pub ok: bool,
    pub compiled: Vec<Value>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub hints: Vec<String>,
}

struct Compiler<'a> {
    ctx: &'a DomainContext,
    errors: Vec<String>,
    warnings: Vec<String>,
}

/// Compile any accepted domain form into canonical Odoo prefix notation.
///
/// Accepted forms: a raw prefix array, an object tree of `and`/`or`/`not`,
/// a JSON string of either, and the degenerate inputs (`null`, booleans,
/// empty string) which compile to `[]` with a recorded warning.
pub fn compile(
    input: &Value,
    ctx: &DomainContext,
    max_payload_size: usize,
) -> Result<CompiledDomain, GatewayError> {
    match validate(input, ctx, max_payload_size) {
        report if report.ok => Ok(CompiledDomain {
            clauses: report.compiled,
            warnings: report.warnings,
        }),
        report => Err(GatewayError::validation(
            ValidationKind::Domain,
            report.errors.join("; "),
        )),
    }
}

/// Validate and compile, collecting every offending node instead of
/// stopping at the first.
pub fn validate(input: &Value, ctx: &DomainContext, max_payload_size: usize) -> DomainReport {
    let serialized = input.to_string();
    if serialized.len() > max_payload_size {
        return DomainReport {
            ok: false,
            errors: vec![format!(
                "domain exceeds maximum payload size ({max_payload_size} bytes)"
            )],
            ..DomainReport::default()
        };
    }

    let mut compiler = Compiler {
        ctx,
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    let clauses = compiler.compile_root(input);

    let ok = compiler.errors.is_empty();
    let mut hints = Vec::new();
    if !ok {
        hints.push("operators must be one of the documented comparison set".to_string());
        hints.push("use odoo.schema.fields to inspect valid field names".to_string());
    }

    DomainReport {
        ok,
        compiled: if ok { clauses } else { Vec::new() },
        errors: compiler.errors,
        warnings: compiler.warnings,
        hints,
    }
}

impl Compiler<'_> {
    fn compile_root(&mut self, input: &Value) -> Vec<Value> {
        match input {
            Value::Null => {
                self.warnings.push("empty domain: null coerced to []".to_string());
                Vec::new()
            }
            Value::Bool(b) => {
                self.warnings
                    .push(format!("non-list domain: boolean {b} coerced to []"));
                Vec::new()
            }
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    self.warnings
                        .push("empty domain: blank string coerced to []".to_string());
                    return Vec::new();
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(Value::String(_)) => {
                        self.errors
                            .push("domain string must decode to an array or object".to_string());
                        Vec::new()
                    }
                    Ok(parsed) => self.compile_root(&parsed),
                    Err(e) => {
                        self.errors.push(format!("domain is not valid JSON: {e}"));
                        Vec::new()
                    }
                }
            }
            Value::Array(items) => {
                if items.is_empty() {
                    self.warnings.push("empty domain".to_string());
                }
                self.compile_raw(items)
            }
            Value::Object(_) => self.compile_node(input, 0),
            other => {
                self.warnings
                    .push(format!("non-list domain coerced to []: {other}"));
                Vec::new()
            }
        }
    }

    /// A raw Odoo domain: prefix tokens interleaved with triples.
    fn compile_raw(&mut self, items: &[Value]) -> Vec<Value> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(s) if LOGICAL_TOKENS.contains(&s.as_str()) => {
                    out.push(item.clone());
                }
                Value::Array(triple) => {
                    if let Some(compiled) = self.compile_triple(triple) {
                        out.push(compiled);
                    }
                }
                other => {
                    self.errors.push(format!(
                        "domain element must be a [field, op, value] triple or a prefix operator, got: {other}"
                    ));
                }
            }
        }
        out
    }

    /// Object form: `{"and": […]}`, `{"or": […]}`, `{"not": …}`.
    fn compile_node(&mut self, node: &Value, depth: usize) -> Vec<Value> {
        if depth > MAX_DOMAIN_DEPTH {
            self.errors
                .push(format!("domain nesting exceeds maximum depth ({MAX_DOMAIN_DEPTH})"));
            return Vec::new();
        }

        match node {
            Value::Object(map) => {
                if map.len() != 1 {
                    self.errors
                        .push("logical node must have exactly one of 'and', 'or', 'not'".to_string());
                    return Vec::new();
                }
                let (op, value) = map.iter().next().expect("len checked above");
                match op.as_str() {
                    "and" => self.compile_group(value, depth, "&"),
                    "or" => self.compile_group(value, depth, "|"),
                    "not" => {
                        let mut inner = self.compile_node_or_triple(value, depth + 1);
                        let mut out = vec![json!("!")];
                        out.append(&mut inner);
                        out
                    }
                    other => {
                        self.errors.push(format!("unknown logical operator: {other}"));
                        Vec::new()
                    }
                }
            }
            Value::Array(triple) => self
                .compile_triple(triple)
                .map(|t| vec![t])
                .unwrap_or_default(),
            other => {
                self.errors
                    .push(format!("expected logical object or triple, got: {other}"));
                Vec::new()
            }
        }
    }

    /// Compile an `and`/`or` operand list. An n-ary group gets n-1 leading
    /// joiner tokens, so every group stays one Polish-notation expression
    /// and nests correctly inside other operators.
    fn compile_group(&mut self, value: &Value, depth: usize, joiner: &str) -> Vec<Value> {
        let Value::Array(operands) = value else {
            self.errors
                .push("'and'/'or' operator expects a list of domains".to_string());
            return Vec::new();
        };
        if operands.is_empty() {
            self.warnings.push("empty logical group".to_string());
            return Vec::new();
        }

        let compiled: Vec<Vec<Value>> = operands
            .iter()
            .map(|operand| self.compile_node_or_triple(operand, depth + 1))
            .filter(|c| !c.is_empty())
            .collect();

        let mut out = Vec::new();
        for _ in 1..compiled.len() {
            out.push(json!(joiner));
        }
        for mut chunk in compiled {
            out.append(&mut chunk);
        }
        out
    }

    fn compile_node_or_triple(&mut self, value: &Value, depth: usize) -> Vec<Value> {
        match value {
            Value::Array(triple) => self
                .compile_triple(triple)
                .map(|t| vec![t])
                .unwrap_or_default(),
            Value::Object(_) => self.compile_node(value, depth),
            other => {
                self.errors
                    .push(format!("expected a condition or nested group, got: {other}"));
                Vec::new()
            }
        }
    }

    fn compile_triple(&mut self, triple: &[Value]) -> Option<Value> {
        if triple.len() != 3 {
            self.errors.push(format!(
                "condition must have exactly 3 elements [field, op, value], got {}",
                triple.len()
            ));
            return None;
        }

        let field = match triple[0].as_str() {
            Some(f) => f,
            None => {
                self.errors
                    .push(format!("field name must be a string, got: {}", triple[0]));
                return None;
            }
        };
        if !FIELD_NAME.is_match(field) {
            self.errors.push(format!("invalid field name: '{field}'"));
            return None;
        }

        let op = match triple[1].as_str() {
            Some(o) => o,
            None => {
                self.errors
                    .push(format!("operator must be a string, got: {}", triple[1]));
                return None;
            }
        };
        if !ALLOWED_OPERATORS.contains(&op) {
            self.errors.push(format!(
                "unknown operator '{op}' (allowed: {})",
                ALLOWED_OPERATORS.join(", ")
            ));
            return None;
        }

        let value = self.resolve_value(&triple[2]);
        Some(json!([field, op, value]))
    }

    fn resolve_value(&mut self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.ctx.resolve(s).unwrap_or_else(|| value.clone()),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v)).collect())
            }
            other => other.clone(),
        }
    }
}
