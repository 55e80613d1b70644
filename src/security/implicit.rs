use std::collections::HashMap;

use serde_json::{Value, json};

use crate::domain::DomainContext;

/// Per-model override for the implicit filters. Absent models use field
/// discovery: a `company_id` field gets the company filter, a `user_id`
/// field the ownership filter.
#[derive(Debug, Clone, Copy)]
pub struct ModelRule {
    pub company: bool,
    pub user: bool,
}

/// AND-injects security filters onto compiled domains based on model
/// metadata.
#[derive(Clone)]
pub struct ImplicitDomains {
    enabled: bool,
    overrides: HashMap<String, ModelRule>,
}

impl ImplicitDomains {
    pub fn new(enabled: bool) -> Self {
        let mut overrides = HashMap::new();
        // System models are exempt: clients need them for introspection.
        for model in ["ir.model", "ir.model.fields", "res.company"] {
            overrides.insert(
                model.to_string(),
                ModelRule {
                    company: false,
                    user: false,
                },
            );
        }
        Self { enabled, overrides }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_rule(&mut self, model: &str, rule: ModelRule) {
        self.overrides.insert(model.to_string(), rule);
    }

    /// Prepend the applicable implicit clauses to an already-compiled
    /// domain. Adjacent clauses are implicitly ANDed at the top level, so
    /// plain concatenation keeps the domain valid prefix notation.
    pub fn apply(
        &self,
        model: &str,
        field_names: &[String],
        domain: Vec<Value>,
        ctx: &DomainContext,
    ) -> Vec<Value> {
        if !self.enabled {
            return domain;
        }

        let rule = self.overrides.get(model).copied().unwrap_or(ModelRule {
            company: field_names.iter().any(|f| f == "company_id"),
            user: field_names.iter().any(|f| f == "user_id"),
        });

        let mut out = Vec::new();
        if rule.company && !ctx.company_ids.is_empty() {
            out.push(json!(["company_id", "in", ctx.company_ids]));
        }
        if rule.user {
            out.push(json!(["user_id", "=", ctx.uid]));
        }
        out.extend(domain);
        out
    }
}
