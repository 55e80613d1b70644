use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct PromptDef {
    pub name: &'static str,
    pub description: &'static str,
    pub content: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    pub description: String,
    pub content: String,
}

pub const PROMPTS: &[PromptDef] = &[
    PromptDef {
        name: "odoo_common_models",
        description: "Commonly used Odoo models and what they hold",
        content: r#"
# Common Odoo Models

## Sales & CRM
- sale.order - Sales Orders
- sale.order.line - Sales Order Lines
- crm.lead - Leads and Opportunities

## Accounting
- account.move - Invoices & Bills
- account.move.line - Journal Items
- account.payment - Payments

## Inventory
- stock.picking - Transfers
- stock.move - Stock Moves
- product.product - Product Variants
- product.template - Product Templates

## Partners & Users
- res.partner - Contacts, Customers, Vendors
- res.company - Companies
- res.users - Users

## Purchase & Projects
- purchase.order - Purchase Orders
- project.project - Projects
- project.task - Tasks

Use odoo.schema.models to list what this database actually exposes, and
odoo.schema.fields for the field map of any model.
"#,
    },
    PromptDef {
        name: "odoo_domain_filters",
        description: "How to write search domains for this gateway",
        content: r#"
# Search Domains

Domains can be written three ways; all compile to Odoo prefix notation.

## Object form (recommended)
{"and": [["state", "=", "sale"], {"or": [["amount_total", ">", 1000],
["partner_id.country_id.code", "=", "US"]]}]}

## Raw prefix form
["&", ["state", "=", "sale"], "|", ["amount_total", ">", 1000],
["partner_id.country_id.code", "=", "US"]]

## Operators
=, !=, <, <=, >, >=, like, ilike, not like, not ilike, =like, =ilike,
in, not in, child_of, parent_of

## Placeholders
Substituted server-side before execution:
- __current_user_id__, __current_company_ids__
- __today__, __yesterday__, __tomorrow__
- __start_of_month__, __start_of_year__
- __current_month__, __current_year__

Example: {"and": [["user_id", "=", "__current_user_id__"],
["create_date", ">=", "__start_of_month__"]]}

Validate with odoo.domain.validate before running expensive searches.
"#,
    },
];

pub fn default_prompts() -> Vec<Prompt> {
    PROMPTS
        .iter()
        .map(|p| Prompt {
            name: p.name.to_string(),
            description: p.description.to_string(),
            content: p.content.to_string(),
        })
        .collect()
}

pub fn list_prompts_result(prompts: &[Prompt]) -> Value {
    json!({
        "prompts": prompts.iter().map(|p| json!({
            "name": p.name,
            "description": p.description,
        })).collect::<Vec<_>>()
    })
}

pub fn get_prompt_result(prompt: &Prompt) -> Value {
    json!({
        "description": prompt.description,
        "messages": [
            {
                "role": "user",
                "content": {
                    "type": "text",
                    "text": prompt.content
                }
            }
        ]
    })
}
