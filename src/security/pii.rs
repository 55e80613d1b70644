use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Field names that are treated as PII out of the box. The live table is
/// this list plus whatever `pii_fields` adds from the config.
const DEFAULT_PII_FIELDS: &[&str] = &[
    "email",
    "email_formatted",
    "phone",
    "mobile",
    "vat",
    "iban",
    "ssn",
    "sin",
    "passport",
    "credit_card",
    "cc_number",
    "bank_account",
    "acc_number",
];

/// Values that look like card numbers get masked even when the field name
/// is not in the table.
static CARD_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d[ -]?){13,19}$").expect("card number regex"));

static EMAIL_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));

/// Rewrites PII field values in Odoo responses with deterministic partial
/// masks. The detector is data-driven: a name table plus value patterns.
#[derive(Clone)]
pub struct PiiMasker {
    enabled: bool,
    field_matchers: Vec<Regex>,
}

impl PiiMasker {
    pub fn new(enabled: bool, extra_fields: &[String]) -> Self {
        let mut names: Vec<String> = DEFAULT_PII_FIELDS.iter().map(|s| s.to_string()).collect();
        names.extend(extra_fields.iter().cloned());

        let field_matchers = names
            .iter()
            .filter_map(|name| Regex::new(&format!(r"(?i)^{}$", regex::escape(name))).ok())
            .collect();

        Self {
            enabled,
            field_matchers,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn is_pii_field(&self, name: &str) -> bool {
        self.field_matchers.iter().any(|re| re.is_match(name))
    }

    /// Mask a whole response payload in place: arrays of records, single
    /// records, and nested objects are all walked.
    pub fn mask(&self, value: &mut Value) {
        if !self.enabled {
            return;
        }
        self.walk(value);
    }

    fn walk(&self, value: &mut Value) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.walk(item);
                }
            }
            Value::Object(map) => {
                for (key, v) in map.iter_mut() {
                    if self.is_pii_field(key) {
                        let masked = mask_value(key, &*v);
                        *v = masked;
                        continue;
                    }
                    match v {
                        Value::String(s) if CARD_NUMBER.is_match(s) => {
                            let masked = mask_keep_last4(s);
                            *v = Value::String(masked);
                        }
                        Value::String(_) => {}
                        other => self.walk(other),
                    }
                }
            }
            _ => {}
        }
    }
}

/// Deterministic partial mask for one value.
fn mask_value(field: &str, value: &Value) -> Value {
    match value {
        Value::String(s) => {
            if s.is_empty() {
                return value.clone();
            }
            if field.starts_with("email") || EMAIL_VALUE.is_match(s) {
                return Value::String(mask_email(s));
            }
            Value::String(mask_keep_last4(s))
        }
        Value::Bool(_) | Value::Null => value.clone(),
        // Numeric identifiers (e.g. plain integer account numbers).
        Value::Number(n) => Value::String(mask_keep_last4(&n.to_string())),
        other => other.clone(),
    }
}

/// Keep the first character and the domain: `m***@example.com`.
fn mask_email(s: &str) -> String {
    match s.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{first}***@{domain}")
        }
        None => mask_keep_last4(s),
    }
}

/// Keep the last four characters: `***1234`.
fn mask_keep_last4(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 4 {
        return "***".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn masker() -> PiiMasker {
        PiiMasker::new(true, &[])
    }

    #[test]
    fn test_email_mask_keeps_first_char_and_domain() {
        let mut v = json!([{"id": 1, "name": "Mario", "email": "mario@example.com"}]);
        masker().mask(&mut v);
        assert_eq!(v[0]["email"], "m***@example.com");
        assert_eq!(v[0]["name"], "Mario");
    }

    #[test]
    fn test_phone_mask_keeps_last_four() {
        let mut v = json!({"phone": "+39 055 123456"});
        masker().mask(&mut v);
        assert_eq!(v["phone"], "***3456");
    }

    #[test]
    fn test_mask_is_deterministic() {
        let mut a = json!({"vat": "IT12345678901"});
        let mut b = json!({"vat": "IT12345678901"});
        masker().mask(&mut a);
        masker().mask(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_card_number_value_detected_without_field_name() {
        let mut v = json!({"note": "4111 1111 1111 1111"});
        masker().mask(&mut v);
        assert_eq!(v["note"], "***1111");
    }

    #[test]
    fn test_disabled_masker_is_noop() {
        let masker = PiiMasker::new(false, &[]);
        let mut v = json!({"email": "mario@example.com"});
        masker.mask(&mut v);
        assert_eq!(v["email"], "mario@example.com");
    }

    #[test]
    fn test_extra_fields_from_config() {
        let masker = PiiMasker::new(true, &["codice_fiscale".to_string()]);
        let mut v = json!({"codice_fiscale": "RSSMRA80A01H501U"});
        masker.mask(&mut v);
        assert_eq!(v["codice_fiscale"], "***501U");
    }

    #[test]
    fn test_false_value_untouched() {
        // Odoo encodes empty fields as false.
        let mut v = json!({"email": false});
        masker().mask(&mut v);
        assert_eq!(v["email"], false);
    }

    #[test]
    fn test_nested_records_masked() {
        let mut v = json!({"records": [{"email": "a@b.co", "child": {"phone": "5551234567"}}]});
        masker().mask(&mut v);
        assert_eq!(v["records"][0]["email"], "a***@b.co");
        assert_eq!(v["records"][0]["child"]["phone"], "***4567");
    }

    #[test]
    fn test_short_value_fully_masked() {
        let mut v = json!({"ssn": "123"});
        masker().mask(&mut v);
        assert_eq!(v["ssn"], "***");
    }
}
