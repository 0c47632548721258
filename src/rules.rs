//! Rule definitions and the pure condition evaluator. Persistence and
//! action execution live in `rule_engine`.

use crate::error::{Result, StoreError};
use crate::models::Message;
use mailparse::MailHeaderMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionField {
    Subject,
    /// Sender name or address.
    From,
    FromName,
    FromEmail,
    To,
    Cc,
    /// Plain-text body, or the snippet while the body is not indexed yet.
    Body,
    Size,
    /// Presence of the header named by the condition value.
    Header(String),
    /// Value of one named header.
    NamedHeader(String),
}

impl FromStr for ConditionField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let field = match s.to_ascii_lowercase().as_str() {
            "subject" => ConditionField::Subject,
            "from" => ConditionField::From,
            "from_name" => ConditionField::FromName,
            "from_email" => ConditionField::FromEmail,
            "to" => ConditionField::To,
            "cc" => ConditionField::Cc,
            "body" => ConditionField::Body,
            "size" => ConditionField::Size,
            "header" => ConditionField::Header(String::new()),
            other => match other.strip_prefix("header:") {
                Some(name) if !name.trim().is_empty() => {
                    // keep the caller's casing for display, lookups ignore case
                    let original = &s[s.len() - name.len()..];
                    ConditionField::NamedHeader(original.trim().to_string())
                }
                _ => return Err(StoreError::validation(format!("unknown condition field '{}'", s))),
            },
        };
        Ok(field)
    }
}

/// Comparison operators. String payloads are stored lowercased; `None`
/// payloads come from values that failed to parse and always evaluate
/// to false.
#[derive(Debug, Clone)]
pub enum Operator {
    Contains(String),
    NotContains(String),
    Equals(String),
    NotEquals(String),
    StartsWith(String),
    EndsWith(String),
    Exists,
    NotExists,
    Regex(Option<Regex>),
    GreaterThan(Option<i64>),
    LessThan(Option<i64>),
}

impl Operator {
    pub fn parse(operator: &str, value: &str) -> Result<Self> {
        let needle = || value.to_lowercase();
        let op = match operator {
            "contains" => Operator::Contains(needle()),
            "not_contains" => Operator::NotContains(needle()),
            "equals" => Operator::Equals(needle()),
            "not_equals" => Operator::NotEquals(needle()),
            "starts_with" => Operator::StartsWith(needle()),
            "ends_with" => Operator::EndsWith(needle()),
            "exists" => Operator::Exists,
            "not_exists" => Operator::NotExists,
            "regex" => Operator::Regex(RegexBuilder::new(value).case_insensitive(true).build().ok()),
            "gt" => Operator::GreaterThan(value.trim().parse().ok()),
            "lt" => Operator::LessThan(value.trim().parse().ok()),
            other => return Err(StoreError::validation(format!("unknown operator '{}'", other))),
        };
        Ok(op)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Contains(_) => "contains",
            Operator::NotContains(_) => "not_contains",
            Operator::Equals(_) => "equals",
            Operator::NotEquals(_) => "not_equals",
            Operator::StartsWith(_) => "starts_with",
            Operator::EndsWith(_) => "ends_with",
            Operator::Exists => "exists",
            Operator::NotExists => "not_exists",
            Operator::Regex(_) => "regex",
            Operator::GreaterThan(_) => "gt",
            Operator::LessThan(_) => "lt",
        }
    }

    fn is_string_match(&self) -> bool {
        matches!(
            self,
            Operator::Contains(_)
                | Operator::NotContains(_)
                | Operator::Equals(_)
                | Operator::NotEquals(_)
                | Operator::StartsWith(_)
                | Operator::EndsWith(_)
                | Operator::Regex(_)
        )
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Operator::GreaterThan(_) | Operator::LessThan(_))
    }

    fn is_presence(&self) -> bool {
        matches!(self, Operator::Exists | Operator::NotExists)
    }

    /// Positive string match of one candidate value.
    fn hit(&self, candidate: &str) -> bool {
        let lower = candidate.to_lowercase();
        match self {
            Operator::Contains(n) | Operator::NotContains(n) => lower.contains(n.as_str()),
            Operator::Equals(n) | Operator::NotEquals(n) => lower == *n,
            Operator::StartsWith(n) => lower.starts_with(n.as_str()),
            Operator::EndsWith(n) => lower.ends_with(n.as_str()),
            Operator::Regex(Some(re)) => re.is_match(candidate),
            _ => false,
        }
    }

    fn is_negated(&self) -> bool {
        matches!(self, Operator::NotContains(_) | Operator::NotEquals(_))
    }
}

/// Stored form of a condition: the `(field, operator, value)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: String,
}

impl ConditionSpec {
    pub fn new(field: &str, operator: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value: value.to_string(),
        }
    }

    fn parts(&self) -> Result<(ConditionField, Operator)> {
        let mut field: ConditionField = self.field.parse()?;
        if let ConditionField::Header(name) = &mut field {
            *name = self.value.trim().to_string();
        }
        let operator = Operator::parse(&self.operator, &self.value)?;
        Ok((field, operator))
    }

    fn validate(&self) -> Result<Condition> {
        let (field, operator) = self.parts()?;

        let invalid = |why: &str| -> Result<Condition> {
            Err(StoreError::validation(format!(
                "condition {} {} '{}': {}",
                self.field, self.operator, self.value, why
            )))
        };

        match (&field, &operator) {
            (ConditionField::Size, op) if op.is_string_match() => {
                return invalid("size only supports gt, lt, exists and not_exists");
            }
            (ConditionField::Size, _) => {}
            (_, op) if op.is_numeric() => return invalid("gt and lt are only defined for size"),
            (ConditionField::Header(_), op) if !op.is_presence() => {
                return invalid("header only supports exists and not_exists; use header:<Name> to compare values");
            }
            _ => {}
        }

        match &operator {
            Operator::Regex(None) => return invalid("invalid regular expression"),
            Operator::GreaterThan(None) | Operator::LessThan(None) => return invalid("not a number"),
            op if op.is_string_match() && self.value.is_empty() => return invalid("empty value"),
            _ => {}
        }
        if field == ConditionField::Header(String::new()) {
            return invalid("missing header name");
        }

        Ok(Condition { field, operator })
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub field: ConditionField,
    pub operator: Operator,
}

impl Condition {
    /// Lenient form used at evaluation time. Unknown fields or operators
    /// cannot be stored through the API, but if one is found it compiles
    /// to a condition that never matches.
    fn compile(spec: &ConditionSpec) -> Option<Condition> {
        let (field, operator) = spec.parts().ok()?;
        Some(Condition { field, operator })
    }

    pub fn evaluate(&self, message: &MessageView<'_>) -> bool {
        match &self.field {
            ConditionField::Size => match self.operator {
                Operator::GreaterThan(Some(n)) => message.message.size > n,
                Operator::LessThan(Some(n)) => message.message.size < n,
                Operator::Exists => message.message.size > 0,
                Operator::NotExists => message.message.size <= 0,
                _ => false,
            },
            ConditionField::Header(name) => {
                let present = message.header(name).is_some();
                match self.operator {
                    Operator::Exists => present,
                    Operator::NotExists => !present,
                    _ => false,
                }
            }
            ConditionField::NamedHeader(name) => {
                let value = message.header(name);
                self.compare(value.as_slice())
            }
            field => self.compare(&message.field_values(field)),
        }
    }

    /// Applies the operator across every candidate value of a field. The
    /// negated operators are the exact inverse of their positive form.
    fn compare(&self, candidates: &[String]) -> bool {
        let present: Vec<&String> = candidates.iter().filter(|v| !v.trim().is_empty()).collect();
        match &self.operator {
            Operator::Exists => !present.is_empty(),
            Operator::NotExists => present.is_empty(),
            Operator::GreaterThan(_) | Operator::LessThan(_) => false,
            Operator::Regex(None) => false,
            op if op.is_negated() => !present.iter().any(|v| op.hit(v)),
            op => present.iter().any(|v| op.hit(v)),
        }
    }
}

/// A message plus its lazily parsed headers.
pub struct MessageView<'a> {
    pub message: &'a Message,
    headers: Option<Vec<mailparse::MailHeader<'a>>>,
}

impl<'a> MessageView<'a> {
    pub fn new(message: &'a Message) -> Self {
        let headers = message
            .raw_headers
            .as_deref()
            .and_then(|raw| mailparse::parse_headers(raw.as_bytes()).ok())
            .map(|(headers, _)| headers);
        Self { message, headers }
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers.as_ref()?.get_first_value(name)
    }

    fn field_values(&self, field: &ConditionField) -> Vec<String> {
        let m = self.message;
        let values: Vec<Option<&String>> = match field {
            ConditionField::Subject => vec![m.subject.as_ref()],
            ConditionField::From => vec![m.from_name.as_ref(), m.from_email.as_ref()],
            ConditionField::FromName => vec![m.from_name.as_ref()],
            ConditionField::FromEmail => vec![m.from_email.as_ref()],
            ConditionField::To => vec![m.to_addresses.as_ref()],
            ConditionField::Cc => vec![m.cc_addresses.as_ref()],
            ConditionField::Body => vec![m.body_text.as_ref().or(m.snippet.as_ref())],
            ConditionField::Size | ConditionField::Header(_) | ConditionField::NamedHeader(_) => vec![],
        };
        values.into_iter().flatten().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Action {
    Move(String),
    MarkRead,
    MarkUnread,
    Star,
    Unstar,
    Archive,
    Delete,
    Forward(String),
}

impl Action {
    pub fn parse(action_type: &str, value: &str) -> Result<Self> {
        let value = value.trim();
        let required = |what: &str| -> Result<String> {
            if value.is_empty() {
                Err(StoreError::validation(format!("{} action needs a {}", action_type, what)))
            } else {
                Ok(value.to_string())
            }
        };
        let action = match action_type {
            "move" => Action::Move(required("folder")?),
            "mark_read" => Action::MarkRead,
            "mark_unread" => Action::MarkUnread,
            "star" => Action::Star,
            "unstar" => Action::Unstar,
            "archive" => Action::Archive,
            "delete" => Action::Delete,
            "forward" => {
                let to = required("recipient")?;
                if !to.contains('@') {
                    return Err(StoreError::validation(format!("'{}' is not an address", to)));
                }
                Action::Forward(to)
            }
            other => return Err(StoreError::validation(format!("unknown action '{}'", other))),
        };
        Ok(action)
    }

    pub fn action_type(&self) -> &'static str {
        match self {
            Action::Move(_) => "move",
            Action::MarkRead => "mark_read",
            Action::MarkUnread => "mark_unread",
            Action::Star => "star",
            Action::Unstar => "unstar",
            Action::Archive => "archive",
            Action::Delete => "delete",
            Action::Forward(_) => "forward",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action_type: String,
    #[serde(default)]
    pub action_value: String,
}

impl ActionSpec {
    pub fn new(action_type: &str, action_value: &str) -> Self {
        Self {
            action_type: action_type.to_string(),
            action_value: action_value.to_string(),
        }
    }
}

/// What a caller submits to create or replace a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub stop_processing: bool,
    pub conditions: Vec<ConditionSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

fn default_true() -> bool {
    true
}

impl RuleDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_active: true,
            sort_order: 0,
            stop_processing: false,
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn when(mut self, field: &str, operator: &str, value: &str) -> Self {
        self.conditions.push(ConditionSpec::new(field, operator, value));
        self
    }

    pub fn then(mut self, action_type: &str, value: &str) -> Self {
        self.actions.push(ActionSpec::new(action_type, value));
        self
    }

    pub fn stop(mut self) -> Self {
        self.stop_processing = true;
        self
    }

    pub fn order(mut self, sort_order: i64) -> Self {
        self.sort_order = sort_order;
        self
    }

    /// Rejects anything the evaluator would have to guess about.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StoreError::validation("rule name is empty"));
        }
        if self.conditions.is_empty() {
            return Err(StoreError::validation(format!(
                "rule '{}' needs at least one condition",
                self.name
            )));
        }
        for condition in &self.conditions {
            condition.validate()?;
        }
        for action in &self.actions {
            Action::parse(&action.action_type, &action.action_value)?;
        }
        Ok(())
    }

    /// Conditions only, for dry runs.
    pub fn compile_conditions(&self) -> Result<Vec<Condition>> {
        self.validate()?;
        self.conditions.iter().map(ConditionSpec::validate).collect()
    }
}

/// A stored rule with its conditions and actions, in stored order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub is_active: bool,
    pub sort_order: i64,
    pub stop_processing: bool,
    pub conditions: Vec<ConditionSpec>,
    pub actions: Vec<ActionSpec>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: i64,
    pub name: String,
    pub stop_processing: bool,
    pub conditions: Vec<Condition>,
    /// Actions that failed to parse are kept as errors so they are logged
    /// as failed when the rule fires.
    pub actions: Vec<std::result::Result<Action, String>>,
}

impl CompiledRule {
    pub fn compile(rule: &Rule) -> Self {
        // an unparseable condition must never widen a match
        let conditions: Option<Vec<Condition>> = rule.conditions.iter().map(Condition::compile).collect();
        let conditions = match conditions {
            Some(c) if !c.is_empty() => c,
            _ => vec![Condition::never()],
        };
        let actions = rule
            .actions
            .iter()
            .map(|a| Action::parse(&a.action_type, &a.action_value).map_err(|e| e.to_string()))
            .collect();
        Self {
            id: rule.id,
            name: rule.name.clone(),
            stop_processing: rule.stop_processing,
            conditions,
            actions,
        }
    }

    pub fn matches(&self, message: &MessageView<'_>) -> bool {
        all_match(&self.conditions, message)
    }
}

impl Condition {
    fn never() -> Self {
        Condition {
            field: ConditionField::Size,
            operator: Operator::GreaterThan(None),
        }
    }
}

pub fn all_match(conditions: &[Condition], message: &MessageView<'_>) -> bool {
    !conditions.is_empty() && conditions.iter().all(|c| c.evaluate(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            id: 1,
            account_id: 1,
            folder_id: 1,
            remote_folder_id: 1,
            uid: 1,
            message_id: Some("<1@example.com>".to_string()),
            subject: Some("Invoice #1932".to_string()),
            from_name: Some("Billing Team".to_string()),
            from_email: Some("billing@shop.example".to_string()),
            to_addresses: Some("me@example.com".to_string()),
            cc_addresses: None,
            date: 0,
            is_read: false,
            is_starred: false,
            is_archived: false,
            is_deleted: false,
            is_replied: false,
            has_attachments: false,
            body_indexed: false,
            snippet: Some("Your invoice is attached".to_string()),
            body_text: None,
            body_html: None,
            raw_headers: Some(
                "From: Billing Team <billing@shop.example>\r\nList-Unsubscribe: <mailto:unsub@shop.example>\r\nX-Priority: 1\r\n\r\n"
                    .to_string(),
            ),
            size: 2048,
            in_reply_to: None,
            thread_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn eval(field: &str, operator: &str, value: &str) -> bool {
        let m = message();
        let spec = ConditionSpec::new(field, operator, value);
        let condition = spec.validate().unwrap();
        condition.evaluate(&MessageView::new(&m))
    }

    #[test]
    fn string_operators_ignore_case() {
        assert!(eval("subject", "contains", "INVOICE"));
        assert!(eval("subject", "equals", "invoice #1932"));
        assert!(eval("subject", "starts_with", "inv"));
        assert!(eval("subject", "ends_with", "1932"));
        assert!(!eval("subject", "not_contains", "invoice"));
        assert!(eval("subject", "not_equals", "invoice"));
    }

    #[test]
    fn from_matches_name_or_address() {
        assert!(eval("from", "contains", "billing team"));
        assert!(eval("from", "ends_with", "@shop.example"));
        assert!(!eval("from", "not_contains", "shop.example"));
        assert!(eval("from_email", "equals", "BILLING@shop.example"));
    }

    #[test]
    fn body_falls_back_to_snippet() {
        assert!(eval("body", "contains", "attached"));
        assert!(eval("cc", "not_exists", ""));
        assert!(eval("to", "exists", ""));
    }

    #[test]
    fn header_presence_and_values() {
        assert!(eval("header", "exists", "List-Unsubscribe"));
        assert!(eval("header", "exists", "list-unsubscribe"));
        assert!(eval("header", "not_exists", "X-Spam-Flag"));
        assert!(eval("header:X-Priority", "equals", "1"));
        assert!(eval("header:List-Unsubscribe", "contains", "mailto:"));
        assert!(!eval("header:X-Missing", "contains", "x"));
        assert!(eval("header:X-Missing", "not_contains", "x"));
    }

    #[test]
    fn size_comparisons() {
        assert!(eval("size", "gt", "1024"));
        assert!(!eval("size", "lt", "1024"));
        assert!(eval("size", "lt", " 4096 "));
    }

    #[test]
    fn regex_is_case_insensitive() {
        assert!(eval("subject", "regex", r"^invoice #\d+$"));
        assert!(!eval("subject", "regex", r"^receipt"));
    }

    #[test]
    fn invalid_input_is_rejected_at_creation() {
        let bad = [
            ConditionSpec::new("subject", "regex", "(unclosed"),
            ConditionSpec::new("size", "gt", "big"),
            ConditionSpec::new("subject", "gt", "10"),
            ConditionSpec::new("size", "contains", "10"),
            ConditionSpec::new("nonsense", "contains", "x"),
            ConditionSpec::new("subject", "like", "x"),
            ConditionSpec::new("subject", "contains", ""),
            ConditionSpec::new("header", "contains", "X-Priority"),
            ConditionSpec::new("header", "exists", ""),
        ];
        for spec in bad {
            let rule = RuleDefinition {
                conditions: vec![spec.clone()],
                ..RuleDefinition::new("bad")
            };
            assert!(
                matches!(rule.validate(), Err(StoreError::Validation(_))),
                "accepted {:?}",
                spec
            );
        }

        assert!(RuleDefinition::new("empty").validate().is_err());
        let bad_action = RuleDefinition::new("x")
            .when("subject", "contains", "x")
            .then("explode", "");
        assert!(bad_action.validate().is_err());
        let no_folder = RuleDefinition::new("x")
            .when("subject", "contains", "x")
            .then("move", " ");
        assert!(no_folder.validate().is_err());
    }

    #[test]
    fn stored_invalid_regex_never_matches() {
        let rule = Rule {
            id: 1,
            account_id: 1,
            name: "legacy".to_string(),
            is_active: true,
            sort_order: 0,
            stop_processing: false,
            conditions: vec![ConditionSpec::new("subject", "regex", "(unclosed")],
            actions: vec![],
            created_at: 0,
            updated_at: 0,
        };
        let m = message();
        assert!(!CompiledRule::compile(&rule).matches(&MessageView::new(&m)));

        let unknown = Rule {
            conditions: vec![ConditionSpec::new("subject", "sounds_like", "invoice")],
            ..rule.clone()
        };
        assert!(!CompiledRule::compile(&unknown).matches(&MessageView::new(&m)));

        let empty = Rule {
            conditions: vec![],
            ..rule
        };
        assert!(!CompiledRule::compile(&empty).matches(&MessageView::new(&m)));
    }

    #[test]
    fn conditions_are_anded() {
        let m = message();
        let view = MessageView::new(&m);
        let both = RuleDefinition::new("both")
            .when("subject", "contains", "invoice")
            .when("from", "contains", "billing")
            .compile_conditions()
            .unwrap();
        assert!(all_match(&both, &view));

        let one_misses = RuleDefinition::new("miss")
            .when("subject", "contains", "invoice")
            .when("from", "contains", "nobody")
            .compile_conditions()
            .unwrap();
        assert!(!all_match(&one_misses, &view));
    }

    #[test]
    fn actions_parse_from_stored_pairs() {
        assert_eq!(Action::parse("move", "Feed").unwrap(), Action::Move("Feed".to_string()));
        assert_eq!(Action::parse("star", "").unwrap(), Action::Star);
        assert!(Action::parse("forward", "not-an-address").is_err());
        assert_eq!(Action::Forward("a@b.c".to_string()).action_type(), "forward");
    }
}
