use crate::db::{Database, now};
use crate::drafts;
use crate::error::{Result, StoreError};
use crate::messages::{self, Flag};
use crate::models::{DraftStatus, GenerationSource, Message, NewDraft};
use crate::rules::{Action, ActionSpec, CompiledRule, ConditionSpec, MessageView, Rule, RuleDefinition, all_match};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, QueryBuilder, Sqlite};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// One rule that fired on one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: i64,
    pub rule_name: String,
    pub actions_taken: Vec<ActionSpec>,
    pub stopped_processing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RuleExecution {
    pub id: i64,
    pub account_id: i64,
    pub rule_id: i64,
    pub email_id: i64,
    /// JSON array of the actions that succeeded.
    pub actions_taken: String,
    pub stopped_processing: bool,
    pub executed_at: i64,
}

impl RuleExecution {
    pub fn actions(&self) -> Result<Vec<ActionSpec>> {
        Ok(serde_json::from_str(&self.actions_taken)?)
    }
}

/// Result of evaluating a rule definition against recent messages without
/// running its actions.
#[derive(Debug, Clone, Serialize)]
pub struct RuleTestResult {
    pub examined: usize,
    pub matched: Vec<Message>,
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: i64,
    account_id: i64,
    name: String,
    is_active: bool,
    sort_order: i64,
    stop_processing: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct ConditionRow {
    rule_id: i64,
    field: String,
    operator: String,
    value: String,
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    rule_id: i64,
    action_type: String,
    action_value: String,
}

async fn load_rules(conn: &mut SqliteConnection, account_id: i64, active_only: bool) -> Result<Vec<Rule>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM rules WHERE account_id = ");
    qb.push_bind(account_id);
    if active_only {
        qb.push(" AND is_active = 1");
    }
    qb.push(" ORDER BY sort_order ASC, id ASC");
    let rows = qb.build_query_as::<RuleRow>().fetch_all(&mut *conn).await?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let conditions = sqlx::query_as::<_, ConditionRow>(
        "SELECT c.rule_id, c.field, c.operator, c.value
         FROM rule_conditions c JOIN rules r ON r.id = c.rule_id
         WHERE r.account_id = ?
         ORDER BY c.rule_id, c.position",
    )
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await?;

    let actions = sqlx::query_as::<_, ActionRow>(
        "SELECT a.rule_id, a.action_type, a.action_value
         FROM rule_actions a JOIN rules r ON r.id = a.rule_id
         WHERE r.account_id = ?
         ORDER BY a.rule_id, a.position",
    )
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut conditions_by_rule: HashMap<i64, Vec<ConditionSpec>> = HashMap::new();
    for c in conditions {
        conditions_by_rule.entry(c.rule_id).or_default().push(ConditionSpec {
            field: c.field,
            operator: c.operator,
            value: c.value,
        });
    }
    let mut actions_by_rule: HashMap<i64, Vec<ActionSpec>> = HashMap::new();
    for a in actions {
        actions_by_rule.entry(a.rule_id).or_default().push(ActionSpec {
            action_type: a.action_type,
            action_value: a.action_value,
        });
    }

    Ok(rows
        .into_iter()
        .map(|r| Rule {
            conditions: conditions_by_rule.remove(&r.id).unwrap_or_default(),
            actions: actions_by_rule.remove(&r.id).unwrap_or_default(),
            id: r.id,
            account_id: r.account_id,
            name: r.name,
            is_active: r.is_active,
            sort_order: r.sort_order,
            stop_processing: r.stop_processing,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
        .collect())
}

async fn write_children(conn: &mut SqliteConnection, rule_id: i64, definition: &RuleDefinition) -> Result<()> {
    sqlx::query("DELETE FROM rule_conditions WHERE rule_id = ?")
        .bind(rule_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM rule_actions WHERE rule_id = ?")
        .bind(rule_id)
        .execute(&mut *conn)
        .await?;

    for (position, c) in definition.conditions.iter().enumerate() {
        sqlx::query(
            "INSERT INTO rule_conditions (rule_id, position, field, operator, value) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(rule_id)
        .bind(position as i64)
        .bind(&c.field)
        .bind(&c.operator)
        .bind(&c.value)
        .execute(&mut *conn)
        .await?;
    }
    for (position, a) in definition.actions.iter().enumerate() {
        sqlx::query(
            "INSERT INTO rule_actions (rule_id, position, action_type, action_value) VALUES (?, ?, ?, ?)",
        )
        .bind(rule_id)
        .bind(position as i64)
        .bind(&a.action_type)
        .bind(a.action_value.trim())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Evaluates the account's active rules against a newly inserted message,
/// inside the caller's ingestion transaction. Conditions see the message
/// as it was ingested; each action runs in its own savepoint so a failing
/// action is rolled back alone and evaluation moves on.
pub(crate) async fn apply_rules(conn: &mut SqliteConnection, message: &Message) -> Result<Vec<RuleMatch>> {
    let rules = load_rules(conn, message.account_id, true).await?;
    if rules.is_empty() {
        return Ok(Vec::new());
    }

    let view = MessageView::new(message);
    let mut matched = Vec::new();

    for rule in rules.iter().map(CompiledRule::compile) {
        if !rule.matches(&view) {
            continue;
        }

        let mut taken = Vec::new();
        for action in &rule.actions {
            let action = match action {
                Ok(action) => action,
                Err(e) => {
                    warn!(rule_id = rule.id, message_id = message.id, error = %e, "skipping malformed action");
                    continue;
                }
            };
            match run_action(conn, message, action).await {
                Ok(()) => taken.push(ActionSpec::from(action)),
                Err(e) => warn!(
                    rule_id = rule.id,
                    message_id = message.id,
                    action = action.action_type(),
                    error = %e,
                    "rule action failed"
                ),
            }
        }

        sqlx::query(
            "INSERT INTO rule_execution_log (account_id, rule_id, email_id, actions_taken, stopped_processing, executed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.account_id)
        .bind(rule.id)
        .bind(message.id)
        .bind(serde_json::to_string(&taken)?)
        .bind(rule.stop_processing)
        .bind(now())
        .execute(&mut *conn)
        .await?;

        debug!(rule_id = rule.id, message_id = message.id, actions = taken.len(), "rule matched");
        matched.push(RuleMatch {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            actions_taken: taken,
            stopped_processing: rule.stop_processing,
        });

        if rule.stop_processing {
            break;
        }
    }

    Ok(matched)
}

async fn run_action(conn: &mut SqliteConnection, message: &Message, action: &Action) -> Result<()> {
    let mut savepoint = conn.begin().await?;
    match execute_action(&mut savepoint, message, action).await {
        Ok(()) => {
            savepoint.commit().await?;
            Ok(())
        }
        Err(e) => {
            savepoint.rollback().await?;
            Err(e)
        }
    }
}

async fn execute_action(conn: &mut SqliteConnection, message: &Message, action: &Action) -> Result<()> {
    let id = message.id;
    match action {
        Action::Move(folder) => {
            messages::move_message(conn, id, folder).await?;
        }
        Action::MarkRead => messages::set_flag(conn, id, Flag::Read, true).await?,
        Action::MarkUnread => messages::set_flag(conn, id, Flag::Read, false).await?,
        Action::Star => messages::set_flag(conn, id, Flag::Starred, true).await?,
        Action::Unstar => messages::set_flag(conn, id, Flag::Starred, false).await?,
        Action::Archive => messages::set_flag(conn, id, Flag::Archived, true).await?,
        Action::Delete => messages::set_flag(conn, id, Flag::Deleted, true).await?,
        Action::Forward(to) => {
            let draft = forward_draft(message, to);
            let draft_id = drafts::insert_draft(conn, &draft, DraftStatus::Scheduled).await?;
            debug!(message_id = id, draft_id, to = %to, "queued forward");
        }
    }
    Ok(())
}

fn forward_draft(message: &Message, to: &str) -> NewDraft {
    let subject = message.subject.as_deref().unwrap_or("");
    let from = match (&message.from_name, &message.from_email) {
        (Some(name), Some(email)) => format!("{} <{}>", name, email),
        (None, Some(email)) => email.clone(),
        (Some(name), None) => name.clone(),
        (None, None) => String::new(),
    };
    let date = chrono::DateTime::from_timestamp(message.date, 0)
        .map(|d| d.to_rfc2822())
        .unwrap_or_default();
    let original = message
        .body_text
        .as_deref()
        .or(message.snippet.as_deref())
        .unwrap_or("");

    let body = format!(
        "---------- Forwarded message ----------\nFrom: {}\nDate: {}\nSubject: {}\n\n{}",
        from, date, subject, original
    );

    let mut draft = NewDraft::new(message.account_id, to, &format!("Fwd: {}", subject), &body);
    draft.body_html = message.body_html.clone();
    draft.scheduled_send_at = Some(now());
    draft.generation_source = GenerationSource::Rule;
    draft
}

impl From<&Action> for ActionSpec {
    fn from(action: &Action) -> Self {
        let value = match action {
            Action::Move(v) | Action::Forward(v) => v.as_str(),
            _ => "",
        };
        ActionSpec::new(action.action_type(), value)
    }
}

impl Database {
    pub async fn create_rule(&self, account_id: i64, definition: &RuleDefinition) -> Result<Rule> {
        definition.validate()?;

        let mut tx = self.pool().begin().await?;
        let ts = now();
        let id = sqlx::query(
            "INSERT INTO rules (account_id, name, is_active, sort_order, stop_processing, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(definition.name.trim())
        .bind(definition.is_active)
        .bind(definition.sort_order)
        .bind(definition.stop_processing)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        write_children(&mut tx, id, definition).await?;
        tx.commit().await?;

        info!(account_id, rule_id = id, name = %definition.name, "rule created");
        self.get_rule(id).await
    }

    pub async fn get_rule(&self, id: i64) -> Result<Rule> {
        let mut conn = self.pool().acquire().await?;
        let account_id: i64 = sqlx::query_scalar("SELECT account_id FROM rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StoreError::not_found("rule", id))?;

        load_rules(&mut conn, account_id, false)
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::not_found("rule", id))
    }

    /// All rules of an account in evaluation order, inactive ones included.
    pub async fn list_rules(&self, account_id: i64) -> Result<Vec<Rule>> {
        let mut conn = self.pool().acquire().await?;
        load_rules(&mut conn, account_id, false).await
    }

    /// Replaces a rule's settings, conditions and actions.
    pub async fn update_rule(&self, id: i64, definition: &RuleDefinition) -> Result<Rule> {
        definition.validate()?;

        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "UPDATE rules SET name = ?, is_active = ?, sort_order = ?, stop_processing = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(definition.name.trim())
        .bind(definition.is_active)
        .bind(definition.sort_order)
        .bind(definition.stop_processing)
        .bind(now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("rule", id));
        }
        write_children(&mut tx, id, definition).await?;
        tx.commit().await?;

        self.get_rule(id).await
    }

    pub async fn set_rule_active(&self, id: i64, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE rules SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(now())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("rule", id));
        }
        Ok(())
    }

    /// Assigns `sort_order` by position in `rule_ids`. Every id must belong
    /// to the account.
    pub async fn reorder_rules(&self, account_id: i64, rule_ids: &[i64]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let ts = now();
        for (position, rule_id) in rule_ids.iter().enumerate() {
            let result = sqlx::query("UPDATE rules SET sort_order = ?, updated_at = ? WHERE id = ? AND account_id = ?")
                .bind(position as i64)
                .bind(ts)
                .bind(rule_id)
                .bind(account_id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::not_found("rule", rule_id));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Conditions and actions go with the rule; its execution log stays.
    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("rule", id));
        }
        info!(rule_id = id, "rule deleted");
        Ok(())
    }

    pub async fn execution_log(
        &self,
        account_id: i64,
        rule_id: Option<i64>,
        email_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<RuleExecution>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM rule_execution_log WHERE account_id = ");
        qb.push_bind(account_id);
        if let Some(rule_id) = rule_id {
            qb.push(" AND rule_id = ").push_bind(rule_id);
        }
        if let Some(email_id) = email_id {
            qb.push(" AND email_id = ").push_bind(email_id);
        }
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(limit);
        let rows = qb.build_query_as::<RuleExecution>().fetch_all(self.pool()).await?;
        Ok(rows)
    }

    /// Dry run: which of the most recent `limit` messages would the rule
    /// match. Nothing is written.
    pub async fn test_rule(&self, account_id: i64, definition: &RuleDefinition, limit: i64) -> Result<RuleTestResult> {
        let conditions = definition.compile_conditions()?;
        let recent = sqlx::query_as::<_, Message>(
            "SELECT * FROM emails WHERE account_id = ? AND is_deleted = 0
             ORDER BY date DESC, id DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let examined = recent.len();
        let matched = recent
            .into_iter()
            .filter(|m| all_match(&conditions, &MessageView::new(m)))
            .collect();
        Ok(RuleTestResult { examined, matched })
    }
}
