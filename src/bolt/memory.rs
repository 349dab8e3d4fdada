use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Number, Value};

use crate::config::AuthConfig;

use super::error::BoltError;
use super::handler::{BufferedResult, RecordStream};
use super::messages::ValueMap;
use super::runner::{
    AuthenticationResult, Authenticator, ResultConsumer, StatementMetadata, StatementRunner,
    TerminationToken,
};
use super::status::Status;

const SLEEP_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, PartialEq)]
enum Statement {
    Begin,
    Commit,
    Rollback,
    Return(Vec<ReturnItem>),
    Sleep(Expression),
    Fail(Expression),
}

#[derive(Debug, PartialEq)]
struct ReturnItem {
    expression: Expression,
    field: String,
}

#[derive(Debug, PartialEq)]
enum Expression {
    Literal(Value),
    Parameter(String),
}

/// Statement runner without storage. Understands `RETURN` of literals and
/// parameters, explicit transaction control and two diagnostic procedures:
/// `db.sleep(ms)` and `db.fail(message)`.
#[derive(Debug, Default)]
pub struct InMemoryRunner {
    in_transaction: bool,
    pending: Option<BufferedResult>,
}

impl InMemoryRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn execute(
        &mut self,
        statement: Statement,
        parameters: &ValueMap,
        termination: &TerminationToken,
    ) -> Result<BufferedResult, BoltError> {
        match statement {
            Statement::Begin => {
                if self.in_transaction {
                    return Err(BoltError::new(
                        Status::RequestInvalid,
                        "Nested transactions are not supported.",
                    ));
                }
                self.in_transaction = true;
                Ok(BufferedResult::empty())
            }
            Statement::Commit => self.finish_transaction("commit"),
            Statement::Rollback => self.finish_transaction("roll back"),
            Statement::Return(items) => {
                let mut fields = Vec::with_capacity(items.len());
                let mut row = Vec::with_capacity(items.len());
                for item in items {
                    row.push(item.expression.evaluate(parameters)?);
                    fields.push(item.field);
                }
                Ok(BufferedResult::new(fields, vec![row]))
            }
            Statement::Sleep(expression) => {
                let millis = expression.evaluate(parameters)?.as_u64().ok_or_else(|| {
                    BoltError::new(
                        Status::InvalidSyntax,
                        "db.sleep expects a non-negative integer number of milliseconds",
                    )
                })?;
                sleep_unless_terminated(Duration::from_millis(millis), termination)?;
                Ok(BufferedResult::empty())
            }
            Statement::Fail(expression) => {
                let message = match expression.evaluate(parameters)? {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                Err(BoltError::new(Status::UnknownError, message))
            }
        }
    }

    fn finish_transaction(&mut self, verb: &str) -> Result<BufferedResult, BoltError> {
        if !self.in_transaction {
            return Err(BoltError::new(
                Status::TransactionNotFound,
                format!("No current transaction to {verb}."),
            ));
        }
        self.in_transaction = false;
        Ok(BufferedResult::empty())
    }
}

impl StatementRunner for InMemoryRunner {
    fn run(
        &mut self,
        statement: &str,
        parameters: &ValueMap,
        termination: &TerminationToken,
    ) -> Result<StatementMetadata, BoltError> {
        self.pending = None;
        let parsed = parse_statement(statement)?;
        let result = self.execute(parsed, parameters, termination)?;
        let metadata = StatementMetadata {
            field_names: result.field_names().to_vec(),
        };
        self.pending = Some(result);
        Ok(metadata)
    }

    fn consume_result(&mut self, consumer: &mut ResultConsumer<'_>) -> Result<(), BoltError> {
        let mut result = self.pending.take().ok_or_else(|| {
            BoltError::new(Status::RequestInvalid, "No result is available to consume.")
        })?;
        consumer(&mut result)
    }

    fn has_transaction(&self) -> bool {
        self.in_transaction
    }

    fn reset(&mut self) -> Result<(), BoltError> {
        self.pending = None;
        self.in_transaction = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), BoltError> {
        self.reset()
    }
}

fn sleep_unless_terminated(duration: Duration, termination: &TerminationToken) -> Result<(), BoltError> {
    let deadline = Instant::now() + duration;
    loop {
        if termination.is_marked() {
            return Err(BoltError::new(
                Status::TransactionTerminated,
                "The transaction has been terminated.",
            ));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

impl Expression {
    fn evaluate(&self, parameters: &ValueMap) -> Result<Value, BoltError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Parameter(name) => parameters.get(name).cloned().ok_or_else(|| {
                BoltError::new(
                    Status::ParameterMissing,
                    format!("Expected parameter(s): {name}"),
                )
            }),
        }
    }
}

fn parse_statement(statement: &str) -> Result<Statement, BoltError> {
    let text = statement.trim().trim_end_matches(';').trim();
    let (head, rest) = match text.find(char::is_whitespace) {
        Some(index) => (&text[..index], text[index..].trim()),
        None => (text, ""),
    };

    match (head.to_ascii_uppercase().as_str(), rest.is_empty()) {
        ("BEGIN", true) => Ok(Statement::Begin),
        ("COMMIT", true) => Ok(Statement::Commit),
        ("ROLLBACK", true) => Ok(Statement::Rollback),
        ("RETURN", false) => split_top_level(rest, ',')
            .into_iter()
            .map(parse_return_item)
            .collect::<Result<Vec<_>, _>>()
            .map(Statement::Return),
        ("CALL", false) => parse_procedure_call(rest),
        _ => Err(invalid_input(if head.is_empty() { text } else { head })),
    }
}

fn parse_return_item(item: &str) -> Result<ReturnItem, BoltError> {
    let item = item.trim();
    let (expression, alias) = match find_alias(item) {
        Some((expression, alias)) => (expression.trim(), Some(alias.trim())),
        None => (item, None),
    };

    if let Some(alias) = alias {
        if alias.is_empty() || !alias.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(invalid_input(alias));
        }
    }

    Ok(ReturnItem {
        expression: parse_expression(expression)?,
        field: alias.unwrap_or(expression).to_owned(),
    })
}

fn parse_procedure_call(call: &str) -> Result<Statement, BoltError> {
    let (Some(open), true) = (call.find('('), call.ends_with(')')) else {
        return Err(invalid_input(call));
    };
    let name = call[..open].trim();
    let arguments = call[open + 1..call.len() - 1].trim();

    match name {
        "db.sleep" => Ok(Statement::Sleep(parse_expression(arguments)?)),
        "db.fail" => Ok(Statement::Fail(parse_expression(arguments)?)),
        _ => Err(BoltError::new(
            Status::ProcedureNotFound,
            format!(
                "There is no procedure with the name `{name}` registered for this database instance."
            ),
        )),
    }
}

fn parse_expression(text: &str) -> Result<Expression, BoltError> {
    let text = text.trim();
    if let Some(name) = text.strip_prefix('$') {
        if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Ok(Expression::Parameter(name.to_owned()));
        }
        return Err(invalid_input(text));
    }

    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return Ok(Expression::Literal(Value::String(
                text[1..text.len() - 1].to_owned(),
            )));
        }
    }

    match text.to_ascii_lowercase().as_str() {
        "true" => return Ok(Expression::Literal(Value::Bool(true))),
        "false" => return Ok(Expression::Literal(Value::Bool(false))),
        "null" => return Ok(Expression::Literal(Value::Null)),
        _ => {}
    }

    if let Ok(integer) = text.parse::<i64>() {
        return Ok(Expression::Literal(Value::from(integer)));
    }
    if let Some(float) = text.parse::<f64>().ok().and_then(Number::from_f64) {
        return Ok(Expression::Literal(Value::Number(float)));
    }

    Err(invalid_input(text))
}

/// Splits on `separator` outside quoted strings.
fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut start = 0;

    for (index, c) in text.char_indices() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == separator => {
                parts.push(&text[start..index]);
                start = index + c.len_utf8();
            }
            None => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Finds a trailing ` AS alias` outside quoted strings.
fn find_alias(item: &str) -> Option<(&str, &str)> {
    let words = split_top_level(item, ' ');
    let position = words.iter().rposition(|word| word.eq_ignore_ascii_case("as"))?;
    if position == 0 {
        return None;
    }
    let expression_end = words[..position]
        .iter()
        .map(|word| word.len() + 1)
        .sum::<usize>()
        .saturating_sub(1);
    let alias_start = (expression_end + 1 + words[position].len() + 1).min(item.len());
    Some((&item[..expression_end], &item[alias_start..]))
}

fn invalid_input(fragment: &str) -> BoltError {
    BoltError::new(
        Status::InvalidSyntax,
        format!("Invalid input '{fragment}': expected RETURN, CALL, BEGIN, COMMIT or ROLLBACK"),
    )
}

/// Accepts `none` when authentication is disabled and `basic` tokens that
/// match a configured principal.
#[derive(Clone, Debug, Default)]
pub struct StaticAuthenticator {
    enabled: bool,
    users: BTreeMap<String, String>,
}

impl StaticAuthenticator {
    #[cfg(test)]
    pub fn open() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_users(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            enabled: true,
            users: users.into_iter().collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            enabled: config.enabled,
            users: config.users.clone(),
        }
    }

    fn unauthorized() -> BoltError {
        BoltError::new(
            Status::Unauthorized,
            "The client is unauthorized due to authentication failure.",
        )
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, auth_token: &ValueMap) -> Result<AuthenticationResult, BoltError> {
        let field = |name: &str| auth_token.get(name).and_then(Value::as_str);
        let scheme = field("scheme").unwrap_or("none");

        match scheme {
            "none" if !self.enabled => Ok(AuthenticationResult::default()),
            "none" => Err(Self::unauthorized()),
            "basic" => {
                let principal = field("principal").ok_or_else(Self::unauthorized)?;
                if self.enabled {
                    let credentials = field("credentials").ok_or_else(Self::unauthorized)?;
                    if self.users.get(principal).map(String::as_str) != Some(credentials) {
                        return Err(Self::unauthorized());
                    }
                }
                Ok(AuthenticationResult {
                    principal: Some(principal.to_owned()),
                    credentials_expired: false,
                })
            }
            other => Err(BoltError::new(
                Status::Unauthorized,
                format!("Unsupported authentication token, scheme '{other}' is not supported."),
            )),
        }
    }
}
