use std::collections::VecDeque;

use serde_json::Value;

use super::error::BoltError;

pub type RecordVisitor<'a> = dyn FnMut(Vec<Value>) -> Result<(), BoltError> + 'a;

/// A result produced by `RUN`, consumed once by `PULL_ALL` or `DISCARD_ALL`.
pub trait RecordStream {
    fn field_names(&self) -> &[String];

    /// Hands every remaining record to `visitor`, stopping at the first error.
    fn visit(&mut self, visitor: &mut RecordVisitor<'_>) -> Result<(), BoltError>;
}

/// Receives the outcome of one session operation. `on_finish` is called
/// exactly once, after everything else.
pub trait ResponseHandler {
    fn on_metadata(&mut self, key: &str, value: Value);

    fn on_records(&mut self, records: &mut dyn RecordStream, pull: bool) -> Result<(), BoltError>;

    fn mark_failed(&mut self, error: BoltError);

    fn mark_ignored(&mut self);

    fn on_finish(&mut self);
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferedResult {
    fields: Vec<String>,
    rows: VecDeque<Vec<Value>>,
}

impl BufferedResult {
    pub fn new(fields: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            fields,
            rows: rows.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl RecordStream for BufferedResult {
    fn field_names(&self) -> &[String] {
        &self.fields
    }

    fn visit(&mut self, visitor: &mut RecordVisitor<'_>) -> Result<(), BoltError> {
        while let Some(row) = self.rows.pop_front() {
            visitor(row)?;
        }
        Ok(())
    }
}
