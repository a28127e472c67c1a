//! Per-request context bound to a session while it runs.

use crate::protocol::result::QueryResult;
use crate::protocol::statement::CompiledStatement;
use crate::upstream::listen::ListenRegistration;

#[derive(Debug, Clone)]
pub struct RequestContext {
    statement: CompiledStatement,
    pub result: QueryResult,
    pub listens: Vec<ListenRegistration>,
}

impl RequestContext {
    pub fn new(statement: CompiledStatement) -> Self {
        let result = QueryResult {
            sql: statement.sql().to_string(),
            ..Default::default()
        };
        Self {
            statement,
            result,
            listens: Vec::new(),
        }
    }

    pub fn statement(&self) -> &CompiledStatement {
        &self.statement
    }

    /// Record a backend error. The session survives it.
    pub fn fail_backend(&mut self, message: String) {
        self.result.error = Some(message);
    }

    pub fn backend_error(&self) -> Option<&str> {
        self.result.error.as_deref()
    }

    pub fn take_listens(&mut self) -> Vec<ListenRegistration> {
        std::mem::take(&mut self.listens)
    }

    pub fn into_result(self) -> QueryResult {
        self.result
    }
}
