//! The recorded outcome of one step's execution (§3 "StepResult").

use std::collections::BTreeMap;
use std::time::Duration;

use crate::value::Value;

/// One iteration's outcome inside a block's result.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub index: usize,
    pub item: Value,
    pub success: bool,
    pub error: Option<String>,
}

/// Kind-tagged record of a step's execution. Common fields live at the
/// top; kind-specific fields are grouped in `StepResultKind`.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub cache_hit: bool,
    pub kind: StepResultKind,
}

#[derive(Debug, Clone)]
pub enum StepResultKind {
    Query {
        data: Vec<BTreeMap<String, Value>>,
        count: usize,
        rows_affected: u64,
    },
    HttpCall {
        status_code: u16,
        headers: BTreeMap<String, String>,
        response_body: String,
        /// Present only when `parse` succeeded in producing row-shaped data.
        data: Option<Vec<BTreeMap<String, Value>>>,
        count: Option<usize>,
    },
    Response {
        status_code: u16,
        body: String,
    },
    Block {
        success_count: usize,
        failure_count: usize,
        skipped_count: usize,
        iterations: Vec<IterationRecord>,
    },
}

impl StepResult {
    pub fn query_success(
        data: Vec<BTreeMap<String, Value>>,
        rows_affected: u64,
        duration: Duration,
    ) -> Self {
        let count = data.len();
        StepResult {
            success: true,
            error: None,
            duration,
            cache_hit: false,
            kind: StepResultKind::Query {
                data,
                count,
                rows_affected,
            },
        }
    }

    pub fn query_failure(error: impl Into<String>, duration: Duration) -> Self {
        StepResult {
            success: false,
            error: Some(error.into()),
            duration,
            cache_hit: false,
            kind: StepResultKind::Query {
                data: vec![],
                count: 0,
                rows_affected: 0,
            },
        }
    }

    pub fn httpcall_failure(error: impl Into<String>, duration: Duration) -> Self {
        StepResult {
            success: false,
            error: Some(error.into()),
            duration,
            cache_hit: false,
            kind: StepResultKind::HttpCall {
                status_code: 0,
                headers: BTreeMap::new(),
                response_body: String::new(),
                data: None,
                count: None,
            },
        }
    }

    pub fn response(status_code: u16, body: String, duration: Duration) -> Self {
        StepResult {
            success: true,
            error: None,
            duration,
            cache_hit: false,
            kind: StepResultKind::Response { status_code, body },
        }
    }

    pub fn response_failure(error: impl Into<String>, duration: Duration) -> Self {
        StepResult {
            success: false,
            error: Some(error.into()),
            duration,
            cache_hit: false,
            kind: StepResultKind::Response {
                status_code: 0,
                body: String::new(),
            },
        }
    }

    pub fn block(
        success_count: usize,
        failure_count: usize,
        skipped_count: usize,
        iterations: Vec<IterationRecord>,
        overall_success: bool,
        error: Option<String>,
        duration: Duration,
    ) -> Self {
        StepResult {
            success: overall_success,
            error,
            duration,
            cache_hit: false,
            kind: StepResultKind::Block {
                success_count,
                failure_count,
                skipped_count,
                iterations,
            },
        }
    }

    /// The row data this result exposes to the environment, if any
    /// (query/httpcall never null — an empty list when absent, per §4.4).
    pub fn data(&self) -> Option<&[BTreeMap<String, Value>]> {
        match &self.kind {
            StepResultKind::Query { data, .. } => Some(data),
            StepResultKind::HttpCall { data, .. } => data.as_deref(),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<usize> {
        match &self.kind {
            StepResultKind::Query { count, .. } => Some(*count),
            StepResultKind::HttpCall { count, .. } => *count,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_success_populates_count() {
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), Value::Int(1));
        let r = StepResult::query_success(vec![row.clone(), row], 0, Duration::from_millis(5));
        assert_eq!(r.count(), Some(2));
        assert!(r.success);
    }
}
