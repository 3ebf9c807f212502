use thiserror::Error;

/// Why a candidate statement was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    #[error("SQL input is empty")]
    InvalidSqlInput,

    #[error("SQL input is longer than {max_chars} characters")]
    InputTooLong { max_chars: usize },

    #[error("only a single statement is allowed")]
    MultiStatement,

    #[error("only SELECT queries are allowed")]
    InvalidQueryType,

    #[error("table `{table}` is not available for querying")]
    DisallowedTable { table: String },

    #[error("access to system object `{object}` is not allowed")]
    SystemSchemaAccess { object: String },

    #[error("could not parse SQL: {message}")]
    ParseError { message: String },
}

impl GuardViolation {
    pub fn code(&self) -> &'static str {
        match self {
            GuardViolation::InvalidSqlInput | GuardViolation::InputTooLong { .. } => {
                "INVALID_SQL_INPUT"
            }
            GuardViolation::MultiStatement => "MULTI_STATEMENT",
            GuardViolation::InvalidQueryType => "INVALID_QUERY_TYPE",
            GuardViolation::DisallowedTable { .. } => "DISALLOWED_TABLE",
            GuardViolation::SystemSchemaAccess { .. } => "SYSTEM_SCHEMA_ACCESS",
            GuardViolation::ParseError { .. } => "SQL_PARSE_ERROR",
        }
    }

    pub(crate) fn parse(message: impl Into<String>) -> Self {
        GuardViolation::ParseError {
            message: message.into(),
        }
    }
}
