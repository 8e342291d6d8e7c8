use thiserror::Error;

use crate::ast::Operator;

/// Relation reversal hit an operator with no inverse (`like`, `isDefined`, ...).
#[derive(Debug, Error, PartialEq)]
#[error("operator {0} has no inverse")]
pub struct ReverseOperatorError(pub Operator);
