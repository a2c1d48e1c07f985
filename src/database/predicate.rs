use crate::database::models::{AnalysisStatus, MediaType};
use chrono::{DateTime, Utc};

/// Every queryable asset field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Identifier,
    MediaType,
    ModifiedAt,
    CreatedAt,
    AddedOrder,
    Width,
    Height,
    ContentHash,
    PerceptualFingerprint,
    Embedding,
    EmbeddingVersion,
    AnalysisUpdatedAt,
    AnalysisStatus,
    AnalysisAttemptCount,
    AnalysisNextRetryAt,
    AnalysisErrorMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<MediaType> for Value {
    fn from(v: MediaType) -> Self {
        Value::Text(String::from(v))
    }
}

impl From<AnalysisStatus> for Value {
    fn from(v: AnalysisStatus) -> Self {
        Value::Text(String::from(v))
    }
}

/// Store-agnostic filter over asset records.
///
/// Comparisons against NULL are false, except `Ne`, which treats NULL as a
/// distinct value (`IS NOT` semantics).
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Always,
    IsNull(Field),
    NotNull(Field),
    Eq(Field, Value),
    Ne(Field, Value),
    Lt(Field, Value),
    Le(Field, Value),
    Gt(Field, Value),
    Ge(Field, Value),
    /// `left < right`, both columns non-null
    FieldLt(Field, Field),
    In(Field, Vec<Value>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(field: Field, value: impl Into<Value>) -> Self {
        Predicate::Eq(field, value.into())
    }

    pub fn ne(field: Field, value: impl Into<Value>) -> Self {
        Predicate::Ne(field, value.into())
    }

    pub fn lt(field: Field, value: impl Into<Value>) -> Self {
        Predicate::Lt(field, value.into())
    }

    pub fn le(field: Field, value: impl Into<Value>) -> Self {
        Predicate::Le(field, value.into())
    }

    pub fn ids<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::In(
            Field::Identifier,
            identifiers
                .into_iter()
                .map(|id| Value::Text(id.into()))
                .collect(),
        )
    }

    pub fn images() -> Self {
        Predicate::eq(Field::MediaType, MediaType::Image)
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::Always => other,
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            this => Predicate::And(vec![this, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }
}
