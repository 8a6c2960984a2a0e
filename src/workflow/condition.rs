//! Typed workflow conditions
//!
//! A condition compares one proposal attribute with a stored value. Cost is
//! compared numerically; category, location and event are compared as
//! membership in a comma-separated, case-insensitive list. Anything that
//! cannot be evaluated (unknown type or operator, unparseable value, missing
//! attribute) evaluates to `false`.

use serde::{Deserialize, Serialize};

use crate::models::ProposalAttributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Cost,
    Category,
    LocationDivision,
    LocationDepartment,
    Event,
}

impl ConditionField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionField::Cost => "COST",
            ConditionField::Category => "CATEGORY",
            ConditionField::LocationDivision => "LOCATION-DIVISION",
            ConditionField::LocationDepartment => "LOCATION-DEPARTMENT",
            ConditionField::Event => "EVENT",
        }
    }

    fn value<'a>(&self, attrs: &'a ProposalAttributes) -> FieldValue<'a> {
        match self {
            ConditionField::Cost => FieldValue::Number(attrs.cost),
            ConditionField::Category => FieldValue::Text(attrs.category_id.as_deref()),
            ConditionField::LocationDivision => FieldValue::Text(attrs.division_id.as_deref()),
            ConditionField::LocationDepartment => {
                FieldValue::Text(attrs.department_id.as_deref())
            }
            ConditionField::Event => FieldValue::Text(attrs.event_id.as_deref()),
        }
    }
}

impl std::str::FromStr for ConditionField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "COST" => Ok(ConditionField::Cost),
            "CATEGORY" => Ok(ConditionField::Category),
            "LOCATION-DIVISION" => Ok(ConditionField::LocationDivision),
            "LOCATION-DEPARTMENT" => Ok(ConditionField::LocationDepartment),
            "EVENT" => Ok(ConditionField::Event),
            _ => Err(format!("Invalid condition type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gte,
    Lte,
    Gt,
    Lt,
    Eq,
    Ne,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gte => ">=",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
        }
    }
}

impl std::str::FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            ">=" => Ok(Operator::Gte),
            "<=" => Ok(Operator::Lte),
            ">" => Ok(Operator::Gt),
            "<" => Ok(Operator::Lt),
            "=" | "==" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::Ne),
            "IN" => Ok(Operator::In),
            "NOT_IN" | "NOT IN" => Ok(Operator::NotIn),
            _ => Err(format!("Invalid operator: {}", s)),
        }
    }
}

/// What a condition tests. Stored rows whose type or operator is not
/// recognised are kept verbatim so they can be shown and fixed, and never match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionRule {
    Typed {
        field: ConditionField,
        operator: Operator,
    },
    Unsupported {
        condition_type: String,
        operator: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub rule: ConditionRule,
    /// Scalar or comma-separated list
    pub value: String,
    pub is_active: bool,
}

enum FieldValue<'a> {
    Number(i64),
    Text(Option<&'a str>),
}

impl Condition {
    pub fn new(field: ConditionField, operator: Operator, value: impl Into<String>) -> Self {
        Self {
            rule: ConditionRule::Typed { field, operator },
            value: value.into(),
            is_active: true,
        }
    }

    /// Build from stored strings
    pub fn from_raw(condition_type: &str, operator: &str, value: impl Into<String>) -> Self {
        let rule = match (
            condition_type.parse::<ConditionField>(),
            operator.parse::<Operator>(),
        ) {
            (Ok(field), Ok(operator)) => ConditionRule::Typed { field, operator },
            _ => ConditionRule::Unsupported {
                condition_type: condition_type.to_string(),
                operator: operator.to_string(),
            },
        };
        Self {
            rule,
            value: value.into(),
            is_active: true,
        }
    }

    pub fn condition_type(&self) -> &str {
        match &self.rule {
            ConditionRule::Typed { field, .. } => field.as_str(),
            ConditionRule::Unsupported { condition_type, .. } => condition_type,
        }
    }

    pub fn operator(&self) -> &str {
        match &self.rule {
            ConditionRule::Typed { operator, .. } => operator.as_str(),
            ConditionRule::Unsupported { operator, .. } => operator,
        }
    }

    pub fn evaluate(&self, attrs: &ProposalAttributes) -> bool {
        match &self.rule {
            ConditionRule::Typed { field, operator } => match field.value(attrs) {
                FieldValue::Number(n) => evaluate_numeric(*operator, n, &self.value),
                FieldValue::Text(text) => evaluate_set(*operator, text, &self.value),
            },
            ConditionRule::Unsupported { .. } => false,
        }
    }
}

fn evaluate_numeric(operator: Operator, actual: i64, stored: &str) -> bool {
    match operator {
        Operator::In | Operator::NotIn => {
            let members: Vec<i64> = split_list(stored)
                .filter_map(|item| item.parse().ok())
                .collect();
            if members.is_empty() {
                return false;
            }
            let found = members.contains(&actual);
            if operator == Operator::In {
                found
            } else {
                !found
            }
        }
        Operator::Gte
        | Operator::Lte
        | Operator::Gt
        | Operator::Lt
        | Operator::Eq
        | Operator::Ne => {
            let Ok(expected) = stored.trim().parse::<i64>() else {
                return false;
            };
            match operator {
                Operator::Gte => actual >= expected,
                Operator::Lte => actual <= expected,
                Operator::Gt => actual > expected,
                Operator::Lt => actual < expected,
                Operator::Eq => actual == expected,
                Operator::Ne => actual != expected,
                Operator::In | Operator::NotIn => false,
            }
        }
    }
}

fn evaluate_set(operator: Operator, actual: Option<&str>, stored: &str) -> bool {
    let Some(actual) = actual.map(str::trim).filter(|a| !a.is_empty()) else {
        return false;
    };
    let found = split_list(stored).any(|item| item.eq_ignore_ascii_case(actual));
    match operator {
        Operator::In | Operator::Eq => found,
        Operator::NotIn | Operator::Ne => !found,
        Operator::Gte | Operator::Lte | Operator::Gt | Operator::Lt => false,
    }
}

fn split_list(stored: &str) -> impl Iterator<Item = &str> {
    stored.split(',').map(str::trim).filter(|s| !s.is_empty())
}
