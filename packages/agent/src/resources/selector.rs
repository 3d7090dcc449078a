// packages/agent/src/resources/selector.rs
//! Label selectors

use crate::resources::Labels;
use serde::{Deserialize, Serialize};

/// Operator applied by a [`LabelSelector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LabelSelectionOperator {
    /// Label equals the single selector value
    Equals,
    /// Label is absent or differs from the single selector value
    NotEquals,
    /// Label value is one of the selector values
    Contains,
    /// Label is absent or its value is none of the selector values
    NotContains,
    Exists,
    NotExists,
}

/// Selects resources by label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub key: String,

    pub operator: LabelSelectionOperator,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelector {
    pub fn new(
        key: impl Into<String>,
        operator: LabelSelectionOperator,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, LabelSelectionOperator::Equals, [value.into()])
    }

    pub fn contains(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(key, LabelSelectionOperator::Contains, values)
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::new(key, LabelSelectionOperator::Exists, Vec::<String>::new())
    }

    /// Check whether the given labels satisfy this selector
    pub fn selects(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            LabelSelectionOperator::Equals => {
                matches!((value, self.values.first()), (Some(v), Some(expected)) if v == expected)
            }
            LabelSelectionOperator::NotEquals => {
                !matches!((value, self.values.first()), (Some(v), Some(expected)) if v == expected)
            }
            LabelSelectionOperator::Contains => value.map_or(false, |v| self.values.contains(v)),
            LabelSelectionOperator::NotContains => !value.map_or(false, |v| self.values.contains(v)),
            LabelSelectionOperator::Exists => value.is_some(),
            LabelSelectionOperator::NotExists => value.is_none(),
        }
    }
}

/// Check whether every selector selects the given labels
pub fn selects_all(selectors: &[LabelSelector], labels: &Labels) -> bool {
    selectors.iter().all(|s| s.selects(labels))
}
