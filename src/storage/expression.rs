//! Expression rendering for DynamoDB requests.
//!
//! Attribute names and values are always bound through placeholders
//! (`#n0`, `:v0`) so reserved words and internal names such as `_type`
//! never appear literally in an expression.

use std::collections::HashMap;

use super::{AttributeValue, Attributes, Condition, QueryRequest, SortCondition};

/// Accumulates placeholder bindings while rendering expressions.
#[derive(Debug, Default)]
pub struct ExpressionBuilder {
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl ExpressionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an attribute name, reusing the placeholder for repeated names.
    pub fn name(&mut self, attribute: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, n)| n.as_str() == attribute) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    pub fn value(&mut self, value: AttributeValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), value);
        placeholder
    }

    /// Render conditions joined with AND, or `None` when there are none.
    pub fn condition(&mut self, conditions: &[Condition]) -> Option<String> {
        if conditions.is_empty() {
            return None;
        }
        let clauses: Vec<String> = conditions
            .iter()
            .map(|condition| match condition {
                Condition::AttributeExists(attr) => {
                    format!("attribute_exists({})", self.name(attr))
                }
                Condition::AttributeNotExists(attr) => {
                    format!("attribute_not_exists({})", self.name(attr))
                }
                Condition::Equals(attr, value) => {
                    let name = self.name(attr);
                    let value = self.value(value.clone());
                    format!("{} = {}", name, value)
                }
            })
            .collect();
        Some(clauses.join(" AND "))
    }

    /// Render a `SET ... ADD ...` update expression.
    ///
    /// `set_if_absent` attributes are assigned through `if_not_exists`.
    pub fn update(
        &mut self,
        set: &Attributes,
        set_if_absent: &Attributes,
        increment: &[(String, i64)],
    ) -> String {
        let mut sections = Vec::new();

        let mut assignments: Vec<String> = set
            .iter()
            .map(|(attr, value)| {
                let name = self.name(attr);
                let value = self.value(value.clone());
                format!("{} = {}", name, value)
            })
            .collect();
        for (attr, value) in set_if_absent {
            let name = self.name(attr);
            let value = self.value(value.clone());
            assignments.push(format!("{0} = if_not_exists({0}, {1})", name, value));
        }
        if !assignments.is_empty() {
            sections.push(format!("SET {}", assignments.join(", ")));
        }

        if !increment.is_empty() {
            let additions: Vec<String> = increment
                .iter()
                .map(|(attr, by)| {
                    let name = self.name(attr);
                    let value = self.value(AttributeValue::from(*by));
                    format!("{} {}", name, value)
                })
                .collect();
            sections.push(format!("ADD {}", additions.join(", ")));
        }

        sections.join(" ")
    }

    /// Render the key condition of a query.
    pub fn key_condition(&mut self, request: &QueryRequest) -> String {
        let partition = self.name(&request.partition_attribute);
        let partition_value = self.value(request.partition_value.clone());
        let mut expression = format!("{} = {}", partition, partition_value);

        if let (Some(attr), Some(condition)) = (&request.sort_attribute, &request.sort_condition) {
            let sort = self.name(attr);
            let clause = match condition {
                SortCondition::Equals(value) => {
                    format!("{} = {}", sort, self.value(value.clone()))
                }
                SortCondition::BeginsWith(prefix) => {
                    let prefix = self.value(AttributeValue::S(prefix.clone()));
                    format!("begins_with({}, {})", sort, prefix)
                }
            };
            expression.push_str(" AND ");
            expression.push_str(&clause);
        }

        expression
    }

    /// Consume the builder, yielding name and value bindings (`None` when empty).
    pub fn into_bindings(
        self,
    ) -> (
        Option<HashMap<String, String>>,
        Option<HashMap<String, AttributeValue>>,
    ) {
        let names = (!self.names.is_empty()).then_some(self.names);
        let values = (!self.values.is_empty()).then_some(self.values);
        (names, values)
    }
}
