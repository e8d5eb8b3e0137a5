//! Row query model shared by the HTTP and in-memory backends.

use std::cmp::Ordering;

use serde_json::Value as JsonValue;

use crate::Table;

/// Equality filter on one column.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: JsonValue,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &JsonValue) -> bool {
        let cell = row.get(&self.column).unwrap_or(&JsonValue::Null);
        json_eq(cell, &self.value)
    }

    /// PostgREST query parameter for this filter.
    pub fn to_param(&self) -> (String, String) {
        let rendered = match &self.value {
            JsonValue::Null => "is.null".to_string(),
            JsonValue::String(text) => format!("eq.{text}"),
            other => format!("eq.{other}"),
        };
        (self.column.clone(), rendered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn to_param(&self) -> String {
        let direction = if self.ascending { "asc" } else { "desc" };
        format!("{}.{direction}", self.column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
}

impl Query {
    pub fn table(table: Table) -> Self {
        Self {
            table,
            columns: "*".to_string(),
            filters: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.columns = columns.to_string();
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            self.columns.chars().filter(|c| !c.is_whitespace()).collect(),
        )];
        params.extend(self.filters.iter().map(Filter::to_param));
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(Order::to_param)
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".to_string(), order));
        }
        params
    }

    /// Orders rows in place the way Postgres would (nulls last ascending).
    pub fn sort_rows(&self, rows: &mut [JsonValue]) {
        if self.order.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            self.order
                .iter()
                .map(|order| {
                    let ord = compare_json(a.get(&order.column), b.get(&order.column));
                    if order.ascending {
                        ord
                    } else {
                        ord.reverse()
                    }
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }
}

/// One entry of a `select=` list: a column, `*`, or an embedded relation such
/// as `files(id,name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectItem {
    All,
    Column(String),
    Embed {
        table: String,
        columns: Vec<SelectItem>,
    },
}

pub fn parse_select(raw: &str) -> Vec<SelectItem> {
    split_top_level(raw)
        .into_iter()
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            if part == "*" {
                return Some(SelectItem::All);
            }
            match part.find('(') {
                Some(open) if part.ends_with(')') => Some(SelectItem::Embed {
                    table: part[..open].trim().to_string(),
                    columns: parse_select(&part[open + 1..part.len() - 1]),
                }),
                _ => Some(SelectItem::Column(part.to_string())),
            }
        })
        .collect()
}

fn split_top_level(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&raw[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

pub fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        (JsonValue::String(text), JsonValue::Number(n))
        | (JsonValue::Number(n), JsonValue::String(text)) => *text == n.to_string(),
        _ => a == b,
    }
}

pub fn compare_json(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => x.cmp(y),
        (Some(JsonValue::Bool(x)), Some(JsonValue::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
