//! Query parameters and the normalized result envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

/// Bind parameters: either positional or named.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    pub fn none() -> Self {
        Params::Positional(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::Positional(values) => values.is_empty(),
            Params::Named(values) => values.is_empty(),
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::none()
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(values: Map<String, Value>) -> Self {
        Params::Named(values)
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(default, rename = "dbType", skip_serializing_if = "Option::is_none")]
    pub db_type: Option<String>,
}

impl ColumnMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_type: None,
        }
    }
}

/// Everything a statement produced.
///
/// Statements that return no rows still produce an envelope with an empty
/// `rows` list; `rows_affected` is zero for pure reads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub rows_affected: u64,
    #[serde(default)]
    pub out_binds: Option<Map<String, Value>>,
    #[serde(default)]
    pub meta_data: Option<Vec<ColumnMeta>>,
}

impl QueryResult {
    pub fn with_rows(columns: Vec<ColumnMeta>, rows: Vec<Row>) -> Self {
        Self {
            rows,
            rows_affected: 0,
            out_binds: None,
            meta_data: Some(columns),
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_accept_sequence_or_mapping() {
        let positional: Params = serde_json::from_value(json!([1, "a"])).unwrap();
        assert_eq!(positional, Params::Positional(vec![json!(1), json!("a")]));

        let named: Params = serde_json::from_value(json!({"id": 7})).unwrap();
        match named {
            Params::Named(map) => assert_eq!(map.get("id"), Some(&json!(7))),
            other => panic!("expected named params, got {other:?}"),
        }
    }

    #[test]
    fn envelope_uses_camel_case_keys() {
        let mut row = Row::new();
        row.insert("ID".into(), json!(1));
        let result = QueryResult::with_rows(vec![ColumnMeta::named("ID")], vec![row]);
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(
            encoded,
            json!({
                "rows": [{"ID": 1}],
                "rowsAffected": 0,
                "outBinds": null,
                "metaData": [{"name": "ID"}],
            })
        );
    }
}
