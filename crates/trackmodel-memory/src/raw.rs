//! The statement language of the raw passthrough.
//!
//! A deliberately small grammar, recognized with regular expressions:
//!
//! ```text
//! SELECT * | col[, col...] FROM relation [WHERE cond [AND cond...]]
//! INSERT INTO relation (col[, col...]) VALUES ($n[, $n...])
//! UPDATE relation SET col = $n[, col = $n...] [WHERE cond [AND cond...]]
//! DELETE FROM relation [WHERE cond [AND cond...]]
//!
//! cond := col = $n
//! ```
//!
//! Values only ever enter through `$n` placeholders (1-based) bound to the
//! structured parameter list; a literal where a value belongs is rejected.
//! Every error carries the statement text.

use crate::database::{Data, Schema, StoredRow, values_match};
use regex::Regex;
use std::sync::OnceLock;
use trackmodel_core::{Error, QueryError, QueryErrorKind, Result, Row, Value};

const IDENT: &str = "[A-Za-z_][A-Za-z0-9_]*";

struct Grammar {
    select: Regex,
    insert: Regex,
    update: Regex,
    delete: Regex,
    comparison: Regex,
    param: Regex,
    and: Regex,
    identifier: Regex,
}

impl Grammar {
    fn compile() -> std::result::Result<Self, regex::Error> {
        let tail = r"\s*;?\s*$";
        let filter = r"(?:\s+WHERE\s+(?P<where>.+?))?";
        Ok(Self {
            select: Regex::new(&format!(
                r"(?is)^\s*SELECT\s+(?P<columns>\*|{IDENT}(?:\s*,\s*{IDENT})*)\s+FROM\s+(?P<relation>{IDENT}){filter}{tail}"
            ))?,
            insert: Regex::new(&format!(
                r"(?is)^\s*INSERT\s+INTO\s+(?P<relation>{IDENT})\s*\((?P<columns>[^)]*)\)\s*VALUES\s*\((?P<values>[^)]*)\){tail}"
            ))?,
            update: Regex::new(&format!(
                r"(?is)^\s*UPDATE\s+(?P<relation>{IDENT})\s+SET\s+(?P<set>.+?){filter}{tail}"
            ))?,
            delete: Regex::new(&format!(
                r"(?is)^\s*DELETE\s+FROM\s+(?P<relation>{IDENT}){filter}{tail}"
            ))?,
            comparison: Regex::new(&format!(r"(?s)^\s*(?P<column>{IDENT})\s*=\s*(?P<operand>.+?)\s*$"))?,
            param: Regex::new(r"^\$(?P<index>[0-9]+)$")?,
            and: Regex::new(r"(?i)\s+AND\s+")?,
            identifier: Regex::new(&format!("^{IDENT}$"))?,
        })
    }
}

fn grammar() -> Result<&'static Grammar> {
    static GRAMMAR: OnceLock<std::result::Result<Grammar, regex::Error>> = OnceLock::new();
    GRAMMAR.get_or_init(Grammar::compile).as_ref().map_err(|e| {
        Error::Query(QueryError::new(
            QueryErrorKind::Database,
            format!("statement grammar failed to compile: {}", e),
        ))
    })
}

fn syntax(message: impl Into<String>) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Syntax, message))
}

/// A column compared to, or assigned from, a bound parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) column: String,
    /// 1-based parameter index.
    pub(crate) param: usize,
}

/// A parsed raw statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Statement {
    Select {
        relation: String,
        /// `None` for `*`.
        columns: Option<Vec<String>>,
        conditions: Vec<Binding>,
    },
    Insert {
        relation: String,
        values: Vec<Binding>,
    },
    Update {
        relation: String,
        assignments: Vec<Binding>,
        conditions: Vec<Binding>,
    },
    Delete {
        relation: String,
        conditions: Vec<Binding>,
    },
}

impl Statement {
    pub(crate) fn parse(text: &str) -> Result<Self> {
        let g = grammar()?;

        if let Some(caps) = g.select.captures(text) {
            let columns = match &caps["columns"] {
                "*" => None,
                list => Some(list.split(',').map(|c| c.trim().to_string()).collect()),
            };
            return Ok(Statement::Select {
                relation: caps["relation"].to_string(),
                columns,
                conditions: parse_conditions(g, caps.name("where").map(|m| m.as_str()))?,
            });
        }

        if let Some(caps) = g.insert.captures(text) {
            let columns: Vec<&str> = caps["columns"].split(',').map(str::trim).collect();
            let operands: Vec<&str> = caps["values"].split(',').map(str::trim).collect();
            if columns.len() != operands.len() {
                return Err(syntax(format!(
                    "INSERT names {} columns but gives {} values",
                    columns.len(),
                    operands.len()
                )));
            }
            let values = columns
                .into_iter()
                .zip(operands)
                .map(|(column, operand)| {
                    if !g.identifier.is_match(column) {
                        return Err(syntax(format!("invalid column name `{}`", column)));
                    }
                    Ok(Binding {
                        column: column.to_string(),
                        param: parse_param(g, operand)?,
                    })
                })
                .collect::<Result<_>>()?;
            return Ok(Statement::Insert {
                relation: caps["relation"].to_string(),
                values,
            });
        }

        if let Some(caps) = g.update.captures(text) {
            let assignments = caps["set"]
                .split(',')
                .map(|item| parse_binding(g, item))
                .collect::<Result<_>>()?;
            return Ok(Statement::Update {
                relation: caps["relation"].to_string(),
                assignments,
                conditions: parse_conditions(g, caps.name("where").map(|m| m.as_str()))?,
            });
        }

        if let Some(caps) = g.delete.captures(text) {
            return Ok(Statement::Delete {
                relation: caps["relation"].to_string(),
                conditions: parse_conditions(g, caps.name("where").map(|m| m.as_str()))?,
            });
        }

        Err(syntax("unrecognized statement"))
    }

    pub(crate) fn is_query(&self) -> bool {
        matches!(self, Statement::Select { .. })
    }

    fn bindings(&self) -> impl Iterator<Item = &Binding> {
        let (first, second): (&[Binding], &[Binding]) = match self {
            Statement::Select { conditions, .. } | Statement::Delete { conditions, .. } => (conditions, &[]),
            Statement::Insert { values, .. } => (values, &[]),
            Statement::Update {
                assignments,
                conditions,
                ..
            } => (assignments, conditions),
        };
        first.iter().chain(second)
    }

    /// Fail unless every placeholder has a parameter.
    pub(crate) fn check_params(&self, params: &[Value]) -> Result<()> {
        match self.bindings().map(|b| b.param).max() {
            Some(highest) if highest > params.len() => Err(Error::Query(QueryError::new(
                QueryErrorKind::Parameter,
                format!(
                    "statement uses ${} but {} parameters were given",
                    highest,
                    params.len()
                ),
            ))),
            _ => Ok(()),
        }
    }
}

fn parse_param(g: &Grammar, operand: &str) -> Result<usize> {
    let index = g
        .param
        .captures(operand)
        .and_then(|caps| caps["index"].parse::<usize>().ok())
        .filter(|index| *index > 0);
    index.ok_or_else(|| {
        syntax(format!(
            "inline literal `{}` where a value belongs; bind it as a $n parameter",
            operand
        ))
    })
}

fn parse_binding(g: &Grammar, text: &str) -> Result<Binding> {
    let caps = g
        .comparison
        .captures(text)
        .ok_or_else(|| syntax(format!("unsupported condition `{}`", text.trim())))?;
    Ok(Binding {
        column: caps["column"].to_string(),
        param: parse_param(g, &caps["operand"])?,
    })
}

fn parse_conditions(g: &Grammar, clause: Option<&str>) -> Result<Vec<Binding>> {
    match clause {
        Some(clause) => g.and.split(clause).map(|c| parse_binding(g, c)).collect(),
        None => Ok(Vec::new()),
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn param(params: &[Value], index: usize) -> &Value {
    &params[index - 1]
}

fn matches(row: &StoredRow, conditions: &[Binding], params: &[Value]) -> bool {
    conditions.iter().all(|cond| {
        row.iter()
            .any(|(c, v)| *c == cond.column && values_match(v, param(params, cond.param)))
    })
}

fn matching(data: &Data, schema: &Schema, relation: &str, conditions: &[Binding], params: &[Value]) -> Result<Vec<StoredRow>> {
    Ok(data
        .scan(schema, relation)?
        .into_iter()
        .filter(|row| matches(row, conditions, params))
        .collect())
}

/// Both columns of a junction row or the key column of a table row.
fn leading_key(row: &StoredRow, position: usize) -> Option<i64> {
    row.get(position)?.1.as_i64()
}

/// Run a SELECT.
pub(crate) fn query(data: &Data, schema: &Schema, statement: &Statement, params: &[Value]) -> Result<Vec<Row>> {
    statement.check_params(params)?;
    let Statement::Select {
        relation,
        columns,
        conditions,
    } = statement
    else {
        return Err(syntax("raw queries must be SELECT statements"));
    };

    let rows = matching(data, schema, relation, conditions, params)?;
    Ok(rows
        .into_iter()
        .map(|row| match columns {
            None => Row::from_pairs(row),
            Some(columns) => Row::from_pairs(columns.iter().map(|column| {
                let value = row
                    .iter()
                    .find(|(c, _)| c == column)
                    .map_or(Value::Null, |(_, v)| v.clone());
                (column.clone(), value)
            })),
        })
        .collect())
}

/// Run an INSERT, UPDATE or DELETE; returns the number of affected rows.
pub(crate) fn execute(data: &mut Data, schema: &Schema, statement: &Statement, params: &[Value]) -> Result<u64> {
    statement.check_params(params)?;
    match statement {
        Statement::Select { .. } => Err(syntax("SELECT cannot be executed; use a raw query")),

        Statement::Insert { relation, values } => {
            let bound = || values.iter().map(|b| (b.column.clone(), param(params, b.param).clone()));
            if let Some(junction) = schema.junction(relation) {
                let side = |column: &str| {
                    values
                        .iter()
                        .find(|b| b.column == column)
                        .and_then(|b| param(params, b.param).as_i64())
                        .ok_or_else(|| syntax(format!("{} requires an integer {}", relation, column)))
                };
                let (left, right) = (side(&junction.left_column)?, side(&junction.right_column)?);
                data.link(schema, relation, left, right)?;
                return Ok(1);
            }

            let key_column = &schema.table(relation)?.key_column;
            let key = match values.iter().find(|b| b.column == *key_column) {
                Some(b) => {
                    let value = param(params, b.param);
                    match value {
                        Value::Null => None,
                        other => Some(other.as_i64().ok_or_else(|| {
                            syntax(format!("{}.{} must be an integer", relation, key_column))
                        })?),
                    }
                }
                None => None,
            };
            data.insert(schema, relation, key, bound().collect())?;
            Ok(1)
        }

        Statement::Update {
            relation,
            assignments,
            conditions,
        } => {
            if schema.junction(relation).is_some() {
                return Err(syntax(format!("junction {} cannot be updated", relation)));
            }
            let changes: Vec<(String, Value)> = assignments
                .iter()
                .map(|b| (b.column.clone(), param(params, b.param).clone()))
                .collect();
            let mut affected = 0;
            for row in matching(data, schema, relation, conditions, params)? {
                if let Some(key) = leading_key(&row, 0) {
                    affected += data.update(schema, relation, key, changes.clone())?;
                }
            }
            Ok(affected)
        }

        Statement::Delete { relation, conditions } => {
            let junction = schema.junction(relation).is_some();
            let mut affected = 0;
            for row in matching(data, schema, relation, conditions, params)? {
                affected += if junction {
                    match (leading_key(&row, 0), leading_key(&row, 1)) {
                        (Some(left), Some(right)) => data.unlink(schema, relation, left, right)?,
                        _ => 0,
                    }
                } else {
                    match leading_key(&row, 0) {
                        Some(key) => data.delete(schema, relation, key)?,
                        None => 0,
                    }
                };
            }
            Ok(affected)
        }
    }
}

/// Attach the statement text to a query error that lacks it.
pub(crate) fn with_statement(error: Error, text: &str) -> Error {
    match error {
        Error::Query(q) if q.sql.is_none() => Error::Query(q.with_sql(text)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(statement: &Statement) -> &[Binding] {
        match statement {
            Statement::Select { conditions, .. }
            | Statement::Update { conditions, .. }
            | Statement::Delete { conditions, .. } => conditions,
            Statement::Insert { .. } => &[],
        }
    }

    #[test]
    fn test_parse_select_with_conditions() {
        let statement = Statement::parse("select title, stars FROM dishes where stars = $1 and title = $2;").unwrap();
        assert!(statement.is_query());
        match &statement {
            Statement::Select { relation, columns, .. } => {
                assert_eq!(relation, "dishes");
                assert_eq!(columns.as_deref(), Some(&["title".to_string(), "stars".to_string()][..]));
            }
            other => panic!("expected a select, got {other:?}"),
        }
        let params: Vec<usize> = conditions(&statement).iter().map(|b| b.param).collect();
        assert_eq!(params, vec![1, 2]);
    }

    #[test]
    fn test_parse_update_splits_set_and_where() {
        let statement = Statement::parse("UPDATE dishes SET notes = $1, stars = $2 WHERE id = $3").unwrap();
        match statement {
            Statement::Update {
                assignments,
                conditions,
                ..
            } => {
                assert_eq!(assignments.len(), 2);
                assert_eq!(assignments[1].column, "stars");
                assert_eq!(
                    conditions,
                    vec![Binding {
                        column: "id".to_string(),
                        param: 3
                    }]
                );
            }
            other => panic!("expected an update, got {other:?}"),
        }
    }

    #[test]
    fn test_inline_literals_are_rejected() {
        for text in [
            "SELECT * FROM dishes WHERE title = 'Porridge'",
            "DELETE FROM dishes WHERE id = 3",
            "UPDATE dishes SET stars = 5 WHERE id = $1",
            "INSERT INTO dishes (title) VALUES ('Porridge')",
        ] {
            let err = Statement::parse(text).unwrap_err();
            assert_eq!(err.query_kind(), Some(QueryErrorKind::Syntax), "{text}");
            assert!(err.to_string().contains("parameter"), "{text}");
        }
    }

    #[test]
    fn test_unrecognized_statement() {
        let err = Statement::parse("DROP TABLE dishes").unwrap_err();
        assert!(err.to_string().contains("unrecognized statement"));

        let err = with_statement(err, "DROP TABLE dishes");
        assert_eq!(err.sql(), Some("DROP TABLE dishes"));
    }

    #[test]
    fn test_parameter_count_is_checked() {
        let statement = Statement::parse("DELETE FROM dishes WHERE id = $2").unwrap();
        let err = statement.check_params(&[Value::BigInt(1)]).unwrap_err();
        assert_eq!(err.query_kind(), Some(QueryErrorKind::Parameter));
        assert!(statement.check_params(&[Value::Null, Value::BigInt(1)]).is_ok());

        let err = Statement::parse("DELETE FROM dishes WHERE id = $0").unwrap_err();
        assert_eq!(err.query_kind(), Some(QueryErrorKind::Syntax));
    }

    #[test]
    fn test_insert_column_count_must_match() {
        let err = Statement::parse("INSERT INTO dishes (title, stars) VALUES ($1)").unwrap_err();
        assert!(err.to_string().contains("2 columns but gives 1 values"));
    }
}
