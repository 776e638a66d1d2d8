use rusqlite::types::Value;

/// Minimal query builder: equality and set-membership predicates plus
/// limit and order. Everything richer is hand-written SQL at the call
/// site, which keeps this surface honest.
#[derive(Debug, Clone, Default)]
pub struct Query {
    clauses: Vec<Clause>,
    limit: Option<u32>,
    order_by: Option<String>,
}

#[derive(Debug, Clone)]
enum Clause {
    Equal(String, Value),
    In(String, Vec<Value>),
}

impl Query {
    pub fn new() -> Query {
        Query::default()
    }

    pub fn equal(mut self, column: &str, value: impl Into<Value>) -> Query {
        self.clauses.push(Clause::Equal(column.into(), value.into()));
        self
    }

    pub fn any<V: Into<Value>>(mut self, column: &str, values: Vec<V>) -> Query {
        self.clauses.push(Clause::In(
            column.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn limit(mut self, limit: u32) -> Query {
        self.limit = Some(limit);
        self
    }

    pub fn order_by(mut self, order: &str) -> Query {
        self.order_by = Some(order.into());
        self
    }

    /// Render `SELECT {what} FROM {table} ...` plus the bind values.
    pub fn to_sql(&self, table: &str, what: &str) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT {} FROM {}", what, table);
        let mut values = Vec::new();
        let mut predicates = Vec::new();

        for clause in &self.clauses {
            match clause {
                Clause::Equal(col, value) => {
                    values.push(value.clone());
                    predicates.push(format!("{} = ?{}", col, values.len()));
                }
                Clause::In(col, list) => {
                    if list.is_empty() {
                        // IN () is a syntax error; an empty set matches nothing.
                        predicates.push("0".to_string());
                        continue;
                    }
                    let mut marks = Vec::with_capacity(list.len());
                    for value in list {
                        values.push(value.clone());
                        marks.push(format!("?{}", values.len()));
                    }
                    predicates.push(format!("{} IN ({})", col, marks.join(",")));
                }
            }
        }

        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        if let Some(order) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        (sql, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_equality_and_membership() {
        let q = Query::new()
            .equal("folderId", "f-1".to_string())
            .any("folderImapUID", vec![3i64, 4, 5])
            .order_by("date DESC")
            .limit(10);
        let (sql, values) = q.to_sql("Message", "data");
        assert_eq!(
            sql,
            "SELECT data FROM Message WHERE folderId = ?1 AND folderImapUID IN (?2,?3,?4) \
             ORDER BY date DESC LIMIT 10"
        );
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn empty_membership_matches_nothing() {
        let q = Query::new().any::<i64>("uid", vec![]);
        let (sql, values) = q.to_sql("Message", "data");
        assert_eq!(sql, "SELECT data FROM Message WHERE 0");
        assert!(values.is_empty());
    }

    #[test]
    fn bare_query_selects_all() {
        let (sql, values) = Query::new().to_sql("Folder", "data");
        assert_eq!(sql, "SELECT data FROM Folder");
        assert!(values.is_empty());
    }
}
