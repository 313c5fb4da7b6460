use itertools::Itertools;

use super::TableRef;

/// Quotes an identifier with backticks so non-ASCII and reserved names stay valid.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

fn quote_table(table: &TableRef) -> String {
    quote_identifier(&table.qualified())
}

/// `MERGE target USING source ON key` updating every non-key column on a
/// match and inserting every column otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStatement {
    pub target: TableRef,
    pub source: TableRef,
    pub key: String,
    /// All destination columns in schema order, key included.
    pub columns: Vec<String>,
}

impl MergeStatement {
    pub fn new(target: TableRef, source: TableRef, key: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            target,
            source,
            key: key.into(),
            columns,
        }
    }

    pub fn update_columns(&self) -> impl Iterator<Item = &String> {
        self.columns.iter().filter(move |c| **c != self.key)
    }

    pub fn to_sql(&self) -> String {
        let key = quote_identifier(&self.key);
        let mut sql = format!(
            "MERGE {} T\nUSING {} S\nON T.{key} = S.{key}\n",
            quote_table(&self.target),
            quote_table(&self.source),
        );
        let assignments = self
            .update_columns()
            .map(|c| {
                let quoted = quote_identifier(c);
                format!("{quoted} = S.{quoted}")
            })
            .join(", ");
        // A key-only table has nothing to update.
        if !assignments.is_empty() {
            sql.push_str("WHEN MATCHED THEN\n  UPDATE SET ");
            sql.push_str(&assignments);
            sql.push('\n');
        }
        let insert_columns = self.columns.iter().map(|c| quote_identifier(c)).join(", ");
        let insert_values = self
            .columns
            .iter()
            .map(|c| format!("S.{}", quote_identifier(c)))
            .join(", ");
        sql.push_str(&format!(
            "WHEN NOT MATCHED THEN\n  INSERT ({insert_columns}) VALUES ({insert_values})"
        ));
        sql
    }
}
