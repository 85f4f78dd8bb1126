//! Partial `UPDATE` statements.

use chrono::Utc;
use sqlx::{Encode, QueryBuilder, Sqlite, SqliteConnection, Type};

/// Builds `UPDATE <table> SET a = ?, b = ?, updated_at = ? WHERE id = ?`
/// from only the fields a caller supplied.
pub(crate) struct UpdateBuilder<'a> {
    builder: QueryBuilder<'a, Sqlite>,
    fields: usize,
}

impl<'a> UpdateBuilder<'a> {
    pub fn new(table: &str) -> Self {
        Self {
            builder: QueryBuilder::new(format!("UPDATE {table} SET ")),
            fields: 0,
        }
    }

    pub fn set<T>(&mut self, column: &str, value: T) -> &mut Self
    where
        T: 'a + Encode<'a, Sqlite> + Type<Sqlite> + Send,
    {
        if self.fields > 0 {
            self.builder.push(", ");
        }
        self.builder.push(column).push(" = ").push_bind(value);
        self.fields += 1;
        self
    }

    /// Set `column` only when a value was supplied.
    pub fn set_opt<T>(&mut self, column: &str, value: Option<T>) -> &mut Self
    where
        T: 'a + Encode<'a, Sqlite> + Type<Sqlite> + Send,
    {
        if let Some(value) = value {
            self.set(column, value);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields == 0
    }

    /// Stamp `updated_at` and run the statement against the row with `id`.
    /// Returns the number of rows touched.
    pub async fn execute<I>(mut self, id: I, conn: &mut SqliteConnection) -> Result<u64, sqlx::Error>
    where
        I: 'a + Encode<'a, Sqlite> + Type<Sqlite> + Send,
    {
        self.set("updated_at", Utc::now());
        self.builder.push(" WHERE id = ").push_bind(id);
        let query = self.builder.build();
        Ok(query.execute(conn).await?.rows_affected())
    }

    #[cfg(test)]
    fn sql(&self) -> &str {
        self.builder.sql()
    }
}
