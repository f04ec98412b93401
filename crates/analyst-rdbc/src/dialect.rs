//! SQL dialect abstraction for analyst-rdbc
//!
//! Only the pieces the writers need: parameter placeholders and the shape of
//! a positional INSERT.

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Get the placeholder for a 1-based parameter index (e.g., $1, ?)
    fn placeholder(&self, index: usize) -> String;

    /// Build `INSERT INTO <table> (<columns>) VALUES (<placeholders>)`
    fn insert_sql(&self, table: &str, columns: &[String]) -> String {
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        )
    }
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }
}

/// SQLite dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }
}

/// Dialect for drivers that use anonymous `?` placeholders
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericDialect;

impl SqlDialect for GenericDialect {
    fn name(&self) -> &'static str {
        "Generic"
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }
}

/// Get a dialect by driver name
pub fn dialect_for(driver: &str) -> Box<dyn SqlDialect> {
    match driver.to_lowercase().as_str() {
        "postgres" | "postgresql" => Box::new(PostgresDialect),
        "sqlite" | "sqlite3" => Box::new(SqliteDialect),
        _ => Box::new(GenericDialect),
    }
}
