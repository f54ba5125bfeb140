//! SQL rendering and parameter plumbing.
//!
//! Compiled fragments carry named `@Filter_Int{n}` placeholders so the
//! same fragment text is stable across engines; [rewrite_placeholders]
//! turns them into the dialect's positional form right before binding.

pub mod dialect;
pub mod postgres;
pub mod sqlite;
pub mod value;

pub use dialect::{JSON_RESULT, SqlDialect};
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;
pub use value::SqlValue;

/// Prefix of the named parameter placeholders used in compiled fragments.
pub const PARAM_PREFIX: &str = "@Filter_Int";

/// Named placeholder for a zero-based parameter counter.
pub fn param_name(counter: usize) -> String {
    format!("{PARAM_PREFIX}{counter}")
}

/// Replace every `@Filter_Int{n}` with the dialect's positional
/// placeholder for ordinal `n + 1`. A repeated name maps to the same
/// ordinal, so values are still bound once per counter.
pub fn rewrite_placeholders(sql: &str, dialect: &dyn SqlDialect) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find(PARAM_PREFIX) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + PARAM_PREFIX.len()..];
        let digits = tail.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            out.push_str(PARAM_PREFIX);
            rest = tail;
            continue;
        }
        match tail[..digits].parse::<usize>() {
            Ok(counter) => out.push_str(&dialect.positional_placeholder(counter + 1)),
            Err(_) => out.push_str(&rest[pos..pos + PARAM_PREFIX.len() + digits]),
        }
        rest = &tail[digits..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rewrite_for_sqlite() {
        let sql = "a = @Filter_Int0 AND b = @Filter_Int1";
        assert_eq!(
            rewrite_placeholders(sql, &SqliteDialect),
            "a = ?1 AND b = ?2"
        );
    }

    #[test]
    fn test_rewrite_for_postgres() {
        let sql = "a = @Filter_Int0 AND b = @Filter_Int11";
        assert_eq!(
            rewrite_placeholders(sql, &PostgresDialect),
            "a = $1 AND b = $12"
        );
    }

    #[test]
    fn test_rewrite_keeps_repeated_names_on_one_ordinal() {
        let sql = "x = @Filter_Int0 OR y = @Filter_Int0";
        assert_eq!(
            rewrite_placeholders(sql, &SqliteDialect),
            "x = ?1 OR y = ?1"
        );
    }

    #[test]
    fn test_rewrite_leaves_unrelated_text_alone() {
        let sql = "SELECT '@Filter_Int' || \"col\" FROM t";
        assert_eq!(rewrite_placeholders(sql, &SqliteDialect), sql);
    }
}
