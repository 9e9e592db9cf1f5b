//! Statement routing.
//!
//! Decides whether SQL text must run on the writer or may run on a reader.
//! Two modes exist:
//!
//! - [`ClassifierMode::Heuristic`]: split on `;` and send the whole batch to the
//!   writer when any fragment starts with `insert`, `update` or `delete`.
//!   Other mutating verbs (`REPLACE`, `CALL`, upserts) are not detected.
//! - [`ClassifierMode::Parsed`]: parse with sqlparser in the backend's dialect
//!   and send only provably read-only statements to a reader. Anything else,
//!   including SQL that fails to parse, goes to the writer.

use crate::models::{ConnectionRole, DatabaseType};
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use tracing::debug;

/// Verbs that force the writer in heuristic mode.
const WRITE_PREFIXES: &[&str] = &["insert", "update", "delete"];

/// How statement text is classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClassifierMode {
    #[default]
    Heuristic,
    Parsed,
}

/// Routes SQL text to a [`ConnectionRole`].
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    mode: ClassifierMode,
    db_type: DatabaseType,
}

impl Classifier {
    pub fn new(mode: ClassifierMode, db_type: DatabaseType) -> Self {
        Self { mode, db_type }
    }

    pub fn mode(&self) -> ClassifierMode {
        self.mode
    }

    pub fn classify(&self, sql: &str) -> ConnectionRole {
        match self.mode {
            ClassifierMode::Heuristic => classify_heuristic(sql),
            ClassifierMode::Parsed => classify_parsed(sql, self.db_type),
        }
    }
}

/// Prefix check over every `;`-separated fragment.
pub fn classify_heuristic(sql: &str) -> ConnectionRole {
    let writes = fragments(sql).any(|fragment| {
        leading_keyword(fragment).is_some_and(|word| WRITE_PREFIXES.contains(&word.as_str()))
    });

    if writes {
        ConnectionRole::Writer
    } else {
        ConnectionRole::Reader
    }
}

/// Non-empty `;`-separated fragments, in order.
fn fragments(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|f| !f.is_empty())
}

/// Lower-cased words of a fragment, ignoring punctuation.
fn words(fragment: &str) -> impl Iterator<Item = String> + '_ {
    fragment
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Lower-cased first keyword of the statement, if any.
fn leading_keyword(sql: &str) -> Option<String> {
    words(sql).next()
}

/// What one statement fragment does to stored rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FragmentEffect {
    pub inserts: bool,
    pub modifies: bool,
}

impl FragmentEffect {
    fn from_verb(word: &str) -> Self {
        match word {
            "insert" | "replace" => Self {
                inserts: true,
                modifies: true,
            },
            "update" | "delete" => Self {
                inserts: false,
                modifies: true,
            },
            _ => Self::default(),
        }
    }

    pub(crate) fn union(self, other: Self) -> Self {
        Self {
            inserts: self.inserts || other.inserts,
            modifies: self.modifies || other.modifies,
        }
    }
}

/// Effect of every fragment, in statement order.
///
/// A fragment counts by its leading verb; a `WITH` prefix is looked through
/// to any data-modifying verb that follows it.
pub(crate) fn fragment_effects(sql: &str) -> Vec<FragmentEffect> {
    fragments(sql)
        .map(|fragment| {
            let mut words = words(fragment);
            match words.next().as_deref() {
                Some("with") => words
                    .map(|w| FragmentEffect::from_verb(&w))
                    .fold(FragmentEffect::default(), FragmentEffect::union),
                Some(verb) => FragmentEffect::from_verb(verb),
                None => FragmentEffect::default(),
            }
        })
        .collect()
}

/// Get the appropriate SQL dialect for the given database type.
fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// AST-based classification; only statements known to be read-only use a reader.
pub fn classify_parsed(sql: &str, db_type: DatabaseType) -> ConnectionRole {
    let dialect = get_dialect(db_type);
    let statements = match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!(error = %e, "Unparseable statement routed to writer");
            return ConnectionRole::Writer;
        }
    };

    if !statements.is_empty() && statements.iter().all(is_read_only) {
        ConnectionRole::Reader
    } else {
        ConnectionRole::Writer
    }
}

fn is_read_only(stmt: &Statement) -> bool {
    match stmt {
        Statement::Query(query) => is_read_only_query(query),
        Statement::Explain { statement, .. } => is_read_only(statement),
        Statement::ExplainTable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. } => true,
        _ => false,
    }
}

/// A query is read-only when it takes no row locks and neither its body nor
/// its CTEs modify data.
fn is_read_only_query(query: &Query) -> bool {
    if !query.locks.is_empty() {
        return false;
    }
    let ctes_read_only = query
        .with
        .as_ref()
        .is_none_or(|with| with.cte_tables.iter().all(|cte| is_read_only_query(&cte.query)));

    ctes_read_only && is_read_only_body(&query.body)
}

fn is_read_only_body(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => is_read_only_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            is_read_only_body(left) && is_read_only_body(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionRole::{Reader, Writer};

    #[test]
    fn test_heuristic_reads() {
        assert_eq!(classify_heuristic("SELECT 1"), Reader);
        assert_eq!(classify_heuristic("  select * from users where id = ?"), Reader);
        assert_eq!(classify_heuristic("SHOW SESSION VARIABLES LIKE 'wait_timeout'"), Reader);
        assert_eq!(classify_heuristic(""), Reader);
    }

    #[test]
    fn test_heuristic_writes() {
        assert_eq!(classify_heuristic("INSERT INTO t VALUES (1)"), Writer);
        assert_eq!(classify_heuristic("\n\tUpdate t SET x = 1"), Writer);
        assert_eq!(classify_heuristic("delete from t"), Writer);
    }

    #[test]
    fn test_heuristic_batch_with_one_write_goes_to_writer() {
        assert_eq!(
            classify_heuristic("SELECT 1; UPDATE t SET x = 1; SELECT 2"),
            Writer
        );
        assert_eq!(classify_heuristic("SELECT 1; SELECT 2;"), Reader);
    }

    #[test]
    fn test_heuristic_known_misses() {
        // Verbs outside the prefix list are not detected
        assert_eq!(classify_heuristic("REPLACE INTO t VALUES (1)"), Reader);
        assert_eq!(classify_heuristic("CALL add_points(5)"), Reader);
        // Mid-fragment keywords do not count
        assert_eq!(classify_heuristic("SELECT 'insert' AS word"), Reader);
    }

    #[test]
    fn test_parsed_reads() {
        for db in [DatabaseType::MySQL, DatabaseType::PostgreSQL, DatabaseType::SQLite] {
            assert_eq!(classify_parsed("SELECT 1", db), Reader, "{db}");
            assert_eq!(
                classify_parsed("SELECT a FROM t UNION SELECT b FROM u", db),
                Reader,
                "{db}"
            );
        }
        assert_eq!(
            classify_parsed("SHOW VARIABLES LIKE 'wait_timeout'", DatabaseType::MySQL),
            Reader
        );
        assert_eq!(
            classify_parsed("EXPLAIN SELECT * FROM t", DatabaseType::PostgreSQL),
            Reader
        );
    }

    #[test]
    fn test_parsed_writes() {
        let mysql = DatabaseType::MySQL;
        assert_eq!(classify_parsed("REPLACE INTO t VALUES (1)", mysql), Writer);
        assert_eq!(classify_parsed("CALL add_points(5)", mysql), Writer);
        assert_eq!(classify_parsed("CREATE TABLE t (id INT)", mysql), Writer);
        assert_eq!(
            classify_parsed("SELECT * FROM t WHERE id = 1 FOR UPDATE", mysql),
            Writer
        );
        assert_eq!(classify_parsed("SELECT 1; DELETE FROM t", mysql), Writer);
        assert_eq!(
            classify_parsed("EXPLAIN DELETE FROM t", DatabaseType::PostgreSQL),
            Writer
        );
    }

    #[test]
    fn test_parsed_data_modifying_cte() {
        let sql = "WITH moved AS (DELETE FROM a RETURNING *) SELECT * FROM moved";
        assert_eq!(classify_parsed(sql, DatabaseType::PostgreSQL), Writer);
    }

    #[test]
    fn test_parsed_unparseable_goes_to_writer() {
        assert_eq!(classify_parsed("SELEC oops", DatabaseType::MySQL), Writer);
        assert_eq!(classify_parsed("", DatabaseType::MySQL), Writer);
    }

    #[test]
    fn test_classifier_dispatch() {
        let heuristic = Classifier::new(ClassifierMode::Heuristic, DatabaseType::MySQL);
        let parsed = Classifier::new(ClassifierMode::Parsed, DatabaseType::MySQL);
        assert_eq!(heuristic.classify("CALL p()"), Reader);
        assert_eq!(parsed.classify("CALL p()"), Writer);
        assert_eq!(parsed.mode(), ClassifierMode::Parsed);
    }

    #[test]
    fn test_leading_keyword() {
        assert_eq!(leading_keyword("  INSERT INTO t").as_deref(), Some("insert"));
        assert_eq!(leading_keyword("(select 1)").as_deref(), Some("select"));
        assert_eq!(leading_keyword("   "), None);
    }

    #[test]
    fn test_fragment_effects() {
        let insert = FragmentEffect {
            inserts: true,
            modifies: true,
        };
        let update = FragmentEffect {
            inserts: false,
            modifies: true,
        };
        let read = FragmentEffect::default();

        assert_eq!(fragment_effects("SELECT 1"), vec![read]);
        assert_eq!(fragment_effects("insert or replace into t values (1)"), vec![insert]);
        assert_eq!(
            fragment_effects("UPDATE t SET x = 1; INSERT INTO t VALUES (2);"),
            vec![update, insert]
        );
        assert_eq!(
            fragment_effects("WITH v(x) AS (SELECT 1) INSERT INTO t SELECT x FROM v"),
            vec![insert]
        );
        assert_eq!(
            fragment_effects("WITH v AS (SELECT 1) SELECT * FROM v"),
            vec![read]
        );
        assert!(fragment_effects(" ; ").is_empty());
    }
}
