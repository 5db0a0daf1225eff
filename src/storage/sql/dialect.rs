//! SQL dialect differences between SQLite and PostgreSQL.

use std::borrow::Cow;

use crate::{Error, Result};

/// Database flavor behind a [`super::SqlStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite, single writer.
    Sqlite,
    /// PostgreSQL, shared by any number of processes.
    Postgres,
}

impl Dialect {
    /// Pick the dialect from a connection URL scheme.
    pub fn from_url(database_url: &str) -> Result<Self> {
        if database_url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")
        {
            Ok(Dialect::Postgres)
        } else {
            Err(Error::Config(format!(
                "unsupported database URL scheme: {}",
                database_url.split(':').next().unwrap_or_default()
            )))
        }
    }

    /// Backend name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        }
    }

    /// Rewrite `?` placeholders into the dialect's form.
    pub fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
        match self {
            Dialect::Sqlite => Cow::Borrowed(query),
            Dialect::Postgres => {
                let mut out = String::with_capacity(query.len() + 16);
                let mut n = 0;
                for c in query.chars() {
                    if c == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(c);
                    }
                }
                Cow::Owned(out)
            }
        }
    }

    /// Whether receives can skip rows locked by concurrent receivers.
    pub fn supports_skip_locked(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Whether the database pushes change notifications to listeners.
    pub fn supports_notifications(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Column breaking ordering ties in insertion order.
    pub fn order_tiebreak(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "rowid",
            Dialect::Postgres => "seq",
        }
    }

    /// Row lock clause appended to receive queries.
    pub fn lock_clause(&self) -> &'static str {
        if self.supports_skip_locked() {
            " FOR UPDATE SKIP LOCKED"
        } else {
            ""
        }
    }

    /// Full delivery order clause.
    pub fn delivery_order(&self) -> String {
        format!(
            "ORDER BY priority DESC, order_by ASC, {} ASC",
            self.order_tiebreak()
        )
    }

    /// Whether writers must be serialized in process.
    pub fn single_writer(&self) -> bool {
        matches!(self, Dialect::Sqlite)
    }
}
