//! Parametrized reconciliation queries against the local mirror
//!
//! Queries are built per entity type from its descriptor; every caller-supplied
//! value travels as a typed bind parameter. Identifiers only ever come from the
//! static descriptors.

use chrono::{DateTime, Utc};
use recon_common::EntityType;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::Postgres;

use crate::entity::{descriptor, EntityDescriptor};

/// A typed bind value
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    Timestamp(DateTime<Utc>),
    BigInt(i64),
}

/// SQL text plus its bind values, in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct ReconQuery {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

impl ReconQuery {
    /// Attach the bind values to a sqlx query
    pub fn bind_to<'q, O>(&'q self, mut query: QueryAs<'q, Postgres, O, PgArguments>) -> QueryAs<'q, Postgres, O, PgArguments> {
        for bind in &self.binds {
            query = match bind {
                BindValue::Text(v) => query.bind(v.as_str()),
                BindValue::Timestamp(v) => query.bind(*v),
                BindValue::BigInt(v) => query.bind(*v),
            };
        }
        query
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Builds count, page and sample queries for one entity type
#[derive(Debug, Clone, Copy)]
pub struct LocalQueryBuilder {
    descriptor: &'static EntityDescriptor,
}

impl LocalQueryBuilder {
    pub fn new(entity: EntityType) -> Self {
        Self {
            descriptor: descriptor(entity),
        }
    }

    /// Projection: the primary key as `id`, the updated-at column, then every declared field
    fn projection(&self) -> String {
        let d = self.descriptor;
        let mut columns = vec![
            format!("{} AS \"id\"", quote(d.primary_key)),
            quote(d.updated_at_column),
        ];
        columns.extend(d.canonical_fields().map(quote));
        columns.join(", ")
    }

    fn table(&self) -> String {
        quote(self.descriptor.table)
    }

    fn pk(&self) -> String {
        quote(self.descriptor.primary_key)
    }

    fn since_clause(&self, since: Option<DateTime<Utc>>, binds: &mut Vec<BindValue>, clauses: &mut Vec<String>) {
        if let Some(since) = since {
            binds.push(BindValue::Timestamp(since));
            clauses.push(format!("{} >= ${}", quote(self.descriptor.updated_at_column), binds.len()));
        }
    }

    fn where_sql(clauses: &[String]) -> String {
        if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        }
    }

    pub fn count(&self, since: Option<DateTime<Utc>>) -> ReconQuery {
        let mut binds = Vec::new();
        let mut clauses = Vec::new();
        self.since_clause(since, &mut binds, &mut clauses);
        ReconQuery {
            sql: format!("SELECT COUNT(*) AS count FROM {}{}", self.table(), Self::where_sql(&clauses)),
            binds,
        }
    }

    /// One keyset page after `after`, ordered bytewise by primary key
    ///
    /// Rows are returned as a single JSON object column named `record`.
    pub fn page(&self, since: Option<DateTime<Utc>>, after: Option<&str>, limit: i64) -> ReconQuery {
        let mut binds = Vec::new();
        let mut clauses = Vec::new();
        self.since_clause(since, &mut binds, &mut clauses);
        if let Some(after) = after {
            binds.push(BindValue::Text(after.to_string()));
            clauses.push(format!("{} COLLATE \"C\" > ${}", self.pk(), binds.len()));
        }
        binds.push(BindValue::BigInt(limit));
        let limit_param = binds.len();

        ReconQuery {
            sql: format!(
                "SELECT to_jsonb(t) AS record FROM (SELECT {} FROM {}{} ORDER BY {} COLLATE \"C\" LIMIT ${}) t \
                 ORDER BY t.\"id\" COLLATE \"C\"",
                self.projection(),
                self.table(),
                Self::where_sql(&clauses),
                self.pk(),
                limit_param,
            ),
            binds,
        }
    }

    pub fn sample(&self, limit: i64) -> ReconQuery {
        self.page(None, None, limit)
    }
}
