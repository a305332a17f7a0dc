use async_trait::async_trait;
use ph_core::{BusinessRecord, Cursor};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::{Page, SourceError, SourceFilter, SourceReader};

const SELECT_COLUMNS: &str = r#"
    id::int8 AS id,
    name::text AS name,
    description::text AS description,
    category::text AS category,
    town::text AS town,
    postcode::text AS postcode,
    address::text AS address,
    venue::text AS venue,
    age_min_months::int4 AS age_min_months,
    age_max_months::int4 AS age_max_months,
    day_of_week::text AS day_of_week,
    "time"::text AS time,
    price::text AS price,
    phone::text AS phone,
    email::text AS email,
    website::text AS website,
    is_featured,
    is_active,
    wheelchair_accessible,
    parking_available,
    direct_booking_available,
    rating::float8 AS rating,
    created_at::timestamptz AS created_at
"#;

/// Sort key shared by the name ordering, the name cursor and the name range
/// filter. Byte collation keeps it identical to Rust string ordering.
const NAME_KEY: &str = r#"COALESCE(lower(name), '') COLLATE "C""#;

/// Read-only paged access to the `businesses` table.
#[derive(Debug, Clone)]
pub struct PostgresSource {
    pool: PgPool,
    table: String,
    filter: SourceFilter,
}

impl PostgresSource {
    pub fn new(pool: PgPool, table: &str, filter: SourceFilter) -> Result<Self, SourceError> {
        if !is_valid_table_name(table) {
            return Err(SourceError::InvalidTable(table.to_string()));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
            filter,
        })
    }

    pub async fn connect(database_url: &str, table: &str, filter: SourceFilter) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Self::new(pool, table, filter)
    }

    fn page_query(&self, page_size: usize, cursor: &Cursor) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {SELECT_COLUMNS} FROM {} WHERE TRUE",
            self.table
        ));

        if self.filter.active_only {
            qb.push(" AND COALESCE(is_active, TRUE)");
        }
        if let Some(from) = &self.filter.name_from {
            qb.push(format!(" AND {NAME_KEY} >= "))
                .push_bind(from.to_lowercase());
        }
        if let Some(to) = &self.filter.name_to {
            qb.push(format!(" AND {NAME_KEY} < "))
                .push_bind(to.to_lowercase());
        }

        match cursor {
            Cursor::ById { after } => {
                if let Some(id) = after {
                    qb.push(" AND id > ").push_bind(*id);
                }
                qb.push(" ORDER BY id ASC");
                qb.push(" LIMIT ").push_bind(page_size as i64);
            }
            Cursor::ByName { after } => {
                if let Some((name, id)) = after {
                    qb.push(format!(" AND ({NAME_KEY}, id) > ("))
                        .push_bind(name.clone())
                        .push(", ")
                        .push_bind(*id)
                        .push(")");
                }
                qb.push(format!(" ORDER BY {NAME_KEY} ASC, id ASC"));
                qb.push(" LIMIT ").push_bind(page_size as i64);
            }
            Cursor::Sample { seed, after } => {
                if let Some((key, id)) = after {
                    qb.push(" AND (");
                    push_sample_key(&mut qb, seed);
                    qb.push(", id) > (")
                        .push_bind(key.clone())
                        .push(", ")
                        .push_bind(*id)
                        .push(")");
                }
                qb.push(" ORDER BY ");
                push_sample_key(&mut qb, seed);
                qb.push(" ASC, id ASC");
                qb.push(" LIMIT ").push_bind(page_size as i64);
            }
        }
        qb
    }
}

#[async_trait]
impl SourceReader for PostgresSource {
    async fn read_page(&self, page_size: usize, cursor: &Cursor) -> Result<Page, SourceError> {
        let mut qb = self.page_query(page_size, cursor);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let records = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(table = %self.table, rows = records.len(), ?cursor, "read source page");

        let next_cursor = match records.last() {
            Some(last) => cursor.after_record(last),
            None => cursor.clone(),
        };
        Ok(Page {
            records,
            next_cursor,
        })
    }
}

/// Same value as `ph_core::sample_key`, computed in SQL.
fn push_sample_key(qb: &mut QueryBuilder<'static, Postgres>, seed: &str) {
    qb.push("encode(sha256(convert_to(id::text || ")
        .push_bind(seed.to_string())
        .push(r#", 'UTF8')), 'hex') COLLATE "C""#);
}

fn row_to_record(row: &PgRow) -> Result<BusinessRecord, sqlx::Error> {
    Ok(BusinessRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        town: row.try_get("town")?,
        postcode: row.try_get("postcode")?,
        address: row.try_get("address")?,
        venue: row.try_get("venue")?,
        age_min_months: row.try_get("age_min_months")?,
        age_max_months: row.try_get("age_max_months")?,
        day_of_week: row.try_get("day_of_week")?,
        time: row.try_get("time")?,
        price: row.try_get("price")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        website: row.try_get("website")?,
        is_featured: row.try_get("is_featured")?,
        is_active: row.try_get("is_active")?,
        wheelchair_accessible: row.try_get("wheelchair_accessible")?,
        parking_available: row.try_get("parking_available")?,
        direct_booking_available: row.try_get("direct_booking_available")?,
        rating: row.try_get("rating")?,
        created_at: row.try_get("created_at")?,
    })
}

/// `table` or `schema.table`, identifier characters only.
fn is_valid_table_name(name: &str) -> bool {
    let parts = name.split('.').collect::<Vec<_>>();
    (1..=2).contains(&parts.len())
        && parts.iter().all(|part| {
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !part.starts_with(|c: char| c.is_ascii_digit())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_source(filter: SourceFilter) -> PostgresSource {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://ph:ph@localhost:5432/ph")
            .expect("lazy pool");
        PostgresSource::new(pool, "public.businesses", filter).expect("valid table")
    }

    #[test]
    fn table_names_are_identifiers_only() {
        assert!(is_valid_table_name("businesses"));
        assert!(is_valid_table_name("public.businesses"));
        assert!(!is_valid_table_name("businesses; DROP TABLE x"));
        assert!(!is_valid_table_name("a.b.c"));
        assert!(!is_valid_table_name("1table"));
    }

    #[tokio::test]
    async fn id_cursor_query_is_parameterised() {
        let source = lazy_source(SourceFilter::default());
        let sql = source
            .page_query(10, &Cursor::ById { after: Some(40) })
            .into_sql();
        assert!(sql.contains("FROM public.businesses WHERE TRUE AND id > $1 ORDER BY id ASC LIMIT $2"));
    }

    #[tokio::test]
    async fn name_cursor_query_uses_row_comparison_and_filters() {
        let source = lazy_source(SourceFilter {
            name_from: Some("A".into()),
            name_to: Some("M".into()),
            active_only: true,
        });
        let sql = source
            .page_query(
                25,
                &Cursor::ByName {
                    after: Some(("baby sensory".into(), 7)),
                },
            )
            .into_sql();
        assert!(sql.contains("COALESCE(is_active, TRUE)"));
        assert!(sql.contains(r#"COALESCE(lower(name), '') COLLATE "C" >= $1"#));
        assert!(sql.contains(r#"COALESCE(lower(name), '') COLLATE "C" < $2"#));
        assert!(sql.contains(r#"(COALESCE(lower(name), '') COLLATE "C", id) > ($3, $4)"#));
        assert!(sql.ends_with("LIMIT $5"));
    }

    #[tokio::test]
    async fn sample_query_is_seeded_keyset() {
        let source = lazy_source(SourceFilter::default());
        let first = source
            .page_query(
                10,
                &Cursor::Sample {
                    seed: "spring".into(),
                    after: None,
                },
            )
            .into_sql();
        assert!(first.contains(r#"ORDER BY encode(sha256(convert_to(id::text || $1, 'UTF8')), 'hex') COLLATE "C" ASC, id ASC"#));
        assert!(first.ends_with("LIMIT $2"));
        assert!(!first.contains("OFFSET"));

        let resumed = source
            .page_query(
                10,
                &Cursor::Sample {
                    seed: "spring".into(),
                    after: Some(("9f".into(), 12)),
                },
            )
            .into_sql();
        assert!(resumed.contains(r#"AND (encode(sha256(convert_to(id::text || $1, 'UTF8')), 'hex') COLLATE "C", id) > ($2, $3)"#));
        assert!(resumed.ends_with("LIMIT $5"));
    }
}
