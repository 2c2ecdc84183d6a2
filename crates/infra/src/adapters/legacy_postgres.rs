//! Postgres access to the legacy system's native tables.
//!
//! The legacy tables have no sequence behind their primary keys. New rows take
//! `MAX(id) + 1` inside the `INSERT` itself; two writers racing for the same
//! id trip the primary key constraint (`23505`) and the loser simply tries
//! again with a fresh `MAX`.
//!
//! Native ids are read back as `BIGINT` whatever integer width the legacy
//! column uses.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::{instrument, warn};

use super::legacy::{Fields, LegacyRepository};
use super::DeliveryError;
use crate::payload::legacy::{ENCOUNTER_TABLE, ORDER_TABLE, PATIENT_TABLE};

const MAX_ID_ATTEMPTS: usize = 5;

/// Column layout of one legacy table that the adapter is allowed to write.
#[derive(Debug)]
struct LegacyTable {
    name: &'static str,
    id_column: &'static str,
    key_column: &'static str,
    status_column: &'static str,
    inactive_value: &'static str,
    /// `(column, SQL type)`
    columns: &'static [(&'static str, &'static str)],
}

const TABLES: &[LegacyTable] = &[
    LegacyTable {
        name: PATIENT_TABLE,
        id_column: "pid",
        key_column: "pubpid",
        status_column: "status",
        inactive_value: "inactive",
        columns: &[
            ("pubpid", "text"),
            ("fname", "text"),
            ("lname", "text"),
            ("DOB", "date"),
            ("sex", "text"),
            ("street", "text"),
            ("city", "text"),
            ("state", "text"),
            ("phone_home", "text"),
            ("phone_cell", "text"),
            ("email", "text"),
            ("status", "text"),
        ],
    },
    LegacyTable {
        name: ENCOUNTER_TABLE,
        id_column: "encounter",
        key_column: "external_id",
        status_column: "status",
        inactive_value: "inactive",
        columns: &[
            ("external_id", "text"),
            ("pubpid", "text"),
            ("date", "timestamptz"),
            ("date_end", "timestamptz"),
            ("reason", "text"),
            ("class_code", "text"),
            ("provider", "text"),
            ("status", "text"),
        ],
    },
    LegacyTable {
        name: ORDER_TABLE,
        id_column: "procedure_order_id",
        key_column: "control_id",
        status_column: "order_status",
        inactive_value: "canceled",
        columns: &[
            ("control_id", "text"),
            ("pubpid", "text"),
            ("encounter_ref", "text"),
            ("procedure_order_type", "text"),
            ("procedure_code", "text"),
            ("procedure_name", "text"),
            ("order_priority", "text"),
            ("order_status", "text"),
            ("date_ordered", "date"),
        ],
    },
];

fn table(name: &str) -> Result<&'static LegacyTable, DeliveryError> {
    TABLES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| DeliveryError::InvalidPayload(format!("unknown legacy table `{name}`")))
}

impl LegacyTable {
    fn insert_sql(&self) -> String {
        let columns: Vec<_> = self.columns.iter().map(|(c, _)| format!("\"{c}\"")).collect();
        let values: Vec<_> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, (_, ty))| format!("CAST(${} AS {ty})", i + 1))
            .collect();
        format!(
            "INSERT INTO \"{table}\" (\"{id}\", {columns}) \
             SELECT COALESCE(MAX(\"{id}\"), 0) + 1, {values} FROM \"{table}\" \
             RETURNING \"{id}\"::BIGINT",
            table = self.name,
            id = self.id_column,
            columns = columns.join(", "),
            values = values.join(", "),
        )
    }

    /// Columns of `fields` this table knows, in declaration order.
    fn known(&self, fields: &Fields) -> Vec<(&'static str, &'static str, Option<String>)> {
        self.columns
            .iter()
            .filter(|(c, _)| fields.contains_key(*c))
            .map(|(c, ty)| (*c, *ty, fields.get(*c).and_then(as_text)))
            .collect()
    }

    fn update_sql(&self, columns: &[(&str, &str, Option<String>)]) -> String {
        let assignments: Vec<_> = columns
            .iter()
            .enumerate()
            .map(|(i, (c, ty, _))| format!("\"{c}\" = CAST(${} AS {ty})", i + 2))
            .collect();
        format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = $1",
            self.name,
            assignments.join(", "),
            self.id_column
        )
    }
}

/// Bind representation of a JSON field.
fn as_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DeliveryError {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            DeliveryError::Conflict(format!("{operation}: {}", db_err.message()))
        }
        sqlx::Error::Database(db_err) => {
            DeliveryError::Repository(format!("{operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            DeliveryError::Network(format!("{operation}: {err}"))
        }
        other => DeliveryError::Repository(format!("{operation}: {other}")),
    }
}

#[derive(Debug, Clone)]
pub struct PostgresLegacyRepository {
    pool: PgPool,
}

impl PostgresLegacyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LegacyRepository for PostgresLegacyRepository {
    #[instrument(skip(self, fields), err)]
    async fn create_record(
        &self,
        table_name: &str,
        external_key: &str,
        fields: &Fields,
    ) -> Result<i64, DeliveryError> {
        let table = table(table_name)?;
        let sql = table.insert_sql();

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let mut query = sqlx::query_scalar::<_, i64>(&sql);
            for (column, _) in table.columns {
                let value = if *column == table.key_column {
                    Some(external_key.to_string())
                } else {
                    fields.get(*column).and_then(as_text)
                };
                query = query.bind(value);
            }

            match query.fetch_one(&self.pool).await {
                Ok(native_id) => return Ok(native_id),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    warn!(table = table.name, attempt, "native id collision; retrying");
                }
                Err(err) => return Err(map_sqlx_error("create_record", err)),
            }
        }

        Err(DeliveryError::Conflict(format!(
            "could not allocate a {} id after {MAX_ID_ATTEMPTS} attempts",
            table.name
        )))
    }

    #[instrument(skip(self, fields), err)]
    async fn update_record(
        &self,
        table_name: &str,
        native_id: i64,
        fields: &Fields,
    ) -> Result<bool, DeliveryError> {
        let table = table(table_name)?;
        let columns = table.known(fields);
        if columns.is_empty() {
            return self.exists(table, native_id).await;
        }

        let sql = table.update_sql(&columns);
        let mut query = sqlx::query(&sql).bind(native_id);
        for (_, _, value) in columns {
            query = query.bind(value);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_record", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn deactivate_record(
        &self,
        table_name: &str,
        native_id: i64,
    ) -> Result<bool, DeliveryError> {
        let table = table(table_name)?;
        let sql = format!(
            "UPDATE \"{}\" SET \"{}\" = $2 WHERE \"{}\" = $1",
            table.name, table.status_column, table.id_column
        );
        let result = sqlx::query(&sql)
            .bind(native_id)
            .bind(table.inactive_value)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("deactivate_record", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_external_key(
        &self,
        table_name: &str,
        external_key: &str,
    ) -> Result<Option<i64>, DeliveryError> {
        let table = table(table_name)?;
        let sql = format!(
            "SELECT \"{}\"::BIGINT FROM \"{}\" WHERE \"{}\" = $1 ORDER BY \"{}\" LIMIT 1",
            table.id_column, table.name, table.key_column, table.id_column
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(external_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_external_key", e))
    }
}

impl PostgresLegacyRepository {
    async fn exists(&self, table: &LegacyTable, native_id: i64) -> Result<bool, DeliveryError> {
        let sql = format!(
            "SELECT 1 FROM \"{}\" WHERE \"{}\" = $1",
            table.name, table.id_column
        );
        let row = sqlx::query(&sql)
            .bind(native_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }
}


#[cfg(test)]
mod db_tests {
    use super::*;
    use serde_json::json;

    use crate::test_db::TestDb;

    // Legacy keys are plain INTEGER columns.
    const LEGACY_DDL: &str = r#"
        CREATE TABLE patient_data (
            pid INTEGER PRIMARY KEY,
            pubpid TEXT, fname TEXT, lname TEXT, "DOB" DATE, sex TEXT,
            street TEXT, city TEXT, state TEXT,
            phone_home TEXT, phone_cell TEXT, email TEXT, status TEXT
        )
    "#;

    async fn repository(db: &TestDb) -> PostgresLegacyRepository {
        sqlx::query(LEGACY_DDL).execute(&db.pool).await.unwrap();
        PostgresLegacyRepository::new(db.pool.clone())
    }

    fn patient(fname: &str) -> Fields {
        json!({
            "fname": fname,
            "lname": "Kim",
            "DOB": "1980-01-02",
            "sex": "Female",
            "status": "active"
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[tokio::test]
    async fn records_round_trip_through_integer_keys() {
        let Some(db) = TestDb::connect().await else {
            return;
        };
        let repo = repository(&db).await;

        let first = repo.create_record(PATIENT_TABLE, "P-1", &patient("Ana")).await.unwrap();
        let second = repo.create_record(PATIENT_TABLE, "P-2", &patient("Bo")).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(
            repo.find_by_external_key(PATIENT_TABLE, "P-2").await.unwrap(),
            Some(2)
        );
        assert_eq!(repo.find_by_external_key(PATIENT_TABLE, "P-9").await.unwrap(), None);

        let renamed = json!({ "fname": "Bora" }).as_object().unwrap().clone();
        assert!(repo.update_record(PATIENT_TABLE, 2, &renamed).await.unwrap());
        assert!(!repo.update_record(PATIENT_TABLE, 99, &renamed).await.unwrap());
        assert!(repo.deactivate_record(PATIENT_TABLE, 1).await.unwrap());

        let rows: Vec<(i32, String, String)> =
            sqlx::query_as("SELECT pid, fname, status FROM patient_data ORDER BY pid")
                .fetch_all(&db.pool)
                .await
                .unwrap();
        assert_eq!(
            rows,
            [
                (1, "Ana".to_string(), "inactive".to_string()),
                (2, "Bora".to_string(), "active".to_string()),
            ]
        );
        db.drop_schema().await;
    }

    #[tokio::test]
    async fn concurrent_creates_get_distinct_ids() {
        let Some(db) = TestDb::connect().await else {
            return;
        };
        let repo = repository(&db).await;

        let mut creates = Vec::new();
        for n in 0..4 {
            let repo = repo.clone();
            creates.push(tokio::spawn(async move {
                repo.create_record(PATIENT_TABLE, &format!("P-{n}"), &patient("Ana"))
                    .await
            }));
        }
        let mut ids = Vec::new();
        for create in creates {
            ids.push(create.await.unwrap().unwrap());
        }
        ids.sort_unstable();

        assert_eq!(ids, [1, 2, 3, 4]);
        db.drop_schema().await;
    }
}
