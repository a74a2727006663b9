//! Dataset tables as seen by the table executor.
//!
//! A [`DatasetStore`] is one PostGIS database holding series tables. The
//! executor describes a table, deletes its expired rows and, when backups
//! are requested, replays those rows into a backup table with the same
//! layout in another store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::sql::{quote_ident, quote_table};

use crate::error::Result;

/// PostGIS geometry metadata of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryInfo {
    pub geometry_type: String,
    pub srid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
    pub character_maximum_length: Option<i32>,
    pub is_nullable: bool,
    pub column_default: Option<String>,
    pub geometry: Option<GeometryInfo>,
}

impl ColumnDef {
    pub fn has_default(&self) -> bool {
        self.column_default.is_some()
    }

    /// Type used to cast bound text values back into the column.
    pub fn cast_type(&self) -> &str {
        match self.data_type.as_str() {
            "USER-DEFINED" | "ARRAY" => &self.udt_name,
            other => other,
        }
    }

    /// Type as written in `CREATE TABLE`.
    pub fn sql_type(&self) -> String {
        if let Some(geometry) = &self.geometry {
            return format!("{}({},{})", self.udt_name, geometry.geometry_type, geometry.srid);
        }
        match (self.data_type.as_str(), self.character_maximum_length) {
            ("character varying", Some(len)) => format!("character varying({len})"),
            ("character", Some(len)) => format!("character({len})"),
            ("USER-DEFINED", _) => self.udt_name.clone(),
            // information_schema names arrays "ARRAY" and the element as _int4
            ("ARRAY", _) => format!("{}[]", self.udt_name.trim_start_matches('_')),
            (other, _) => other.to_string(),
        }
    }
}

/// Sequence feeding a serial column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceDef {
    pub name: String,
    pub increment: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub start_value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    pub constraint_name: String,
    pub columns: Vec<String>,
}

/// Column layout of a dataset table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<PrimaryKey>,
    pub sequence: Option<SequenceDef>,
}

impl TableLayout {
    /// Columns carried over to backups; defaulted ones regenerate there.
    pub fn backup_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| !c.has_default())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Same layout under a new table name. The old name is replaced in
    /// defaults, the sequence, the primary key and defaulted column names.
    pub fn renamed(&self, backup_table: &str) -> TableLayout {
        let (_, source) = common::sql::split_table(&self.table);
        let (_, target) = common::sql::split_table(backup_table);
        let swap = |value: &str| value.replace(source, target);

        let columns = self
            .columns
            .iter()
            .map(|column| {
                let mut column = column.clone();
                if let Some(default) = &column.column_default {
                    column.name = swap(&column.name);
                    column.column_default = Some(swap(default));
                }
                column
            })
            .collect();

        let primary_key = self.primary_key.as_ref().map(|pk| PrimaryKey {
            constraint_name: swap(&pk.constraint_name),
            columns: pk
                .columns
                .iter()
                .map(|name| match self.column(name) {
                    Some(column) if column.has_default() => swap(name),
                    _ => name.clone(),
                })
                .collect(),
        });

        let sequence = self.sequence.as_ref().map(|seq| SequenceDef {
            name: swap(&seq.name),
            ..seq.clone()
        });

        TableLayout {
            table: backup_table.to_string(),
            columns,
            primary_key,
            sequence,
        }
    }

    pub fn create_sequence_sql(&self) -> Option<String> {
        self.sequence.as_ref().map(|seq| {
            format!(
                "CREATE SEQUENCE IF NOT EXISTS {} INCREMENT {} MINVALUE {} MAXVALUE {} START {} CACHE 1",
                quote_table(&seq.name),
                seq.increment,
                seq.min_value,
                seq.max_value,
                seq.start_value
            )
        })
    }

    pub fn create_table_sql(&self) -> String {
        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut def = format!("{} {}", quote_ident(&column.name), column.sql_type());
                if let Some(default) = &column.column_default {
                    def.push_str(" DEFAULT ");
                    def.push_str(default);
                }
                if !column.is_nullable {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();

        if let Some(pk) = &self.primary_key {
            let columns: Vec<String> = pk.columns.iter().map(|c| quote_ident(c)).collect();
            definitions.push(format!(
                "CONSTRAINT {} PRIMARY KEY ({})",
                quote_ident(&pk.constraint_name),
                columns.join(", ")
            ));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_table(&self.table),
            definitions.join(", ")
        )
    }

    /// Parameterised insert of one backup row, casting each text value back
    /// to its column type.
    pub fn insert_sql(&self, columns: &[String]) -> String {
        let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let values: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(idx, name)| match self.column(name) {
                Some(column) => format!("${}::{}", idx + 1, column.cast_type()),
                None => format!("${}", idx + 1),
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            quote_table(&self.table),
            names.join(", "),
            values.join(", ")
        )
    }
}

/// A deleted row, values rendered as text in `DeletedRows::columns` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedRow {
    pub timestamp: Option<DateTime<Utc>>,
    pub values: Vec<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletedRows {
    pub columns: Vec<String>,
    pub rows: Vec<DeletedRow>,
}

impl DeletedRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Timestamp of the last row the delete returned.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.last().and_then(|r| r.timestamp)
    }
}

/// One database holding dataset tables.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn describe(&self, table: &str) -> Result<TableLayout>;

    /// Delete rows whose `timestamp_column` is before `cutoff`, returning
    /// the columns listed in `returning`.
    async fn delete_older_than(
        &self,
        table: &str,
        timestamp_column: &str,
        cutoff: DateTime<Utc>,
        returning: &[String],
    ) -> Result<DeletedRows>;

    /// Create the backup sequence and table if missing.
    async fn ensure_table(&self, layout: &TableLayout) -> Result<()>;

    /// Insert rows into `layout.table` in one transaction, skipping
    /// conflicts. Returns the number of rows written.
    async fn insert_rows(&self, layout: &TableLayout, rows: &DeletedRows) -> Result<u64>;
}

/// Opens dataset stores by provider uri.
#[async_trait]
pub trait DatasetConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn DatasetStore>>;
}

/// Sequence name from a `nextval('schema.seq'::regclass)` default.
pub fn sequence_name_from_default(default: &str) -> Option<String> {
    let start = default.find("nextval(")? + "nextval(".len();
    let inner = &default[start..];
    let inner = inner.split("::").next()?.trim_end_matches(')');
    let name = inner.trim().trim_matches('\'').replace('"', "");
    let name = name.rsplit('.').next()?.to_string();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str, default: Option<&str>) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            data_type: data_type.to_string(),
            udt_name: data_type.to_string(),
            character_maximum_length: None,
            is_nullable: true,
            column_default: default.map(str::to_string),
            geometry: None,
        }
    }

    fn dcp_layout() -> TableLayout {
        let mut geom = column("geom", "USER-DEFINED", None);
        geom.udt_name = "geometry".to_string();
        geom.geometry = Some(GeometryInfo {
            geometry_type: "POINT".to_string(),
            srid: 4326,
        });

        TableLayout {
            table: "dcp_data_5".to_string(),
            columns: vec![
                column("id", "integer", Some("nextval('dcp_data_5_id_seq'::regclass)")),
                column("datetime", "timestamp with time zone", None),
                geom,
            ],
            primary_key: Some(PrimaryKey {
                constraint_name: "dcp_data_5_pkey".to_string(),
                columns: vec!["id".to_string()],
            }),
            sequence: Some(SequenceDef {
                name: "dcp_data_5_id_seq".to_string(),
                increment: 1,
                min_value: 1,
                max_value: i64::MAX,
                start_value: 1,
            }),
        }
    }

    #[test]
    fn test_sequence_name_from_default() {
        assert_eq!(
            sequence_name_from_default("nextval('dcp_data_5_id_seq'::regclass)").as_deref(),
            Some("dcp_data_5_id_seq")
        );
        assert_eq!(
            sequence_name_from_default("nextval('public.\"Odd_seq\"'::regclass)").as_deref(),
            Some("Odd_seq")
        );
        assert_eq!(sequence_name_from_default("now()"), None);
    }

    #[test]
    fn test_backup_columns_skip_defaults() {
        let layout = dcp_layout();
        let names: Vec<&str> = layout.backup_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["datetime", "geom"]);
    }

    #[test]
    fn test_renamed_layout() {
        let backup = dcp_layout().renamed("dcp_backup");

        assert_eq!(backup.table, "dcp_backup");
        assert_eq!(
            backup.columns[0].column_default.as_deref(),
            Some("nextval('dcp_backup_id_seq'::regclass)")
        );
        assert_eq!(backup.sequence.as_ref().unwrap().name, "dcp_backup_id_seq");
        assert_eq!(backup.primary_key.as_ref().unwrap().constraint_name, "dcp_backup_pkey");
        assert_eq!(backup.primary_key.as_ref().unwrap().columns, vec!["id"]);
    }

    #[test]
    fn test_create_sql() {
        let backup = dcp_layout().renamed("dcp_backup");

        let table = backup.create_table_sql();
        assert!(table.starts_with("CREATE TABLE IF NOT EXISTS \"dcp_backup\" ("));
        assert!(table.contains("\"geom\" geometry(POINT,4326)"));
        assert!(table.contains("CONSTRAINT \"dcp_backup_pkey\" PRIMARY KEY (\"id\")"));

        let sequence = backup.create_sequence_sql().unwrap();
        assert!(sequence.starts_with("CREATE SEQUENCE IF NOT EXISTS \"dcp_backup_id_seq\""));
        assert!(sequence.ends_with("CACHE 1"));
    }

    #[test]
    fn test_insert_sql_casts_values() {
        let layout = dcp_layout();
        let sql = layout.insert_sql(&["datetime".to_string(), "geom".to_string()]);
        assert_eq!(
            sql,
            "INSERT INTO \"dcp_data_5\" (\"datetime\", \"geom\") \
             VALUES ($1::timestamp with time zone, $2::geometry) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn test_varchar_type() {
        let mut name = column("name", "character varying", None);
        name.character_maximum_length = Some(40);
        assert_eq!(name.sql_type(), "character varying(40)");
        assert_eq!(name.cast_type(), "character varying");
    }
}
