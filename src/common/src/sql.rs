//! Quoting helpers for SQL whose table and column names come from catalog
//! data. Values are always bound as parameters; only identifiers and the
//! occasional DDL literal go through here.

/// Quote an identifier, doubling embedded double quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema-qualified identifier, e.g. `"terrama2"."storages"`.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Quote a possibly schema-qualified table name, e.g. `public.dcp_data_5`.
pub fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// Split `schema.table` into its parts; an unqualified name has no schema.
pub fn split_table(name: &str) -> (Option<&str>, &str) {
    match name.rsplit_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
