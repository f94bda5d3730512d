use crate::application::repos::StoreError;
use crate::domain::keys::ResourceKind;

pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(io) => StoreError::Io(io),
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::serialization(format!("column {index}: {source}"))
        }
        sqlx::Error::Decode(source) => StoreError::serialization(source),
        other => StoreError::backend(other),
    }
}

/// Quoted SQL identifier of the record table for `table`.
///
/// Table names are resource kind names; anything that does not parse as one
/// is rejected before it reaches SQL.
pub fn record_table(table: &str) -> Result<String, StoreError> {
    let kind = ResourceKind::parse(table).map_err(|_| StoreError::InvalidTable {
        table: table.to_string(),
    })?;
    Ok(format!("\"records_{}\"", kind.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_table_quotes_valid_kinds() {
        assert_eq!(record_table("task").expect("valid"), "\"records_task\"");
        assert_eq!(
            record_table("entity-types").expect("valid"),
            "\"records_entity-types\""
        );
    }

    #[test]
    fn record_table_rejects_injection() {
        assert!(matches!(
            record_table("task\"; DROP TABLE x; --"),
            Err(StoreError::InvalidTable { .. })
        ));
        assert!(record_table("").is_err());
    }
}
