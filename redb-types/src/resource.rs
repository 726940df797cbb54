use crate::errors::ErrorKind;

pub const RESOURCE_URI_PREFIX: &str = "redb:/";

/// A fully-qualified column reference parsed from a `redb:/` resource URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    pub database_id: String,
    pub table: String,
    pub column: String,
}

impl ResourcePath {
    pub fn to_uri(&self) -> String {
        format!(
            "{RESOURCE_URI_PREFIX}data/database/{}/table/{}/column/{}",
            self.database_id, self.table, self.column
        )
    }
}

/// Parses `redb:/data/database/{id}/table/{name}/column/{name}`.
///
/// Exactly seven path segments in this fixed order are accepted; anything
/// else is an `InvalidQuery`.
pub fn parse_resource_uri(uri: &str) -> Result<ResourcePath, ErrorKind> {
    let invalid = || ErrorKind::InvalidQuery(format!("malformed resource uri `{uri}`"));

    let rest = uri.strip_prefix(RESOURCE_URI_PREFIX).ok_or_else(invalid)?;
    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        ["data", "database", database_id, "table", table, "column", column]
            if !database_id.is_empty() && !table.is_empty() && !column.is_empty() =>
        {
            Ok(ResourcePath {
                database_id: database_id.to_string(),
                table: table.to_string(),
                column: column.to_string(),
            })
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_column_uri() {
        let path = parse_resource_uri("redb:/data/database/db_1/table/t/column/c").unwrap();
        assert_eq!(path.database_id, "db_1");
        assert_eq!(path.table, "t");
        assert_eq!(path.column, "c");
    }

    #[test]
    fn truncated_uri_rejected() {
        assert!(matches!(
            parse_resource_uri("redb:/data/database/db_1/table/t"),
            Err(ErrorKind::InvalidQuery(_))
        ));
    }

    #[test]
    fn wrong_segment_order_rejected() {
        assert!(parse_resource_uri("redb:/data/table/t/database/db_1/column/c").is_err());
        assert!(parse_resource_uri("redb:/meta/database/db_1/table/t/column/c").is_err());
    }

    #[test]
    fn extra_segments_rejected() {
        assert!(parse_resource_uri("redb:/data/database/db_1/table/t/column/c/extra").is_err());
    }

    #[test]
    fn missing_prefix_rejected() {
        assert!(parse_resource_uri("data/database/db_1/table/t/column/c").is_err());
        assert!(parse_resource_uri("redb://data/database/db_1/table/t/column/c").is_err());
    }

    #[test]
    fn uri_round_trips() {
        let uri = "redb:/data/database/db_1/table/users/column/name";
        assert_eq!(parse_resource_uri(uri).unwrap().to_uri(), uri);
    }
}
