//! Row matching and document change commands.
//!
//! Every matcher has a SQL form, used to flag rows in bulk, and an in-memory
//! form, used when migrating a single loaded row. The two forms agree on
//! every input.

use crate::registry::DocumentRegistry;
use crate::row::DocumentRow;
use crate::schema::columns;
use crate::serializer::Serializer;
use crate::sql::{quote_ident, SqlFragment, SqlValue};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A predicate over document rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowMatcher {
    /// Matches every row.
    Always,
    /// Matches rows whose id is in the list. An empty list matches nothing.
    Ids(Vec<String>),
    /// Matches rows whose id starts with the prefix (case-sensitive).
    IdPrefix(String),
    /// Matches rows flagged for migration or reprojection.
    AwaitsReprojection,
}

impl RowMatcher {
    /// Match a list of ids.
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RowMatcher::Ids(ids.into_iter().map(Into::into).collect())
    }

    /// Match an id prefix.
    pub fn id_prefix(prefix: impl Into<String>) -> Self {
        RowMatcher::IdPrefix(prefix.into())
    }

    /// SQL form of the predicate.
    pub fn to_sql(&self) -> SqlFragment {
        match self {
            RowMatcher::Always => SqlFragment::always(),
            RowMatcher::Ids(ids) if ids.is_empty() => SqlFragment::never(),
            RowMatcher::Ids(ids) => {
                let placeholders = vec!["?"; ids.len()].join(", ");
                SqlFragment::new(
                    format!("{} IN ({})", quote_ident(columns::ID), placeholders),
                    ids.iter().map(|id| SqlValue::from(id.as_str())).collect(),
                )
            }
            RowMatcher::IdPrefix(prefix) => SqlFragment::new(
                format!("substr({}, 1, ?) = ?", quote_ident(columns::ID)),
                vec![
                    SqlValue::Integer(prefix.chars().count() as i64),
                    SqlValue::from(prefix.as_str()),
                ],
            ),
            RowMatcher::AwaitsReprojection => SqlFragment::new(
                format!("{} = 1", quote_ident(columns::AWAITS_REPROJECTION)),
                Vec::new(),
            ),
        }
    }

    /// In-memory form of the predicate.
    pub fn matches(&self, row: &DocumentRow) -> bool {
        match self {
            RowMatcher::Always => true,
            RowMatcher::Ids(ids) => ids.iter().any(|id| *id == row.id),
            RowMatcher::IdPrefix(prefix) => row.id.starts_with(prefix.as_str()),
            RowMatcher::AwaitsReprojection => row.awaits_reprojection,
        }
    }
}

/// Transforms a document payload.
pub type DocumentChangeFn = dyn Fn(Value) -> Result<Value, String> + Send + Sync;

/// A document-level migration step.
///
/// A row is a candidate when its version is below the migration version, its
/// concrete type is assignable to the type filter, and every matcher accepts
/// it. Commands built with [`reproject`](Self::reproject) or
/// [`awaiting_reprojection`](Self::awaiting_reprojection) ignore version and
/// type.
#[derive(Clone)]
pub struct RowMigrationCommand {
    type_filter: Option<String>,
    matchers: Vec<RowMatcher>,
    change: Option<Arc<DocumentChangeFn>>,
    version_gated: bool,
}

impl RowMigrationCommand {
    /// A command over every document type in a table.
    pub fn all_types() -> Self {
        Self {
            type_filter: None,
            matchers: Vec::new(),
            change: None,
            version_gated: true,
        }
    }

    /// A command over one document type and its descendants.
    pub fn for_type(type_name: impl Into<String>) -> Self {
        Self {
            type_filter: Some(type_name.into()),
            ..Self::all_types()
        }
    }

    /// The implicit command that flags every row of a table for reprojection.
    pub fn reproject() -> Self {
        Self {
            matchers: vec![RowMatcher::Always],
            version_gated: false,
            ..Self::all_types()
        }
    }

    /// Selects rows already flagged for migration or reprojection.
    pub fn awaiting_reprojection() -> Self {
        Self {
            matchers: vec![RowMatcher::AwaitsReprojection],
            version_gated: false,
            ..Self::all_types()
        }
    }

    /// Add a matcher (AND-combined with the others).
    pub fn with_matcher(mut self, matcher: RowMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Set the payload transform.
    pub fn with_change(
        mut self,
        change: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.change = Some(Arc::new(change));
        self
    }

    /// The type filter, if any.
    pub fn type_filter(&self) -> Option<&str> {
        self.type_filter.as_deref()
    }

    /// The matchers.
    pub fn matchers(&self) -> &[RowMatcher] {
        &self.matchers
    }

    /// Whether the command transforms the payload.
    pub fn has_change(&self) -> bool {
        self.change.is_some()
    }

    /// Whether the command can select rows of `table`.
    pub fn applies_to_table(&self, registry: &DocumentRegistry, table: &str) -> bool {
        match &self.type_filter {
            None => true,
            Some(target) => !registry.assignable_discriminators(target, table).is_empty(),
        }
    }

    /// SQL predicate selecting candidate rows of `table` for a migration at
    /// `version`.
    pub fn to_sql(&self, version: i64, registry: &DocumentRegistry, table: &str) -> SqlFragment {
        let mut parts = Vec::new();

        if self.version_gated {
            parts.push(SqlFragment::new(
                format!("{} < ?", quote_ident(columns::VERSION)),
                vec![SqlValue::Integer(version)],
            ));

            if let Some(target) = &self.type_filter {
                let discriminators = registry.assignable_discriminators(target, table);
                if discriminators.is_empty() {
                    return SqlFragment::never();
                }
                let placeholders = vec!["?"; discriminators.len()].join(", ");
                parts.push(SqlFragment::new(
                    format!("{} IN ({})", quote_ident(columns::DISCRIMINATOR), placeholders),
                    discriminators.into_iter().map(SqlValue::from).collect(),
                ));
            }
        }

        parts.extend(self.matchers.iter().map(RowMatcher::to_sql));
        SqlFragment::and_all(parts)
    }

    /// In-memory form of [`to_sql`](Self::to_sql).
    pub fn matches(
        &self,
        version: i64,
        registry: &DocumentRegistry,
        table: &str,
        row: &DocumentRow,
    ) -> bool {
        if self.version_gated {
            if row.version >= version {
                return false;
            }

            if let Some(target) = &self.type_filter {
                let accepted = registry
                    .resolve(table, &row.discriminator)
                    .found()
                    .map(|design| registry.is_assignable(&design.type_name, target))
                    .unwrap_or(false);
                if !accepted {
                    return false;
                }
            }
        }

        self.matchers.iter().all(|m| m.matches(row))
    }

    /// Apply the payload transform to a serialized document.
    ///
    /// Commands without a transform return the payload unchanged. Errors are
    /// returned as the reason reported by the transform or serializer.
    pub fn execute(&self, serializer: &dyn Serializer, payload: &str) -> Result<String, String> {
        let change = match &self.change {
            Some(change) => change,
            None => return Ok(payload.to_string()),
        };

        let document = serializer.from_text(payload).map_err(|e| e.to_string())?;
        let changed = change(document)?;
        serializer.to_text(&changed).map_err(|e| e.to_string())
    }
}

impl fmt::Debug for RowMigrationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowMigrationCommand")
            .field("type_filter", &self.type_filter)
            .field("matchers", &self.matchers)
            .field("has_change", &self.change.is_some())
            .field("version_gated", &self.version_gated)
            .finish()
    }
}
