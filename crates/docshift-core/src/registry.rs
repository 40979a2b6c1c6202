//! Document designs and discriminator resolution.
//!
//! A [`DocumentRegistry`] maps each table's discriminators to the design of
//! the concrete document type stored under them, and back. Designs may form a
//! hierarchy through their parent type; a type filter accepts the filter type
//! and all of its descendants.

use crate::schema::Column;
use crate::sql::SqlValue;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Extracts a projected column value from a document.
pub type ProjectionFn = dyn Fn(&Value) -> SqlValue + Send + Sync;

/// A column computed from the document payload.
#[derive(Clone)]
pub struct Projection {
    /// The projected column.
    pub column: Column,
    extract: Arc<ProjectionFn>,
}

impl Projection {
    /// Project with a custom extractor.
    pub fn new(
        column: Column,
        extract: impl Fn(&Value) -> SqlValue + Send + Sync + 'static,
    ) -> Self {
        Self {
            column,
            extract: Arc::new(extract),
        }
    }

    /// Project the value at a JSON pointer (e.g. `/address/city`).
    ///
    /// Missing values and objects/arrays project as NULL.
    pub fn pointer(column: Column, pointer: impl Into<String>) -> Self {
        let pointer = pointer.into();
        Self::new(column, move |doc| {
            doc.pointer(&pointer).map(json_to_sql).unwrap_or(SqlValue::Null)
        })
    }

    /// Compute the value for a document.
    pub fn project(&self, document: &Value) -> SqlValue {
        (self.extract)(document)
    }
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("column", &self.column.name)
            .finish_non_exhaustive()
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Bool(*b),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Null,
    }
}

/// How one document type is stored.
#[derive(Debug, Clone)]
pub struct DocumentDesign {
    /// Type name (unique across the configuration).
    pub type_name: String,
    /// Table the documents are stored in.
    pub table: String,
    /// Type tag written to the discriminator column.
    pub discriminator: String,
    /// Base type, for polymorphic tables.
    pub parent: Option<String>,
    /// Projected columns.
    pub projections: Vec<Projection>,
}

impl DocumentDesign {
    /// Create a design. The discriminator defaults to the type name.
    pub fn new(type_name: impl Into<String>, table: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            discriminator: type_name.clone(),
            type_name,
            table: table.into(),
            parent: None,
            projections: Vec::new(),
        }
    }

    /// Create a design named after a Rust type (last path segment).
    pub fn of<T: ?Sized>(table: impl Into<String>) -> Self {
        Self::new(short_type_name::<T>(), table)
    }

    /// Set the discriminator.
    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = discriminator.into();
        self
    }

    /// Set the parent type.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Add a projected column.
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projections.push(projection);
        self
    }

    /// Compute all projected columns for a document.
    pub fn project(&self, document: &Value) -> Vec<(String, SqlValue)> {
        self.projections
            .iter()
            .map(|p| (p.column.name.clone(), p.project(document)))
            .collect()
    }
}

/// Type name of `T` without its module path.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Result of resolving a discriminator.
#[derive(Debug, Clone, Copy)]
pub enum Resolution<'a> {
    /// The discriminator belongs to this design.
    Found(&'a DocumentDesign),
    /// No design in the table uses the discriminator.
    NotFound,
}

impl<'a> Resolution<'a> {
    /// Convert into an option.
    pub fn found(self) -> Option<&'a DocumentDesign> {
        match self {
            Resolution::Found(design) => Some(design),
            Resolution::NotFound => None,
        }
    }
}

/// Bidirectional map between discriminators and document designs.
#[derive(Debug, Clone, Default)]
pub struct DocumentRegistry {
    designs: Vec<DocumentDesign>,
    by_type: HashMap<String, usize>,
    by_discriminator: HashMap<(String, String), usize>,
}

impl DocumentRegistry {
    /// Build a registry. Callers validate uniqueness beforehand.
    pub(crate) fn new(designs: Vec<DocumentDesign>) -> Self {
        let mut by_type = HashMap::new();
        let mut by_discriminator = HashMap::new();
        for (idx, design) in designs.iter().enumerate() {
            by_type.insert(design.type_name.clone(), idx);
            by_discriminator.insert(
                (design.table.to_ascii_lowercase(), design.discriminator.clone()),
                idx,
            );
        }

        Self {
            designs,
            by_type,
            by_discriminator,
        }
    }

    /// Resolve the design for a discriminator found in `table`.
    pub fn resolve(&self, table: &str, discriminator: &str) -> Resolution<'_> {
        match self
            .by_discriminator
            .get(&(table.to_ascii_lowercase(), discriminator.to_string()))
        {
            Some(&idx) => Resolution::Found(&self.designs[idx]),
            None => Resolution::NotFound,
        }
    }

    /// Get the design of a type.
    pub fn design(&self, type_name: &str) -> Option<&DocumentDesign> {
        self.by_type.get(type_name).map(|&idx| &self.designs[idx])
    }

    /// Get the discriminator of a type.
    pub fn discriminator_of(&self, type_name: &str) -> Option<&str> {
        self.design(type_name).map(|d| d.discriminator.as_str())
    }

    /// All designs in registration order.
    pub fn designs(&self) -> &[DocumentDesign] {
        &self.designs
    }

    /// Designs stored in a table.
    pub fn designs_in_table<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a DocumentDesign> + 'a {
        self.designs
            .iter()
            .filter(move |d| d.table.eq_ignore_ascii_case(table))
    }

    /// Check whether `type_name` is `target` or descends from it.
    pub fn is_assignable(&self, type_name: &str, target: &str) -> bool {
        let mut current = Some(type_name);
        // Bounded walk; a malformed cycle cannot loop forever.
        for _ in 0..=self.designs.len() {
            match current {
                Some(name) if name == target => return true,
                Some(name) => current = self.design(name).and_then(|d| d.parent.as_deref()),
                None => return false,
            }
        }
        false
    }

    /// Discriminators in `table` whose types are assignable to `target`.
    pub fn assignable_discriminators<'a>(&'a self, target: &str, table: &'a str) -> Vec<&'a str> {
        self.designs_in_table(table)
            .filter(|d| self.is_assignable(&d.type_name, target))
            .map(|d| d.discriminator.as_str())
            .collect()
    }
}
