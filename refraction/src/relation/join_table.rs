use serde_json::Value;

use crate::config::ColumnNaming;
use crate::key::CompositeKey;
use crate::Record;

/// The auxiliary table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub(crate) table: String,
    pub(crate) owner_columns: Vec<String>,
    pub(crate) related_columns: Vec<String>,
    pub(crate) extra_columns: Vec<String>,
}

impl JoinTable {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn owner_columns(&self) -> &[String] {
        &self.owner_columns
    }

    pub fn related_columns(&self) -> &[String] {
        &self.related_columns
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    pub(crate) fn extra_props(&self, naming: ColumnNaming) -> Vec<String> {
        self.extra_columns
            .iter()
            .map(|col| naming.to_property(col))
            .collect()
    }

    /// One column-keyed join row per related record: owner columns from
    /// `owner_key`, related columns from `related_props` of each record, and
    /// every extra property the record actually carries.
    pub fn create_join_rows(
        &self,
        owner_key: &CompositeKey,
        related: &[Record],
        related_props: &[String],
        naming: ColumnNaming,
    ) -> Vec<Record> {
        let extra_props = self.extra_props(naming);
        related
            .iter()
            .map(|record| {
                let mut row = Record::new();
                for (col, value) in self.owner_columns.iter().zip(owner_key.values()) {
                    row.insert(col.clone(), value.clone());
                }
                for (col, prop) in self.related_columns.iter().zip(related_props) {
                    row.insert(
                        col.clone(),
                        record.get(prop).cloned().unwrap_or(Value::Null),
                    );
                }
                for (col, prop) in self.extra_columns.iter().zip(&extra_props) {
                    if let Some(value) = record.get(prop) {
                        row.insert(col.clone(), value.clone());
                    }
                }
                row
            })
            .collect()
    }

    /// `record` without the join-table extra properties, i.e. the form that
    /// is written to the related table.
    pub fn omit_extras(&self, record: &Record, naming: ColumnNaming) -> Record {
        let extra_props = self.extra_props(naming);
        record
            .iter()
            .filter(|(prop, _)| !extra_props.contains(prop))
            .map(|(prop, value)| (prop.clone(), value.clone()))
            .collect()
    }
}
