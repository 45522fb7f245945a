use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sea_orm::sea_query::SelectStatement;

/// A callable that narrows a SELECT, either registered by name or attached
/// anonymously to an expression node.
pub type FilterFn = Arc<dyn Fn(&mut SelectStatement) + Send + Sync>;

pub fn filter<F>(f: F) -> FilterFn
where
    F: Fn(&mut SelectStatement) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Named filters available to an eager fetch and every query it spawns.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<String, FilterFn>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut SelectStatement) + Send + Sync + 'static,
    {
        self.insert(name, filter(f));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, f: FilterFn) {
        self.filters.insert(name.into(), f);
    }

    pub fn get(&self, name: &str) -> Option<&FilterFn> {
        self.filters.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Later registrations win.
    pub fn extend(&mut self, other: &FilterRegistry) {
        for (name, f) in &other.filters {
            self.filters.insert(name.clone(), f.clone());
        }
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.filters.keys().collect();
        names.sort();
        f.debug_struct("FilterRegistry")
            .field("filters", &names)
            .finish()
    }
}

/// An anonymous filter bound to a dotted relation path such as `pets.owner`.
#[derive(Clone)]
pub struct PathFilter {
    pub path: String,
    pub filter: FilterFn,
}

impl PathFilter {
    pub fn new<F>(path: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut SelectStatement) + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            filter: filter(f),
        }
    }
}

impl fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathFilter").field("path", &self.path).finish()
    }
}
