use anyhow::{bail, Result};

type ValueProvider<T> = Box<dyn Fn(&T) -> String + Send + Sync>;

struct Column<T> {
    name: String,
    provider: ValueProvider<T>,
    /// lower case, `None` when cleared
    filter: Option<String>,
}

impl<T> Column<T> {
    fn matches(&self, row: &T) -> bool {
        match &self.filter {
            Some(f) => (self.provider)(row).to_lowercase().contains(f.as_str()),
            None => true,
        }
    }
}

/// Per-column substring filters over a list of rows. A row is visible when
/// it matches every column that has a filter set.
pub struct FilterSet<T> {
    columns: Vec<Column<T>>,
}

impl<T> Default for FilterSet<T> {
    fn default() -> Self {
        Self { columns: vec![] }
    }
}

impl<T> FilterSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column<F>(mut self, name: &str, provider: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.add_column(name, provider);
        self
    }

    pub fn add_column<F>(&mut self, name: &str, provider: F)
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.columns.push(Column {
            name: name.to_string(),
            provider: Box::new(provider),
            filter: None,
        });
    }

    /// Case-insensitive; an empty value clears the column's filter
    pub fn set_filter(&mut self, column: &str, value: &str) -> Result<()> {
        let Some(col) = self
            .columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(column))
        else {
            bail!("unknown column: {}", column);
        };
        col.filter = if value.is_empty() {
            None
        } else {
            Some(value.to_lowercase())
        };
        Ok(())
    }

    pub fn matches(&self, row: &T) -> bool {
        self.columns.iter().all(|c| c.matches(row))
    }

    pub fn apply<'a>(&self, rows: &'a [T]) -> Vec<&'a T> {
        rows.iter().filter(|r| self.matches(r)).collect()
    }
}
