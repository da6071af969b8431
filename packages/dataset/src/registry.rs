//! Named dataset definitions.
//!
//! The definitions shipped in `packages/dataset/datasets/` are compiled in
//! with [`include_str!`]. Operators can add or override datasets at runtime
//! by pointing [`Registry::load_dir`] at a directory of extra definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use grid_ingest_dataset_models::{DatasetSpec, FieldType};

use crate::RegistryError;

/// TOML configs embedded at compile time.
const DATASET_TOMLS: &[(&str, &str)] = &[
    // ── Balancing mechanism ──────────────────────────────────────────
    ("bod", include_str!("../datasets/bod.toml")),
    ("boalf", include_str!("../datasets/boalf.toml")),
    ("mils", include_str!("../datasets/mils.toml")),
    // ── Generation and system ────────────────────────────────────────
    ("fuelinst", include_str!("../datasets/fuelinst.toml")),
    ("freq", include_str!("../datasets/freq.toml")),
    ("temp", include_str!("../datasets/temp.toml")),
    // ── Market ───────────────────────────────────────────────────────
    ("mid", include_str!("../datasets/mid.toml")),
];

/// Total number of embedded datasets (used in tests).
#[cfg(test)]
const EXPECTED_DATASET_COUNT: usize = 7;

/// Parses one dataset definition.
///
/// # Errors
///
/// Returns the TOML parser message if the definition is malformed.
pub fn parse_dataset_toml(toml_str: &str) -> Result<DatasetSpec, String> {
    toml::from_str(toml_str).map_err(|e| e.to_string())
}

/// Returns all embedded dataset definitions.
///
/// # Panics
///
/// Panics if any embedded TOML config is malformed (covered by tests since
/// the configs are embedded).
#[must_use]
pub fn builtin_datasets() -> Vec<DatasetSpec> {
    DATASET_TOMLS
        .iter()
        .map(|(name, toml)| {
            parse_dataset_toml(toml).unwrap_or_else(|e| panic!("Failed to parse {name}.toml: {e}"))
        })
        .collect()
}

/// Validated set of dataset definitions, keyed by upper-cased name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    datasets: BTreeMap<String, DatasetSpec>,
}

impl Registry {
    /// Builds a registry from the embedded definitions.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if an embedded definition is inconsistent.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_specs(builtin_datasets())
    }

    /// Builds a registry from explicit definitions.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if two definitions share a name
    /// and [`RegistryError::Invalid`] if any definition is inconsistent.
    pub fn from_specs(specs: impl IntoIterator<Item = DatasetSpec>) -> Result<Self, RegistryError> {
        let mut datasets = BTreeMap::new();
        for spec in specs {
            validate(&spec)?;
            let key = spec.name.to_ascii_uppercase();
            if datasets.contains_key(&key) {
                return Err(RegistryError::Duplicate { dataset: spec.name });
            }
            datasets.insert(key, spec);
        }
        Ok(Self { datasets })
    }

    /// Loads every `*.toml` file in `dir`, replacing registered datasets
    /// that share a name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the directory cannot be read, a file
    /// fails to parse or validate, or two files define the same dataset.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, RegistryError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut seen = BTreeSet::new();
        for path in &paths {
            let contents = std::fs::read_to_string(path)?;
            let spec = parse_dataset_toml(&contents).map_err(|message| RegistryError::Parse {
                name: path.display().to_string(),
                message,
            })?;
            validate(&spec)?;

            let key = spec.name.to_ascii_uppercase();
            if !seen.insert(key.clone()) {
                return Err(RegistryError::Duplicate { dataset: spec.name });
            }
            if self.datasets.contains_key(&key) {
                log::info!(
                    "Dataset {} overridden by {}",
                    spec.name,
                    path.display()
                );
            } else {
                log::debug!("Loaded dataset {} from {}", spec.name, path.display());
            }
            self.datasets.insert(key, spec);
        }

        Ok(paths.len())
    }

    /// Looks up a dataset by name, ignoring case.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DatasetSpec> {
        self.datasets.get(&name.to_ascii_uppercase())
    }

    /// All registered datasets, sorted by name.
    pub fn all(&self) -> impl Iterator<Item = &DatasetSpec> {
        self.datasets.values()
    }

    /// Number of registered datasets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Resolves the datasets a run should process.
    ///
    /// With explicit `names`, returns exactly those datasets (offline ones
    /// included, since the operator asked for them). Otherwise returns every
    /// dataset, skipping those marked `likely_offline` unless
    /// `include_offline` is set.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unknown`] for the first name that is not
    /// registered.
    pub fn select(
        &self,
        names: &[String],
        include_offline: bool,
    ) -> Result<Vec<DatasetSpec>, RegistryError> {
        if names.is_empty() {
            return Ok(self
                .all()
                .filter(|spec| include_offline || !spec.likely_offline)
                .cloned()
                .collect());
        }

        let mut selected: Vec<DatasetSpec> = Vec::with_capacity(names.len());
        for name in names {
            let spec = self.get(name).ok_or_else(|| RegistryError::Unknown {
                dataset: name.clone(),
                available: self
                    .all()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;
            if !selected.iter().any(|s| s.name == spec.name) {
                selected.push(spec.clone());
            }
        }
        Ok(selected)
    }
}

/// Checks a definition for internal consistency.
///
/// # Errors
///
/// Returns [`RegistryError::Invalid`] describing the first problem found.
pub fn validate(spec: &DatasetSpec) -> Result<(), RegistryError> {
    let invalid = |message: String| RegistryError::Invalid {
        dataset: spec.name.clone(),
        message,
    };

    if spec.name.trim().is_empty() {
        return Err(invalid("name is empty".to_string()));
    }
    if spec.table.trim().is_empty() {
        return Err(invalid("table is empty".to_string()));
    }
    if !spec
        .table
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(invalid(format!(
            "table {:?} must contain only letters, digits and underscores",
            spec.table
        )));
    }
    if spec.fields.is_empty() {
        return Err(invalid("no fields declared".to_string()));
    }

    let mut names = BTreeSet::new();
    for field in &spec.fields {
        if field.name.starts_with('_') {
            return Err(invalid(format!(
                "field {} collides with reserved metadata columns",
                field.name
            )));
        }
        if !names.insert(field.name.as_str()) {
            return Err(invalid(format!("field {} declared twice", field.name)));
        }
    }

    match spec.field(&spec.partition_field) {
        None => {
            return Err(invalid(format!(
                "partition field {} is not declared",
                spec.partition_field
            )));
        }
        Some(field) => {
            if !matches!(field.field_type, FieldType::Date | FieldType::Timestamp) {
                return Err(invalid(format!(
                    "partition field {} must be a date or timestamp, found {}",
                    field.name, field.field_type
                )));
            }
            if field.nullable {
                return Err(invalid(format!(
                    "partition field {} must not be nullable",
                    field.name
                )));
            }
        }
    }

    for key in &spec.business_key {
        if spec.field(key).is_none() {
            return Err(invalid(format!("business key field {key} is not declared")));
        }
    }

    if let Some(fraction) = spec.max_drop_fraction
        && !(0.0..=1.0).contains(&fraction)
    {
        return Err(invalid(format!(
            "max_drop_fraction {fraction} must be between 0 and 1"
        )));
    }

    Ok(())
}
