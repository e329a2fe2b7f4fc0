//! Test registries
//!
//! The registry is the one place test files are declared. The host loads
//! every file to plan the run; each worker loads the file of the group it was
//! handed and re-derives the same suite.

use indexmap::IndexMap;
use std::sync::Arc;

use super::suite::Suite;
use crate::config::FullConfig;
use crate::error::CoreError;

pub trait TestRegistry: Send + Sync {
    /// Resolved run configuration, including option values for projects.
    fn config(&self) -> FullConfig;

    /// Test files, in run order.
    fn files(&self) -> Vec<String>;

    /// Build the suite declared by `file`. Declaration problems are recorded
    /// on the suite (see [`Suite::load_errors`]).
    fn load_file(&self, file: &str) -> Result<Suite, CoreError>;
}

type FileLoader = Arc<dyn Fn(&mut Suite) + Send + Sync>;

/// Registry backed by closures that declare each file.
#[derive(Clone)]
pub struct StaticRegistry {
    config: FullConfig,
    files: IndexMap<String, FileLoader>,
}

impl StaticRegistry {
    pub fn new(config: FullConfig) -> Self {
        Self {
            config,
            files: IndexMap::new(),
        }
    }

    /// Declare a file. `declare` runs every time the file is loaded.
    pub fn file(
        mut self,
        name: impl Into<String>,
        declare: impl Fn(&mut Suite) + Send + Sync + 'static,
    ) -> Self {
        self.files.insert(name.into(), Arc::new(declare));
        self
    }

    pub fn with_config(mut self, config: FullConfig) -> Self {
        self.config = config;
        self
    }
}

impl TestRegistry for StaticRegistry {
    fn config(&self) -> FullConfig {
        self.config.clone()
    }

    fn files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn load_file(&self, file: &str) -> Result<Suite, CoreError> {
        let declare = self.files.get(file).ok_or_else(|| CoreError::FileLoad {
            file: file.to_string(),
            message: "file is not registered".to_string(),
        })?;
        let mut suite = Suite::file(file);
        declare(&mut suite);
        Ok(suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_file_redeclares() {
        let registry = StaticRegistry::new(FullConfig::default()).file("a.spec", |s| {
            s.test("one", &[], |_args, _info| async { Ok(()) });
        });
        assert_eq!(registry.files(), vec!["a.spec".to_string()]);
        let first = registry.load_file("a.spec").unwrap();
        let second = registry.load_file("a.spec").unwrap();
        assert_eq!(first.all_tests()[0].location, second.all_tests()[0].location);
        assert!(matches!(
            registry.load_file("b.spec"),
            Err(CoreError::FileLoad { .. })
        ));
    }
}
