use crate::config::Config;
use crate::error::Result;
use crate::model::{Detector, YoloModel};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Fixed once the server starts.
#[derive(Clone)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn Detector>>,
}

impl ModelRegistry {
    pub fn load<S: AsRef<str>>(names: &[S], cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        let mut models: HashMap<String, Arc<dyn Detector>> = HashMap::new();
        for name in names {
            let name = name.as_ref();
            if models.contains_key(name) {
                continue;
            }
            let model = YoloModel::load_named(name, cfg)?;
            info!(model = name, "registered model");
            models.insert(name.to_string(), Arc::new(model));
        }
        Ok(Self { models })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Detector>> {
        self.models.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl FromIterator<(String, Arc<dyn Detector>)> for ModelRegistry {
    fn from_iter<I: IntoIterator<Item = (String, Arc<dyn Detector>)>>(iter: I) -> Self {
        Self {
            models: iter.into_iter().collect(),
        }
    }
}
