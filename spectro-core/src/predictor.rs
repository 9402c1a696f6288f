//! # Prediction Backends
//!
//! A predictor turns one processed spectrum into a single value (moisture
//! content on the deployed line). Backends implement [`SpectrumPredictor`]
//! and are selected by [`PredictorKind`] in the configuration; the
//! [`PredictorRegistry`] holds them in configuration order so the rest of
//! the pipeline can address them by index.
//!
//! ## Model discovery
//!
//! Each backend names a default model path relative to a deployment root,
//! `predictor_train/<name>/spectrum_model.json`. [`PredictorRegistry::load_model_auto`]
//! looks for it next to the executable and up to three parent directories
//! above it.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::log_context::LogContext;

const SOURCE: &str = "predictor";

/// Directory levels above the executable searched for a default model.
const MODEL_SEARCH_DEPTH: usize = 3;

pub trait SpectrumPredictor: Send + Sync {
    fn name(&self) -> &str;

    /// Short description of the method, for status displays.
    fn algorithm(&self) -> &str;

    /// Model location relative to a deployment root.
    fn default_model_path(&self) -> PathBuf;

    fn load_model(&mut self, path: &Path) -> anyhow::Result<()>;

    fn predict(&self, spectrum: &[f64]) -> anyhow::Result<f64>;

    fn is_loaded(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictorKind {
    #[default]
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorConfig {
    #[serde(default)]
    pub kind: PredictorKind,
    pub name: String,
    /// Loaded at startup when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
}

impl PredictorConfig {
    fn build(&self) -> Box<dyn SpectrumPredictor> {
        match self.kind {
            PredictorKind::Linear => Box::new(LinearPredictor::new(&self.name)),
        }
    }
}

/// On-disk form of a linear model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub bias: f64,
    pub weights: Vec<f64>,
}

/// `bias + Σ weights[i] * spectrum[i]`.
#[derive(Debug, Clone)]
pub struct LinearPredictor {
    name: String,
    model: Option<LinearModel>,
}

impl LinearPredictor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            model: None,
        }
    }

    pub fn with_model(name: &str, model: LinearModel) -> Self {
        Self {
            name: name.to_string(),
            model: Some(model),
        }
    }
}

impl SpectrumPredictor for LinearPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn algorithm(&self) -> &str {
        "linear regression"
    }

    fn default_model_path(&self) -> PathBuf {
        Path::new("predictor_train")
            .join(&self.name)
            .join("spectrum_model.json")
    }

    fn load_model(&mut self, path: &Path) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading model {}", path.display()))?;
        let model: LinearModel = serde_json::from_str(&text)
            .with_context(|| format!("parsing model {}", path.display()))?;
        if model.weights.is_empty() {
            bail!("model {} has no weights", path.display());
        }
        if model.weights.iter().chain([&model.bias]).any(|w| !w.is_finite()) {
            bail!("model {} has non-finite coefficients", path.display());
        }
        self.model = Some(model);
        Ok(())
    }

    fn predict(&self, spectrum: &[f64]) -> anyhow::Result<f64> {
        let Some(model) = &self.model else {
            bail!("no model loaded for {}", self.name);
        };
        if spectrum.len() != model.weights.len() {
            bail!(
                "spectrum has {} samples, model expects {}",
                spectrum.len(),
                model.weights.len()
            );
        }
        let dot: f64 = model.weights.iter().zip(spectrum).map(|(w, x)| w * x).sum();
        Ok(model.bias + dot)
    }

    fn is_loaded(&self) -> bool {
        self.model.is_some()
    }
}

/// Predictors in configuration order, addressed by index.
pub struct PredictorRegistry {
    predictors: RwLock<Vec<Box<dyn SpectrumPredictor>>>,
    log: LogContext,
}

impl PredictorRegistry {
    pub fn new(log: LogContext) -> Self {
        Self {
            predictors: RwLock::new(Vec::new()),
            log,
        }
    }

    /// Builds every configured predictor and loads the models that name a
    /// path. A model that fails to load is logged and left unloaded.
    pub fn from_config(configs: &[PredictorConfig], log: LogContext) -> Self {
        let registry = Self::new(log);
        for config in configs {
            let index = registry.register(config.build());
            if let Some(path) = &config.model_path {
                if let Err(e) = registry.load_model(index, path) {
                    registry
                        .log
                        .warn(SOURCE, format!("{}: {e:#}", config.name));
                }
            }
        }
        registry
    }

    /// Adds a predictor and returns its index.
    pub fn register(&self, predictor: Box<dyn SpectrumPredictor>) -> usize {
        let mut predictors = self.predictors.write();
        self.log.info(
            SOURCE,
            format!(
                "registered predictor {} ({})",
                predictor.name(),
                predictor.algorithm()
            ),
        );
        predictors.push(predictor);
        predictors.len() - 1
    }

    pub fn len(&self) -> usize {
        self.predictors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.predictors
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn algorithm(&self, index: usize) -> Result<String> {
        let predictors = self.predictors.read();
        let predictor = predictors.get(index).ok_or(Error::PredictorIndex(index))?;
        Ok(predictor.algorithm().to_string())
    }

    pub fn is_loaded(&self, index: usize) -> bool {
        self.predictors
            .read()
            .get(index)
            .is_some_and(|p| p.is_loaded())
    }

    pub fn load_model(&self, index: usize, path: &Path) -> anyhow::Result<()> {
        let mut predictors = self.predictors.write();
        let predictor = predictors
            .get_mut(index)
            .ok_or(Error::PredictorIndex(index))?;
        predictor.load_model(path)?;
        self.log.info(
            SOURCE,
            format!("{} loaded model {}", predictor.name(), path.display()),
        );
        Ok(())
    }

    /// Loads the predictor's default model, searching from the directory
    /// of the running executable.
    pub fn load_model_auto(&self, index: usize) -> anyhow::Result<PathBuf> {
        let exe = std::env::current_exe().context("locating the executable")?;
        let base = exe
            .parent()
            .context("executable has no parent directory")?;
        self.load_model_auto_from(index, base)
    }

    /// Loads the predictor's default model found at `base` or up to three
    /// directories above it. Returns the path that was loaded.
    pub fn load_model_auto_from(&self, index: usize, base: &Path) -> anyhow::Result<PathBuf> {
        let relative = {
            let predictors = self.predictors.read();
            predictors
                .get(index)
                .ok_or(Error::PredictorIndex(index))?
                .default_model_path()
        };
        let candidate = base
            .ancestors()
            .take(MODEL_SEARCH_DEPTH + 1)
            .map(|dir| dir.join(&relative))
            .find(|path| path.is_file());
        let Some(path) = candidate else {
            bail!(
                "no {} found within {MODEL_SEARCH_DEPTH} levels of {}",
                relative.display(),
                base.display()
            );
        };
        self.load_model(index, &path)?;
        Ok(path)
    }

    pub fn predict(&self, index: usize, spectrum: &[f64]) -> Result<f64> {
        let predictors = self.predictors.read();
        let predictor = predictors.get(index).ok_or(Error::PredictorIndex(index))?;
        if !predictor.is_loaded() {
            return Err(Error::ModelNotLoaded(index));
        }
        predictor.predict(spectrum).map_err(Error::Prediction)
    }
}

impl std::fmt::Debug for PredictorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictorRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Normal,
    Abnormal,
    Unmonitored,
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorStatus::Normal => write!(f, "normal"),
            MonitorStatus::Abnormal => write!(f, "abnormal"),
            MonitorStatus::Unmonitored => write!(f, "unmonitored"),
        }
    }
}

/// Flags predictions outside `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitMonitor {
    pub enabled: bool,
    pub lower: f64,
    pub upper: f64,
}

impl Default for LimitMonitor {
    fn default() -> Self {
        Self {
            enabled: false,
            lower: 0.0,
            upper: 100.0,
        }
    }
}

impl LimitMonitor {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self {
            enabled: true,
            lower,
            upper,
        }
    }

    pub fn classify(&self, value: f64) -> MonitorStatus {
        if !self.enabled {
            MonitorStatus::Unmonitored
        } else if (self.lower..=self.upper).contains(&value) {
            MonitorStatus::Normal
        } else {
            MonitorStatus::Abnormal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_model(dir: &Path, name: &str, model: &LinearModel) -> PathBuf {
        let folder = dir.join("predictor_train").join(name);
        std::fs::create_dir_all(&folder).unwrap();
        let path = folder.join("spectrum_model.json");
        std::fs::write(&path, serde_json::to_string(model).unwrap()).unwrap();
        path
    }

    fn registry(names: &[&str]) -> PredictorRegistry {
        let configs: Vec<PredictorConfig> = names
            .iter()
            .map(|name| PredictorConfig {
                kind: PredictorKind::Linear,
                name: name.to_string(),
                model_path: None,
            })
            .collect();
        PredictorRegistry::from_config(&configs, LogContext::in_memory(32))
    }

    #[test]
    fn linear_prediction_is_bias_plus_dot_product() {
        let p = LinearPredictor::with_model(
            "moisture",
            LinearModel {
                bias: 1.0,
                weights: vec![0.5, -1.0, 2.0],
            },
        );
        assert_eq!(p.predict(&[2.0, 1.0, 0.25]).unwrap(), 1.0 + 1.0 - 1.0 + 0.5);
        assert!(p.predict(&[1.0]).is_err());
    }

    #[test]
    fn registry_rejects_unloaded_and_unknown_predictors() {
        let registry = registry(&["a"]);
        assert_eq!(registry.names(), vec!["a"]);
        assert!(!registry.is_loaded(0));
        assert!(matches!(registry.predict(0, &[1.0]), Err(Error::ModelNotLoaded(0))));
        assert!(matches!(registry.predict(3, &[1.0]), Err(Error::PredictorIndex(3))));
        assert!(registry.algorithm(3).is_err());
    }

    #[test]
    fn config_paths_are_loaded_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let model = LinearModel {
            bias: 2.0,
            weights: vec![1.0, 1.0],
        };
        let path = write_model(dir.path(), "wet", &model);
        let configs = vec![
            PredictorConfig {
                kind: PredictorKind::Linear,
                name: "wet".into(),
                model_path: Some(path),
            },
            PredictorConfig {
                kind: PredictorKind::Linear,
                name: "missing".into(),
                model_path: Some(dir.path().join("nope.json")),
            },
        ];
        let log = LogContext::in_memory(32);
        let registry = PredictorRegistry::from_config(&configs, log.clone());
        assert_eq!(registry.predict(0, &[1.0, 2.0]).unwrap(), 5.0);
        assert!(!registry.is_loaded(1));
        assert!(log.entries().iter().any(|e| e.level == log::Level::Warn));
    }

    #[test]
    fn auto_load_searches_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let model = LinearModel {
            bias: 0.0,
            weights: vec![3.0],
        };
        let expected = write_model(dir.path(), "deep", &model);
        let base = dir.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&base).unwrap();

        let registry = registry(&["deep"]);
        let loaded = registry.load_model_auto_from(0, &base).unwrap();
        assert_eq!(loaded, expected);
        assert_eq!(registry.predict(0, &[2.0]).unwrap(), 6.0);
    }

    #[test]
    fn auto_load_gives_up_beyond_three_levels() {
        let dir = tempfile::tempdir().unwrap();
        write_model(
            dir.path(),
            "far",
            &LinearModel {
                bias: 0.0,
                weights: vec![1.0],
            },
        );
        let base = dir.path().join("a").join("b").join("c").join("d");
        std::fs::create_dir_all(&base).unwrap();

        let registry = registry(&["far"]);
        assert!(registry.load_model_auto_from(0, &base).is_err());
        assert!(!registry.is_loaded(0));
    }

    #[test]
    fn empty_model_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(
            dir.path(),
            "empty",
            &LinearModel {
                bias: 1.0,
                weights: vec![],
            },
        );
        let mut p = LinearPredictor::new("empty");
        assert!(p.load_model(&path).is_err());
        assert!(!p.is_loaded());
    }

    #[test]
    fn limit_monitor_classification() {
        let monitor = LimitMonitor::new(10.0, 20.0);
        assert_eq!(monitor.classify(15.0), MonitorStatus::Normal);
        assert_eq!(monitor.classify(20.0), MonitorStatus::Normal);
        assert_eq!(monitor.classify(20.5), MonitorStatus::Abnormal);
        assert_eq!(LimitMonitor::default().classify(500.0), MonitorStatus::Unmonitored);
    }
}
