//! Run configuration, read from a TOML file.
//!
//! ```toml
//! covariates = "labels.tsv"
//! engines = ["mfa", "joint_nmf", "mixed_likelihood"]
//!
//! [[blocks]]
//! name = "expression"
//! path = "expression.tsv"
//! noise_model = "continuous"
//! l1 = 0.1
//!
//! [nmf]
//! rank = 2
//! restarts = 4
//!
//! [evaluation]
//! positive_class = "A"
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use crate::align::SampleAxisPolicy;
use crate::evaluate::{EmbeddingEvaluator, GridSearch};
use crate::latent::LatentModelConfig;
use crate::mfa::MfaConfig;
use crate::nmf::NmfConfig;
use crate::normalize::{BlockNormalizer, SignPolicy};
use crate::types::{EngineKind, NoiseModel, OmicsError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML run file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize run file to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The run file must declare at least one [[blocks]] entry.")]
    NoBlocks,
    #[error("The run file must enable at least one engine.")]
    NoEngines,
    #[error("Block name '{0}' is declared more than once.")]
    DuplicateBlock(String),
    #[error("Block '{block}': {source}")]
    InvalidNoiseModel {
        block: String,
        #[source]
        source: OmicsError,
    },
    #[error("Evaluation dimensions {0:?} must name two different columns.")]
    InvalidDimensions([usize; 2]),
}

/// One `[[blocks]]` entry: where a block lives and how to model it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub name: String,
    pub path: PathBuf,
    /// `continuous`, `binary` or `categorical` (aliases `gaussian`, `bernoulli`, `multinomial`).
    pub noise_model: String,
    /// Overrides `[latent.blocks.<name>].l1` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l1: Option<f64>,
    /// Overrides `[latent.blocks.<name>].weight` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl BlockSpec {
    pub fn noise_model(&self) -> Result<NoiseModel, ConfigError> {
        self.noise_model
            .parse()
            .map_err(|source| ConfigError::InvalidNoiseModel {
                block: self.name.clone(),
                source,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationSection {
    pub sign_policy: SignPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSection {
    /// Class scored one-vs-rest; every class is scored when absent.
    pub positive_class: Option<String>,
    /// Embedding columns forming the evaluated plane.
    pub dims: [usize; 2],
    pub angles: usize,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        Self {
            positive_class: None,
            dims: [0, 1],
            angles: GridSearch::default().angles,
        }
    }
}

fn default_engines() -> Vec<EngineKind> {
    vec![EngineKind::Mfa, EngineKind::JointNmf, EngineKind::MixedLikelihood]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub covariates: PathBuf,
    #[serde(default = "default_engines")]
    pub engines: Vec<EngineKind>,
    #[serde(default)]
    pub alignment: SampleAxisPolicy,
    pub blocks: Vec<BlockSpec>,
    #[serde(default)]
    pub normalization: NormalizationSection,
    #[serde(default)]
    pub mfa: MfaConfig,
    #[serde(default)]
    pub nmf: NmfConfig,
    #[serde(default)]
    pub latent: LatentModelConfig,
    #[serde(default)]
    pub evaluation: EvaluationSection,
}

impl RunConfig {
    /// Parses and validates a run file, resolving relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        log::info!(
            "Loaded run file '{}' ({} blocks, engines {:?})",
            path.display(),
            config.blocks.len(),
            config.engines
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let text = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path).map_err(io_error)?);
        file.write_all(text.as_bytes()).map_err(io_error)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocks.is_empty() {
            return Err(ConfigError::NoBlocks);
        }
        if self.engines.is_empty() {
            return Err(ConfigError::NoEngines);
        }
        let mut names = HashSet::with_capacity(self.blocks.len());
        for block in &self.blocks {
            if !names.insert(block.name.as_str()) {
                return Err(ConfigError::DuplicateBlock(block.name.clone()));
            }
            block.noise_model()?;
        }
        if self.evaluation.dims[0] == self.evaluation.dims[1] {
            return Err(ConfigError::InvalidDimensions(self.evaluation.dims));
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &PathBuf| {
            if p.is_relative() {
                base.join(p)
            } else {
                p.clone()
            }
        };
        self.covariates = resolve(&self.covariates);
        for block in &mut self.blocks {
            block.path = resolve(&block.path);
        }
    }

    /// The `[latent]` section with the `l1` and `weight` given on `[[blocks]]`
    /// entries taking precedence. Unset fields keep the `[latent.blocks]` value.
    pub fn latent_config(&self) -> LatentModelConfig {
        let mut latent = self.latent.clone();
        for block in &self.blocks {
            if block.l1.is_none() && block.weight.is_none() {
                continue;
            }
            let settings = latent.blocks.entry(block.name.clone()).or_default();
            if let Some(l1) = block.l1 {
                settings.l1 = l1;
            }
            if let Some(weight) = block.weight {
                settings.weight = weight;
            }
        }
        latent
    }

    /// This configuration with `[latent]` replaced by [`Self::latent_config`], so a
    /// saved copy records the settings a run actually used.
    pub fn effective(&self) -> RunConfig {
        RunConfig {
            latent: self.latent_config(),
            ..self.clone()
        }
    }

    pub fn normalizer(&self) -> BlockNormalizer {
        BlockNormalizer::new(self.normalization.sign_policy)
    }

    pub fn evaluator(&self) -> EmbeddingEvaluator {
        EmbeddingEvaluator::new(GridSearch {
            angles: self.evaluation.angles,
        })
    }

    pub fn evaluation_dims(&self) -> (usize, usize) {
        (self.evaluation.dims[0], self.evaluation.dims[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::LatentInit;
    use std::fs;
    use tempfile::tempdir;

    const FULL: &str = r#"
covariates = "labels.tsv"
engines = ["mfa", "mixed_likelihood"]
alignment = "intersect"

[[blocks]]
name = "expression"
path = "expr.tsv"
noise_model = "gaussian"
l1 = 0.25

[[blocks]]
name = "mutation"
path = "/data/mut.tsv"
noise_model = "binary"
weight = 2.0

[normalization]
sign_policy = "split"

[nmf]
rank = 3
restarts = 4

[latent]
components = 3
init = { kind = "random", seed = 9 }

[latent.blocks.mutation]
noise_model = "categorical"

[evaluation]
positive_class = "Basal"
dims = [1, 2]
"#;

    #[test]
    fn parses_every_section() {
        let config = RunConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.engines, [EngineKind::Mfa, EngineKind::MixedLikelihood]);
        assert_eq!(config.alignment, SampleAxisPolicy::Intersect);
        assert_eq!(config.blocks[0].noise_model().unwrap(), NoiseModel::Continuous);
        assert_eq!(config.blocks[1].weight, Some(2.0));
        assert_eq!(config.normalization.sign_policy, SignPolicy::Split);
        assert_eq!(config.nmf.rank, 3);
        assert_eq!(config.nmf.max_iterations, NmfConfig::default().max_iterations);
        assert_eq!(config.latent.init, LatentInit::Random { seed: 9 });
        assert_eq!(config.evaluation_dims(), (1, 2));
        assert_eq!(config.evaluation.angles, 360);
    }

    #[test]
    fn minimal_file_takes_defaults() {
        let config = RunConfig::from_toml_str(
            "covariates = \"c.tsv\"\n[[blocks]]\nname = \"e\"\npath = \"e.tsv\"\nnoise_model = \"continuous\"\n",
        )
        .unwrap();
        assert_eq!(config.engines.len(), 3);
        assert_eq!(config.alignment, SampleAxisPolicy::Strict);
        assert_eq!(config.mfa, MfaConfig::default());
        assert_eq!(config.blocks[0].weight, None);
        assert_eq!(config.evaluation.positive_class, None);
    }

    #[test]
    fn block_settings_flow_into_latent_config() {
        let latent = RunConfig::from_toml_str(FULL).unwrap().latent_config();
        let mutation = &latent.blocks["mutation"];
        assert_eq!(mutation.weight, 2.0);
        assert_eq!(mutation.noise_model.as_deref(), Some("categorical"));
        assert_eq!(latent.blocks["expression"].l1, 0.25);
    }

    #[test]
    fn latent_section_settings_survive_blocks_without_overrides() {
        let text = "covariates = \"c.tsv\"\n\
            [[blocks]]\nname = \"expression\"\npath = \"e.tsv\"\nnoise_model = \"continuous\"\n\
            [[blocks]]\nname = \"mutation\"\npath = \"m.tsv\"\nnoise_model = \"binary\"\nl1 = 0.5\n\
            [latent.blocks.expression]\nl1 = 0.3\nweight = 2.0\n\
            [latent.blocks.mutation]\nl1 = 0.1\nweight = 3.0\n";
        let config = RunConfig::from_toml_str(text).unwrap();
        let latent = config.latent_config();

        let expression = &latent.blocks["expression"];
        assert_eq!((expression.l1, expression.weight), (0.3, 2.0));
        let mutation = &latent.blocks["mutation"];
        assert_eq!((mutation.l1, mutation.weight), (0.5, 3.0));

        let effective = config.effective();
        assert_eq!(effective.latent, latent);
        let reparsed = RunConfig::from_toml_str(&effective.to_toml_string().unwrap()).unwrap();
        assert_eq!(reparsed.latent_config(), latent);
    }

    #[test]
    fn unknown_noise_model_is_rejected() {
        let err = RunConfig::from_toml_str(
            "covariates = \"c.tsv\"\n[[blocks]]\nname = \"cnv\"\npath = \"c.tsv\"\nnoise_model = \"poisson\"\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidNoiseModel { ref block, source: OmicsError::InvalidNoiseModel(_) } if block == "cnv"
        ));
    }

    #[test]
    fn missing_blocks_and_duplicates_are_rejected() {
        assert!(matches!(
            RunConfig::from_toml_str("covariates = \"c.tsv\"\nblocks = []\n"),
            Err(ConfigError::NoBlocks)
        ));
        let twice = "covariates = \"c.tsv\"\n[[blocks]]\nname = \"e\"\npath = \"a\"\nnoise_model = \"binary\"\n[[blocks]]\nname = \"e\"\npath = \"b\"\nnoise_model = \"binary\"\n";
        assert!(matches!(
            RunConfig::from_toml_str(twice),
            Err(ConfigError::DuplicateBlock(name)) if name == "e"
        ));
    }

    #[test]
    fn load_resolves_relative_paths_and_save_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, FULL).unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.covariates, dir.path().join("labels.tsv"));
        assert_eq!(config.blocks[0].path, dir.path().join("expr.tsv"));
        assert_eq!(config.blocks[1].path, PathBuf::from("/data/mut.tsv"));

        let copy = dir.path().join("copy.toml");
        config.save(&copy).unwrap();
        assert_eq!(RunConfig::load(&copy).unwrap(), config);
    }
}
