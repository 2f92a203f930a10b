#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod align;
pub mod config;
pub mod convergence;
pub mod evaluate;
pub mod io;
pub mod latent;
pub mod likelihood;
pub mod mfa;
pub mod nmf;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod synthetic;
pub mod types;

pub use align::{AlignedCohort, AlignmentError, MatrixAligner, SampleAxisPolicy};
pub use convergence::{ConvergenceReport, ConvergenceState};
pub use config::{ConfigError, RunConfig};
pub use evaluate::{EmbeddingEvaluator, EvaluationError, GridSearch, LinearSeparator, SeparatorEvaluation};
pub use latent::{BlockSettings, LatentInit, LatentModelConfig, LatentModelError, MixedLikelihoodLatentModel};
pub use mfa::{MfaConfig, MfaEngine, MfaError};
pub use nmf::{JointNmfEngine, NmfConfig, NmfError};
pub use normalize::{BlockNormalizer, NormalizationError, SignPolicy};
pub use pipeline::{Pipeline, PipelineError, PipelineOutcome};
pub use types::{
    CovariateTable, Embedding, EngineKind, LoadingSet, NoiseModel, OmicBlock, OmicBlockSet,
    OmicMatrix, OmicsError, Provenance,
};
