#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{CommandFactory, Parser, Subcommand};
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use omicfuse::config::{BlockSpec, EvaluationSection, NormalizationSection, RunConfig};
use omicfuse::evaluate::{EmbeddingEvaluator, GridSearch};
use omicfuse::io::{read_covariates, read_embedding, write_covariates, write_matrix};
use omicfuse::normalize::SignPolicy;
use omicfuse::pipeline::Pipeline;
use omicfuse::synthetic::SyntheticCohortBuilder;
use omicfuse::types::EngineKind;

#[derive(Parser)]
#[command(
    name = "omicfuse",
    about = "Joint dimension reduction of multi-omic cohorts",
    long_about = "Fuses continuous, binary and categorical omic blocks measured on the same samples \
                 into shared low-dimensional embeddings (MFA, joint NMF and a mixed-likelihood \
                 latent model) and scores how well each embedding separates known groups."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured engine on the cohort described by a run file
    #[command(about = "Align, normalize, integrate and evaluate a cohort")]
    Run {
        /// Path to the TOML run file
        #[arg(long, value_name = "RUN_TOML")]
        config: PathBuf,

        /// Directory receiving embeddings, loadings and reports
        #[arg(long, value_name = "DIR")]
        out_dir: PathBuf,
    },

    /// Score a saved embedding against known labels
    #[command(about = "Grid-search the best linear separator on two embedding columns")]
    Evaluate {
        /// Embedding TSV written by `run`
        #[arg(value_name = "EMBEDDING")]
        embedding: PathBuf,

        /// Two-column TSV of sample_id and label
        #[arg(long, value_name = "LABELS")]
        labels: PathBuf,

        /// Class scored one-vs-rest; every class is scored when omitted
        #[arg(long)]
        positive_class: Option<String>,

        /// Embedding columns forming the plane, zero-based
        #[arg(long, value_delimiter = ',', default_values_t = [0usize, 1])]
        dims: Vec<usize>,

        /// Number of separator directions tried over the full circle
        #[arg(long, default_value_t = GridSearch::default().angles)]
        angles: usize,
    },

    /// Write a seeded synthetic cohort and a run file for it
    #[command(about = "Generate a synthetic three-block cohort")]
    Simulate {
        #[arg(long, value_name = "DIR")]
        out_dir: PathBuf,

        #[arg(long, default_value_t = 20)]
        samples: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Show version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Run { config, out_dir }) => run(&config, &out_dir),
        Some(Commands::Evaluate {
            embedding,
            labels,
            positive_class,
            dims,
            angles,
        }) => evaluate(&embedding, &labels, positive_class.as_deref(), &dims, angles),
        Some(Commands::Simulate {
            out_dir,
            samples,
            seed,
        }) => simulate(&out_dir, samples, seed),
        Some(Commands::Version) => {
            println!("omicfuse {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

fn run(config_path: &Path, out_dir: &Path) -> Result<(), Box<dyn Error>> {
    let config = RunConfig::load(config_path)?;
    let pipeline = Pipeline::new(config);
    let outcome = pipeline.run()?;
    pipeline.write_outputs(&outcome, out_dir)?;

    for report in &outcome.reports {
        let status = match &report.result.convergence {
            Some(convergence) => format!("{:?} after {} iterations", convergence.state, convergence.iterations),
            None => "closed form".to_string(),
        };
        println!(
            "{:<18} {} dims, {status}",
            report.engine.as_str(),
            report.result.embedding.n_dims()
        );
        for evaluation in &report.evaluations {
            println!(
                "{:<18}   class {:<12} FP {:>3}  FN {:>3}  ({:.1}% misclassified)",
                "",
                evaluation.positive_class,
                evaluation.false_positives,
                evaluation.false_negatives,
                100.0 * evaluation.misclassification_rate()
            );
        }
    }
    println!("Results written to {}", out_dir.display());
    Ok(())
}

fn evaluate(
    embedding_path: &Path,
    labels_path: &Path,
    positive_class: Option<&str>,
    dims: &[usize],
    angles: usize,
) -> Result<(), Box<dyn Error>> {
    let table = read_embedding(embedding_path)?;
    let covariates = read_covariates(labels_path)?;

    let by_sample: HashMap<&str, &str> = covariates
        .entries()
        .iter()
        .map(|(sample, label)| (sample.as_str(), label.as_str()))
        .collect();
    let labels = table
        .sample_ids
        .iter()
        .map(|sample| {
            by_sample
                .get(sample.as_str())
                .map(|label| label.to_string())
                .ok_or_else(|| format!("sample '{sample}' has no label in '{}'", labels_path.display()))
        })
        .collect::<Result<Vec<String>, String>>()?;

    let dims = match dims {
        [x, y] => (*x, *y),
        _ => return Err(format!("--dims takes exactly two columns, got {dims:?}").into()),
    };
    let evaluator = EmbeddingEvaluator::new(GridSearch { angles });
    let evaluations = match positive_class {
        Some(class) => vec![evaluator.search(table.scores.view(), &labels, class, dims)?],
        None => evaluator.evaluate_all_classes(table.scores.view(), &labels, dims)?,
    };

    println!("class\tfalse_positives\tfalse_negatives\tnormal_x\tnormal_y\toffset");
    for evaluation in &evaluations {
        let separator = &evaluation.separator;
        println!(
            "{}\t{}\t{}\t{:.6}\t{:.6}\t{:.6}",
            evaluation.positive_class,
            evaluation.false_positives,
            evaluation.false_negatives,
            separator.normal[0],
            separator.normal[1],
            separator.offset
        );
    }
    Ok(())
}

fn simulate(out_dir: &Path, samples: usize, seed: u64) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(out_dir)?;
    let cohort = SyntheticCohortBuilder::new(samples).seed(seed).build()?;

    let mut blocks = Vec::with_capacity(cohort.blocks.len());
    for block in &cohort.blocks {
        let file_name = format!("{}.tsv", block.name());
        write_matrix(&out_dir.join(&file_name), block.matrix())?;
        blocks.push(BlockSpec {
            name: block.name().to_string(),
            path: PathBuf::from(file_name),
            noise_model: block.noise_model().to_string(),
            l1: None,
            weight: None,
        });
    }
    write_covariates(&out_dir.join("labels.tsv"), &cohort.covariates)?;

    // Expression values go negative, so NMF needs the split policy.
    let config = RunConfig {
        covariates: PathBuf::from("labels.tsv"),
        engines: vec![EngineKind::Mfa, EngineKind::JointNmf, EngineKind::MixedLikelihood],
        alignment: Default::default(),
        blocks,
        normalization: NormalizationSection {
            sign_policy: SignPolicy::Split,
        },
        mfa: Default::default(),
        nmf: Default::default(),
        latent: Default::default(),
        evaluation: EvaluationSection {
            positive_class: Some("A".to_string()),
            ..Default::default()
        },
    };
    config.validate()?;
    let run_file = out_dir.join("run.toml");
    config.save(&run_file)?;

    println!(
        "Wrote {samples} samples in {} blocks (seed {seed}); run with: omicfuse run --config {} --out-dir <DIR>",
        cohort.blocks.len(),
        run_file.display()
    );
    Ok(())
}
