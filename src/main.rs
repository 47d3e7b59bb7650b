/// docker-meta
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use thiserror::Error;

mod bake;
mod config;
mod context;
mod expr;
mod git;
mod meta;
mod pep440;
mod rules;

/// Generate Docker image tags, OCI labels and annotations from the state
/// of a git working tree.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Root of the source code tree.
    #[arg(default_value = ".")]
    source_directory: String,

    /// Path to the metadata configuration file.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve the version and print one image tag per separator.
    Tags,
    /// Print OCI image labels.
    Labels,
    /// Print OCI image annotations, one copy per annotation level.
    Annotations,
    /// Print tags, labels and annotations as a single JSON document.
    Json,
    /// Write bake definition files and print their paths.
    Bake {
        /// Write only one definition: "tags", "labels" or
        /// "annotations:<level>,...". Omitting this flag writes all of
        /// them plus a combined tags-and-labels file.
        #[arg(long)]
        kind: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),

    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::Error),

    #[error("invalid input: {0}")]
    Rules(#[from] rules::Error),

    #[error("environment: {0}")]
    Context(#[from] context::Error),

    #[error("git error: {0}")]
    Git(#[from] git::Error),

    #[error("metadata could not be generated: {0}")]
    Meta(#[from] meta::Error),

    #[error("bake file error: {0}")]
    Bake(#[from] bake::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Read configuration file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// If a configuration file name is not set explicitly, this function will
/// detect whether a config file with the default file name exists on disk.
/// If it does, it is used implicitly. If not, we ignore any read errors.
fn read_config(args: &Cli) -> Result<config::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "meta.toml";

    // Typically found in project root, e.g. ./meta.toml
    let config_path = format!("{}/{}", args.source_directory, DEFAULT_CONFIG_FILE);

    let config_file = match &args.config {
        None => {
            if std::fs::metadata(&config_path)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false)
            {
                Some(config_path)
            } else {
                None
            }
        }
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        config::File::default_with_user_config_file(config_file.as_ref())?
    } else {
        config::File::default()
    })
}

fn main() {
    match run() {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {}", err.to_string());
            std::process::exit(1)
        }
    }
}

fn run() -> Result<(), Error> {
    env_logger::init();

    let args = Cli::parse();
    let cfg = read_config(&args)?;

    info!("docker-meta 0.1.0");

    let snapshot = git::snapshot(&args.source_directory)?;
    let ctx = context::Context::from_snapshot(&snapshot)?;
    info!("commit {} at {}", ctx.short_sha(), ctx.commit_date);
    info!("ref {}", ctx.git_ref);

    let mut repo = git::repo_from_remote_url(&snapshot.remote_url, &snapshot.default_branch);
    if let Some(description) = &cfg.description {
        repo.description = description.clone();
    }
    if let Some(license) = &cfg.license {
        repo.license = license.clone();
    }

    let inputs = meta::Inputs {
        rules: rules::tags(&context::input_list(&cfg.tags, true))?,
        images: rules::images(&context::input_list(&cfg.images, true))?,
        flavor: rules::flavor(&context::input_list(&cfg.flavor, true))?,
        labels: context::input_list(&cfg.labels, true),
        annotations: context::input_list(&cfg.annotations, true),
        bake_target: cfg.bake_target.clone(),
    };
    let meta = meta::Meta::new(inputs, ctx, repo)?;

    match &meta.version.main {
        Some(main) => info!("version resolved to {main}"),
        None => warn!("no version resolved; tag output will be empty"),
    }

    let levels = context::annotation_levels();
    match args.command {
        Commands::Tags => {
            println!("{}", meta.tags().join(&cfg.sep_tags));
            Ok(())
        }
        Commands::Labels => {
            println!("{}", meta.labels()?.join(&cfg.sep_labels));
            Ok(())
        }
        Commands::Annotations => {
            println!("{}", meta.leveled_annotations(&levels)?.join(&cfg.sep_annotations));
            Ok(())
        }
        Commands::Json => {
            println!("{}", serde_json::to_string_pretty(&meta.json(&levels)?)?);
            Ok(())
        }
        Commands::Bake { kind: Some(kind) } => {
            let definition = meta.bake_definition(&kind)?;
            let suffix = kind.split(':').next().unwrap_or(&kind);
            let path = bake::write(&definition, Some(suffix))?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Bake { kind: None } => {
            let annotations_kind = format!("annotations:{}", levels.join(","));
            for kind in ["tags", "labels", annotations_kind.as_str()] {
                let definition = meta.bake_definition(kind)?;
                let suffix = kind.split(':').next().unwrap_or(kind);
                let path = bake::write(&definition, Some(suffix))?;
                println!("{}", path.display());
            }
            let path = bake::write(&meta.bake_definition_tags_labels()?, None)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}
