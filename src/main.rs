use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bioext::{
    annotation::ProjectSpec,
    config::{AnnotationConfig, SearchConfig, TrainerConfig},
    search::{self, WildcardQuery},
    records::Project,
    trainer::NewProject,
    AnnotationClient, SearchClient, TrainerClient,
};
use clap::*;
use futures::{pin_mut, TryStreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrieve documents from the search index
    #[command(subcommand)]
    Search(SearchCommand),
    /// Manage labelling projects on the annotation server
    #[command(subcommand)]
    Annotate(AnnotateCommand),
    /// Manage projects on the concept annotation training platform
    #[command(subcommand)]
    Trainer(TrainerCommand),
}

#[derive(Subcommand)]
enum SearchCommand {
    /// List the indices visible to the api key
    Indices,
    /// Write every document matching all wildcard clauses to <out>/<id>.json
    Scan {
        #[arg(long)]
        index: String,
        /// Clause of the form field=pattern, e.g. text=*brca*
        #[arg(long = "wildcard", required = true)]
        wildcards: Vec<String>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum AnnotateCommand {
    /// Create a project, or update it if it is tagged allow_update
    Upsert {
        /// JSON file with name, project_type, description, guideline, labels, label_type
        #[arg(long)]
        config: PathBuf,
    },
    /// Load a JSON document, or a directory of search results, into a project
    Load {
        #[arg(long)]
        project_id: u64,
        #[arg(long, conflicts_with = "dir", required_unless_present = "dir")]
        file: Option<PathBuf>,
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Field of `_source` holding the text when loading a directory
        #[arg(long, default_value = "text")]
        text_field: String,
    },
    /// Print the labelled samples of a project
    Stream {
        #[arg(long)]
        project_id: u64,
    },
    /// Export the labelled samples of a project as JSON
    Export {
        #[arg(long)]
        project_id: u64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Listing {
    Users,
    Datasets,
    ConceptDbs,
    Vocabs,
    ModelPacks,
    MetaTasks,
    RelTasks,
    Projects,
}

#[derive(Subcommand)]
enum TrainerCommand {
    /// List one of the platform's collections
    List { kind: Listing },
    /// Create a project from a JSON request; references may be names
    CreateProject {
        #[arg(long)]
        config: PathBuf,
    },
    /// Download annotations of the given projects
    Annotations {
        #[arg(long = "project-id", required = true)]
        project_ids: Vec<u64>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

async fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn write_or_print(value: &impl Serialize, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => tokio::fs::write(path, serde_json::to_vec_pretty(value)?)
            .await
            .with_context(|| format!("failed to write {}", path.display())),
        None => print_json(value),
    }
}

async fn run_search(command: SearchCommand) -> Result<()> {
    let config = SearchConfig::from_env().context("failed to load search config")?;
    let client = SearchClient::new(&config).context("failed to create search client")?;

    match command {
        SearchCommand::Indices => {
            for index in client.list_indices().await? {
                println!("{index}");
            }
        }
        SearchCommand::Scan {
            index,
            wildcards,
            out,
        } => {
            let mut query = WildcardQuery::new();
            for clause in &wildcards {
                let (field, pattern) = WildcardQuery::parse_clause(clause)?;
                query = query.must(field, pattern);
            }
            let count = search::dump_hits(client.scan(&query, &index), &out)
                .await
                .context("scan failed")?;
            println!("Total: {count} docs");
        }
    }
    Ok(())
}

async fn run_annotate(command: AnnotateCommand) -> Result<()> {
    let config = AnnotationConfig::from_env().context("failed to load annotation config")?;
    let mut client = AnnotationClient::connect(&config)
        .await
        .context("failed to connect to annotation server")?;
    println!("Connected as user: {}", client.profile().username);

    match command {
        AnnotateCommand::Upsert { config } => {
            let spec: ProjectSpec = read_config(&config).await?;
            let project = client
                .upsert_project(&spec)
                .await
                .context("failed to create or update project")?;
            println!("Using project: {}, with ID {}", project.name, project.id);
        }
        AnnotateCommand::Load {
            project_id,
            file,
            dir,
            text_field,
        } => {
            if let Some(dir) = dir {
                let count = client
                    .load_directory(&dir, &text_field, Some(project_id))
                    .await
                    .context("failed to load documents")?;
                println!("Uploaded {count} documents");
            } else if let Some(file) = file {
                let example = client
                    .load_from_file(&file, Some(project_id))
                    .await
                    .context("failed to load document")?;
                println!("Uploaded document {}", example.id);
            }
        }
        AnnotateCommand::Stream { project_id } => {
            let samples = client.stream_labelled_samples(Some(project_id))?;
            pin_mut!(samples);
            let mut i = 0;
            while let Some(sample) = samples.try_next().await? {
                i += 1;
                let preview: String = sample.text.chars().take(50).collect();
                println!("\nSample {i}:");
                println!("Text: {preview}...");
                println!("Labels: {:?}", sample.labels);
            }
        }
        AnnotateCommand::Export { project_id, out } => {
            let samples = client
                .export_labelled_samples(Some(project_id), out.as_deref())
                .await
                .context("failed to export samples")?;
            if out.is_none() {
                print_json(&samples)?;
            }
        }
    }
    Ok(())
}

async fn run_trainer(command: TrainerCommand) -> Result<()> {
    let config = TrainerConfig::from_env().context("failed to load training platform config")?;
    let client = TrainerClient::connect(&config)
        .await
        .context("failed to connect to training platform")?;

    match command {
        TrainerCommand::List { kind } => match kind {
            Listing::Users => print_json(&client.get_users().await?)?,
            Listing::Datasets => print_json(&client.get_datasets().await?)?,
            Listing::ConceptDbs => print_json(&client.get_concept_dbs().await?)?,
            Listing::Vocabs => print_json(&client.get_vocabs().await?)?,
            Listing::ModelPacks => print_json(&client.get_model_packs().await?)?,
            Listing::MetaTasks => print_json(&client.get_meta_tasks().await?)?,
            Listing::RelTasks => print_json(&client.get_rel_tasks().await?)?,
            Listing::Projects => print_json(&client.get_projects().await?)?,
        },
        TrainerCommand::CreateProject { config } => {
            let request: NewProject = read_config(&config).await?;
            let project = client
                .create_project(request)
                .await
                .context("failed to create project")?;
            print_json(&project)?;
        }
        TrainerCommand::Annotations { project_ids, out } => {
            let projects: Vec<Project> = project_ids
                .into_iter()
                .map(|id| Project {
                    id: Some(id),
                    ..Project::default()
                })
                .collect();
            let annotations = client
                .get_project_annotations(&projects)
                .await
                .context("failed to download annotations")?;
            write_or_print(&annotations, out.as_deref()).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if dotenv::dotenv().is_err() {
        warn!("didn't load a .env file")
    }

    let args = Cli::parse();

    match args.command {
        Commands::Search(command) => run_search(command).await,
        Commands::Annotate(command) => run_annotate(command).await,
        Commands::Trainer(command) => run_trainer(command).await,
    }
}
