use anyhow::{Context, Result};
use arca::git::Depth;
use arca::repository::parse_shallow_since;
use arca::{Arca, RunOptions, Settings, Task};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Run callables from git repositories in cached, isolated environments.
#[derive(Parser)]
#[command(name = "arca", version, about)]
struct Cli {
    /// Backend: venv, docker, vagrant or current_environment
    #[arg(short, long, env = "ARCA_BACKEND")]
    backend: Option<String>,

    /// Directory for clones, environments and task files
    #[arg(long, env = "ARCA_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Extra settings as KEY=VALUE, e.g. docker_backend_python_version=3.11
    #[arg(short = 's', long = "setting", value_name = "KEY=VALUE")]
    settings: Vec<String>,

    /// Print debug information
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Source {
    /// http(s):// or file:// repository URL
    repo: String,

    branch: String,

    /// Commits to clone, or "unlimited"
    #[arg(long, conflicts_with = "shallow_since")]
    depth: Option<String>,

    /// Clone history since this date (YYYY-MM-DD)
    #[arg(long)]
    shallow_since: Option<String>,

    /// Repository to borrow objects from when cloning
    #[arg(long)]
    reference: Option<PathBuf>,
}

impl Source {
    fn options(&self) -> Result<RunOptions> {
        let mut options = RunOptions::default();
        if let Some(depth) = &self.depth {
            options = options.depth(depth.parse::<Depth>()?);
        }
        if let Some(since) = &self.shallow_since {
            options = options.shallow_since(parse_shallow_since(since)?);
        }
        if let Some(reference) = &self.reference {
            options = options.reference(reference);
        }
        Ok(options)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run a callable and print its JSON output
    Run {
        #[command(flatten)]
        source: Source,

        /// module.path:callable
        entry_point: String,

        /// Positional arguments, each a JSON value
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Keyword arguments as NAME=JSON
        #[arg(short, long = "kwarg")]
        kwargs: Vec<String>,

        /// Seconds before the task is killed
        #[arg(short, long, default_value_t = arca::task::DEFAULT_TIMEOUT_SECS)]
        timeout: u64,

        /// Only store successful results in the cache
        #[arg(long)]
        cache_successful_only: bool,
    },
    /// Print the absolute path of a file in the repository
    StaticFile {
        #[command(flatten)]
        source: Source,

        path: PathBuf,
    },
}

fn parse_json(value: &str) -> serde_json::Value {
    // bare words are taken as strings
    serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}

fn settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::new();
    for pair in &cli.settings {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("setting '{}' is not KEY=VALUE", pair))?;
        settings = settings.with(key.trim(), value);
    }
    if let Some(backend) = &cli.backend {
        settings = settings.with("backend", backend.as_str());
    }
    if let Some(base_dir) = &cli.base_dir {
        settings = settings.with("base_dir", base_dir.to_string_lossy());
    }
    Ok(settings.with_env())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = settings(&cli)?;
    let mut arca = Arca::from_settings(&settings).context("failed to configure arca")?;

    match cli.command {
        Command::Run {
            source,
            entry_point,
            args,
            kwargs,
            timeout,
            cache_successful_only,
        } => {
            let mut builder = Task::builder(&entry_point).timeout(timeout);
            for arg in &args {
                builder = builder.arg(parse_json(arg));
            }
            for kwarg in &kwargs {
                let (name, value) = kwarg
                    .split_once('=')
                    .with_context(|| format!("keyword argument '{}' is not NAME=JSON", kwarg))?;
                builder = builder.kwarg(name.trim(), parse_json(value));
            }
            let task = builder.build().context("invalid task")?;

            if cache_successful_only {
                arca = arca.cache_successful_only();
            }

            let result = arca
                .run(&source.repo, &source.branch, &task, &source.options()?)
                .with_context(|| format!("running {} failed", task))?;
            let output = result.into_output()?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::StaticFile { source, path } => {
            let resolved = arca
                .static_filename(&source.repo, &source.branch, &path, &source.options()?)
                .with_context(|| format!("can't resolve {}", path.display()))?;
            println!("{}", resolved.display());
        }
    }

    Ok(())
}
