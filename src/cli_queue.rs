use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pezzottify_job_queue::config::{AppConfig, CliConfig, FileConfig};
use pezzottify_job_queue::job_queue::{
    Delay, JobPayload, JobQueue, JobRecord, SqliteJobStore, SystemClock,
};
use pezzottify_job_queue::metrics;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(about = "Inspect and operate a job queue database")]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override command line options.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the job queue database.
    #[clap(long, value_parser = parse_path)]
    pub db: Option<PathBuf>,

    /// Queue used when a command does not name one.
    #[clap(long)]
    pub default_queue: Option<String>,

    /// Seconds after which a reservation is considered abandoned.
    #[clap(long)]
    pub expiry_secs: Option<u64>,

    /// Milliseconds to wait for another connection's lock.
    #[clap(long)]
    pub busy_timeout_ms: Option<u64>,

    /// Print the counters recorded by the command when it completes.
    #[clap(long)]
    pub print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pushes a job that is available immediately.
    ///
    /// With --job the payload is parsed as JSON and wrapped as the job's data.
    Push {
        payload: String,
        #[clap(long)]
        job: Option<String>,
        #[clap(short, long)]
        queue: Option<String>,
    },

    /// Pushes a job that becomes available after the given number of seconds.
    Later {
        delay_secs: u64,
        payload: String,
        #[clap(long)]
        job: Option<String>,
        #[clap(short, long)]
        queue: Option<String>,
    },

    /// Pushes all payloads in a single transaction.
    Bulk {
        #[clap(required = true)]
        payloads: Vec<String>,
        #[clap(short, long)]
        queue: Option<String>,
    },

    /// Reserves the next job and prints it.
    ///
    /// Without --delete or --release the job stays reserved until it expires.
    Pop {
        #[clap(short, long)]
        queue: Option<String>,
        /// Deletes the job right after reserving it.
        #[clap(long, conflicts_with = "release")]
        delete: bool,
        /// Releases the job back, available after the given number of seconds.
        #[clap(long, value_name = "DELAY_SECS")]
        release: Option<u64>,
    },

    /// Deletes a job by id. Deleting a missing job is not an error.
    Delete {
        id: i64,
        #[clap(short, long)]
        queue: Option<String>,
    },

    /// Shows a job by id.
    Show { id: i64 },

    /// Prints the number of jobs in a queue, reserved ones included.
    Size {
        #[clap(short, long)]
        queue: Option<String>,
    },

    /// Prints a breakdown of a queue, or of every queue if none is given.
    Stats {
        #[clap(short, long)]
        queue: Option<String>,
    },
}

fn build_payload(payload: String, job: Option<String>) -> Result<Vec<u8>> {
    match job {
        Some(job) => {
            let data: serde_json::Value = serde_json::from_str(&payload)
                .with_context(|| format!("Job data is not valid JSON: {}", payload))?;
            Ok(JobPayload::new(job, data).encode()?)
        }
        None => Ok(payload.into_bytes()),
    }
}

fn print_job(job: &JobRecord) {
    println!("id:           {}", job.id);
    println!("queue:        {}", job.queue);
    println!("attempts:     {}", job.attempts);
    match job.reserved_at {
        Some(reserved_at) => println!("reserved_at:  {}", reserved_at),
        None => println!("reserved_at:  -"),
    }
    println!("available_at: {}", job.available_at);
    println!("created_at:   {}", job.created_at);
    match JobPayload::decode(&job.payload) {
        Ok(payload) => println!("job:          {} {}", payload.job, payload.data),
        Err(_) => println!("payload:      {}", String::from_utf8_lossy(&job.payload)),
    }
}

fn run(queue: &JobQueue<SqliteJobStore>, command: Command) -> Result<()> {
    match command {
        Command::Push {
            payload,
            job,
            queue: name,
        } => {
            let id = queue.push(build_payload(payload, job)?, name.as_deref())?;
            println!("{}", id);
        }
        Command::Later {
            delay_secs,
            payload,
            job,
            queue: name,
        } => {
            let id = queue.later(
                Delay::seconds(delay_secs),
                build_payload(payload, job)?,
                name.as_deref(),
            )?;
            println!("{}", id);
        }
        Command::Bulk {
            payloads,
            queue: name,
        } => {
            let payloads = payloads.into_iter().map(String::into_bytes).collect();
            let count = queue.bulk(payloads, name.as_deref())?;
            println!("{}", count);
        }
        Command::Pop {
            queue: name,
            delete,
            release,
        } => {
            let Some(job) = queue.pop(name.as_deref())? else {
                println!("Queue '{}' has no available job", queue.queue_name(name.as_deref()));
                return Ok(());
            };
            print_job(job.record());
            if delete {
                job.delete()?;
                println!("Deleted.");
            } else if let Some(delay_secs) = release {
                job.release(Delay::seconds(delay_secs))?;
                println!("Released, available again in {}s.", delay_secs);
            }
        }
        Command::Delete { id, queue: name } => {
            queue.delete_reserved(name.as_deref(), id)?;
        }
        Command::Show { id } => match queue.find(id)? {
            Some(job) => print_job(&job),
            None => bail!("Job {} not found", id),
        },
        Command::Size { queue: name } => {
            println!("{}", queue.size(name.as_deref())?);
        }
        Command::Stats { queue: name } => {
            let names = match name {
                Some(name) => vec![name],
                None => queue.queue_names()?,
            };
            for name in names {
                let stats = queue.stats(Some(&name))?;
                println!("{}: {}", name, serde_json::to_string(&stats)?);
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db.clone(),
        default_queue: cli_args.default_queue.clone(),
        expiry_secs: cli_args.expiry_secs,
        busy_timeout_ms: cli_args.busy_timeout_ms,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    metrics::init_metrics();

    let store = SqliteJobStore::new(&config.db_path, config.queue.busy_timeout())?;
    let queue = JobQueue::new(store, Arc::new(SystemClock), config.queue);

    run(&queue, cli_args.command)?;

    if cli_args.print_metrics {
        print!("{}", metrics::gather_metrics()?);
    }
    Ok(())
}
