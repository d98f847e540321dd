use gatecrash_core::config::GatecrashConfig;
use gatecrash_core::fuzz::{FuzzMode, FuzzReport};
use gatecrash_core::source::{Literals, Mutations, Placement, ValueSource, Wordlist};
use gatecrash_core::Application;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, global = true)]
    config: Option<PathBuf>,
    /// Project file describing users, authentication stages and functions.
    #[clap(short, long, value_parser, global = true)]
    project: Option<PathBuf>,
    /// JSON file sessions are loaded from before and written to after the command.
    #[clap(short, long, value_parser, global = true)]
    session: Option<PathBuf>,
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the authentication process.
    Authenticate {
        /// User to authenticate as instead of the project's active user.
        #[clap(short, long)]
        user: Option<String>,
    },
    /// Run a function with the current session.
    Run { function: String },
    /// Replay a function or authentication stage with fuzzed values.
    Fuzz(FuzzArgs),
}

#[derive(Args, Debug)]
struct FuzzArgs {
    /// Function or authentication stage to fuzz.
    name: String,
    /// Input plugin whose value is replaced.
    #[clap(long)]
    point: String,
    #[clap(long, value_delimiter = ',', conflicts_with_all = ["wordlist", "mutations"])]
    values: Vec<String>,
    #[clap(long, conflicts_with = "mutations")]
    wordlist: Option<PathBuf>,
    /// Put wordlist entries in front of the original value.
    #[clap(long, requires = "wordlist", conflicts_with = "append")]
    prepend: bool,
    /// Put wordlist entries after the original value.
    #[clap(long, requires = "wordlist")]
    append: bool,
    /// Number of random mutations of the original value.
    #[clap(long)]
    mutations: Option<usize>,
    #[clap(long, default_value_t = 0, requires = "mutations")]
    seed: u64,
    /// Treat the name as an authentication stage even if a function has it too.
    #[clap(long)]
    authentication: bool,
    #[clap(short, long)]
    threads: Option<usize>,
}

impl FuzzArgs {
    fn source(&self) -> Result<Box<dyn ValueSource>, anyhow::Error> {
        if let Some(path) = &self.wordlist {
            let placement = if self.prepend {
                Placement::Prepend
            } else if self.append {
                Placement::Append
            } else {
                Placement::Replace
            };
            return Ok(Box::new(Wordlist::new(path.clone(), placement)));
        }
        if let Some(count) = self.mutations {
            return Ok(Box::new(Mutations::new(self.seed, Some(count))));
        }
        if self.values.is_empty() {
            return Err(anyhow::anyhow!(
                "One of --values, --wordlist or --mutations is required"
            ));
        }
        Ok(Box::new(Literals::new(self.values.clone())))
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<GatecrashConfig, anyhow::Error> {
    match path {
        Some(config_path) => GatecrashConfig::load_from_file(config_path),
        None => {
            let default_config_path = PathBuf::from("gatecrash.toml");
            if default_config_path.exists() {
                GatecrashConfig::load_from_file(&default_config_path)
            } else {
                Ok(GatecrashConfig::default())
            }
        }
    }
}

fn init_logging(verbose: u8, configured_level: &str) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured_level)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &FuzzReport) {
    println!(
        "{:<24} {:>6}  {:<32}  next stage",
        "value", "status", "body md5"
    );
    for attempt in report.attempts() {
        println!(
            "{:<24} {:>6}  {:<32}  {}{}",
            attempt.value,
            attempt.status,
            attempt.body_hash,
            attempt.next_stage.as_deref().unwrap_or("-"),
            if attempt.new_response { "  (new)" } else { "" }
        );
    }
    println!(
        "{} attempts, {} distinct responses{}",
        report.attempts().len(),
        report.distinct_responses(),
        if report.cancelled() { ", cancelled" } else { "" }
    );
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_ref())?;
    init_logging(cli.verbose, &config.logging.level);

    if let Some(project) = cli.project {
        config.project = Some(project);
    }
    if let Some(session) = cli.session {
        config.session_file = Some(session);
    }
    if let Command::Fuzz(FuzzArgs {
        threads: Some(threads),
        ..
    }) = &cli.command
    {
        config.fuzzer.threads = *threads;
    }

    let project_path = config
        .project
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No project given: use --project or set `project` in the config file"))?;
    let session_file = config.session_file.clone();

    let mut app = Application::open(&project_path, config)?;
    info!("Loaded project '{}' from {:?}", app.name(), project_path);

    if let Some(path) = &session_file {
        if path.exists() {
            app.load_session(path)?;
        } else {
            warn!("Session file {:?} does not exist yet, starting fresh", path);
        }
    }

    let start_time = Instant::now();
    match &cli.command {
        Command::Authenticate { user } => {
            let visited = app.authenticate(user.as_deref())?;
            println!(
                "Authenticated '{}' through: {}",
                app.active_user().username,
                visited.join(" -> ")
            );
        }
        Command::Run { function } => {
            if let Some(next) = app.run_function(function)? {
                println!("Function '{function}' selected stage '{next}'");
            }
        }
        Command::Fuzz(args) => {
            let mode = if args.authentication {
                FuzzMode::Authentication
            } else {
                app.fuzz_mode_of(&args.name)?
            };
            let report = app.fuzz(mode, &args.name, &args.point, args.source()?)?;
            print_report(&report);
        }
    }
    info!("Finished in {:.2?}", start_time.elapsed());

    if let Some(path) = &session_file {
        app.write_session(path)?;
    }
    Ok(())
}
