use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logmill::dispatcher::Dispatcher;
use logmill::dsl;
use logmill::error::AppError;
use logmill::metrics::MetricStore;
use logmill::settings::{self, Settings};
use logmill::{poller, program};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "logmill", about = "Extract metrics from log files", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail log files through the loaded programs
    Run(RunArgs),
    /// Compile programs and report errors without running them
    Compile {
        /// Program files to check
        files: Vec<PathBuf>,
        /// Print the bytecode of each program that compiles
        #[arg(long)]
        dump: bool,
        /// List the builtin functions and exit
        #[arg(long)]
        builtins: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// JSON settings file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory of *.lm programs
    #[arg(long)]
    progs: Option<PathBuf>,
    /// Log file to tail (repeatable)
    #[arg(long = "logs")]
    logs: Vec<PathBuf>,
    /// Read each log once to the end, print the metrics and exit
    #[arg(long)]
    one_shot: bool,
    /// Read existing log contents, not only new lines
    #[arg(long)]
    from_start: bool,
    /// Polling interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Include hidden metrics in the output
    #[arg(long)]
    emit_hidden: bool,
    /// Print each program's bytecode after loading
    #[arg(long)]
    dump_bytecode: bool,
}

impl RunArgs {
    fn into_settings(self) -> Result<Settings, AppError> {
        let mut settings = match &self.config {
            Some(path) => settings::load_settings(path)?,
            None => Settings::default(),
        };
        if let Some(progs) = self.progs {
            settings.progs = progs;
        }
        if !self.logs.is_empty() {
            settings.logs = self.logs;
        }
        if let Some(ms) = self.poll_interval_ms {
            settings.poll_interval_ms = ms;
        }
        settings.one_shot |= self.one_shot;
        settings.from_start |= self.from_start;
        settings.emit_hidden |= self.emit_hidden;
        settings.dump_bytecode |= self.dump_bytecode;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logmill=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => match args.into_settings() {
            Ok(settings) => run(settings).await,
            Err(e) => Err(e),
        },
        Commands::Compile { files, dump, builtins } => {
            if builtins {
                print!("{}", dsl::builtins::reference());
                Ok(())
            } else {
                compile(&files, dump)
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn compile(files: &[PathBuf], dump: bool) -> Result<(), AppError> {
    let mut failed = 0;
    for path in files {
        let source = std::fs::read_to_string(path)?;
        let name = path.display().to_string();
        match dsl::compile_source(&name, &source) {
            Ok(compiled) => {
                if dump {
                    print!("{}", compiled.disassemble());
                }
            }
            Err(errors) => {
                failed += 1;
                for e in &errors {
                    eprintln!("{}", e.format_with_source(&name, &source));
                }
            }
        }
    }
    if failed > 0 {
        return Err(AppError::ValidationError {
            message: format!("{failed} of {} program(s) failed to compile", files.len()),
        });
    }
    Ok(())
}

async fn run(settings: Settings) -> Result<(), AppError> {
    let store = Arc::new(MetricStore::new());
    let report = program::load_dir(&settings.progs, &store)?;
    if settings.dump_bytecode {
        for p in &report.programs {
            eprint!("{}", p.program().disassemble());
        }
    }

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), report.programs));
    for log in &settings.logs {
        dispatcher.add_source(log, settings.reads_from_start()).await;
    }

    if settings.one_shot {
        dispatcher.poke_all().await;
    } else {
        let poller = poller::spawn(Arc::clone(&dispatcher), settings.poll_interval());
        wait_for_shutdown(&dispatcher, &settings.progs).await?;
        poller.abort();
    }
    dispatcher.shutdown().await;

    let snapshot = store.snapshot(settings.emit_hidden);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Wait for Ctrl-C, reloading programs on SIGHUP.
#[cfg(unix)]
async fn wait_for_shutdown(dispatcher: &Dispatcher, progs: &Path) -> Result<(), AppError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => {
                tracing::info!(dir = %progs.display(), "SIGHUP received, reloading programs");
                if let Err(e) = dispatcher.reload(progs) {
                    tracing::error!("reload failed, keeping current programs: {e}");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_dispatcher: &Dispatcher, _progs: &Path) -> Result<(), AppError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
