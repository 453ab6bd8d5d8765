use clap::{Parser, Subcommand};
use proclog::tools::{self, ToolResponse};
use proclog::{git, runner, Config, Database};
use std::env;
use std::process;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture and search the output of wrapped processes")]
struct Args {
    #[arg(long, global = true, help = "Directory holding the log store", value_name = "PATH")]
    dir: Option<String>,

    #[arg(long, global = true, help = "Skip the startup prune")]
    no_auto_prune: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a command and capture its output
    Run {
        #[arg(long, help = "Logical name for this process")]
        name: Option<String>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Full-text search over captured lines
    Search {
        query: String,
        #[arg(long)]
        process: Option<String>,
        #[arg(long)]
        level: Option<String>,
        #[arg(long, help = "RFC 3339 timestamp or duration like 30m, 2h, 7d")]
        since: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Error lines from the last few hours
    Errors {
        #[arg(long, default_value_t = 1)]
        hours: u64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        process: Option<String>,
    },
    /// List captured processes
    Ps {
        #[arg(long, help = "Only processes still running")]
        active: bool,
    },
    /// Most recent lines of a named process
    Tail {
        process: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
        #[arg(long)]
        level: Option<String>,
    },
    /// Aggregate counts over a time window
    Summary {
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
    /// Delete entries older than the given age
    Prune {
        #[arg(long)]
        max_age_hours: Option<u64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Store totals and disk usage
    Stats,
    /// Rebuild the full-text index from stored rows
    Reindex,
    /// Record a work session summary
    SaveSession {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, help = "Defaults to the current git repository name")]
        project: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long = "file", help = "Defaults to files changed in the working tree")]
        files: Vec<String>,
    },
    /// Search recorded session summaries
    Sessions {
        query: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("PROCLOG_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<i32, Box<dyn std::error::Error>> {
    let mut config = Config::load()?;
    if let Some(dir) = &args.dir {
        config.log_dir = dir.into();
    }

    let db = Database::open(&config)?;
    info!(path = ?db.path(), "log store ready");

    if !args.no_auto_prune {
        if let Some(hours) = config.auto_prune_max_age_hours {
            if let Err(e) = db.prune_old_logs(hours, false) {
                warn!(error = %e, max_age_hours = hours, "startup prune failed");
            }
        }
    }

    let response = match args.command {
        Cmd::Run { name, command } => {
            let name = name.unwrap_or_else(|| default_name(&command));
            return Ok(runner::run_command(&db, &name, &command)?);
        }
        Cmd::Search {
            query,
            process,
            level,
            since,
            limit,
        } => tools::respond(tools::search_logs(
            &db,
            &tools::SearchLogsParams {
                query,
                process,
                level,
                since,
                limit,
            },
        )),
        Cmd::Errors {
            hours,
            limit,
            process,
        } => tools::respond(tools::get_recent_errors(
            &db,
            &tools::RecentErrorsParams {
                hours,
                limit,
                process,
            },
        )),
        Cmd::Ps { active } => tools::respond(tools::list_processes(
            &db,
            &tools::ListProcessesParams {
                active_only: active,
            },
        )),
        Cmd::Tail {
            process,
            lines,
            level,
        } => tools::respond(tools::tail_process_logs(
            &db,
            &tools::TailParams {
                process,
                lines,
                level,
            },
        )),
        Cmd::Summary { hours } => {
            tools::respond(tools::get_log_summary(&db, &tools::SummaryParams { hours }))
        }
        Cmd::Prune {
            max_age_hours,
            dry_run,
        } => tools::respond(tools::prune_old_logs(
            &db,
            &tools::PruneParams {
                max_age_hours,
                dry_run,
            },
        )),
        Cmd::Stats => tools::respond(tools::get_log_statistics(&db)),
        Cmd::Reindex => tools::respond(tools::rebuild_search_index(&db)),
        Cmd::SaveSession {
            title,
            description,
            tags,
            project,
            model,
            files,
        } => {
            let mut params = tools::SaveSessionParams {
                title,
                description,
                tags,
                project: project.unwrap_or_default(),
                llm_model: model,
                files_changed: files,
            };
            if params.project.is_empty() || params.files_changed.is_empty() {
                let repo = env::current_dir()
                    .ok()
                    .and_then(|cwd| git::detect_repo_info(&cwd));
                let mut new = proclog::NewSessionSummary {
                    project: params.project.clone(),
                    files_changed: params.files_changed.clone(),
                    ..Default::default()
                };
                new.fill_from_repo(repo.as_ref());
                params.project = new.project;
                params.files_changed = new.files_changed;
            }
            tools::respond(tools::save_session_summary(&db, params))
        }
        Cmd::Sessions {
            query,
            project,
            limit,
        } => tools::respond(tools::search_session_summaries(
            &db,
            &tools::SearchSessionsParams {
                query,
                project,
                limit,
            },
        )),
    };

    Ok(print_response(response))
}

fn print_response(response: ToolResponse) -> i32 {
    if response.is_error {
        eprintln!("{}", response.text);
        1
    } else {
        println!("{}", response.text);
        0
    }
}

/// File name of the program being run.
fn default_name(command: &[String]) -> String {
    command
        .first()
        .and_then(|program| {
            std::path::Path::new(program)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "process".to_string())
}
