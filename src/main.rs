use clap::{CommandFactory, Parser};
use color_eyre::eyre::eyre;
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use overseer::cli::{self, Cli, Command, ProgramArgs};
use overseer::config::ProgramSpec;
use overseer::paths::Paths;
use overseer::protocol::{ProgramEdit, ProgramStatus, Request, Response, UploadOptions};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let paths = match cli.base_dir {
        Some(dir) => Paths::with_base(std::path::absolute(dir)?),
        None => Paths::new()?,
    };

    if matches!(command, Command::Run) {
        init_tracing();
        overseer::daemon::run(paths).await?;
        return Ok(());
    }

    let request = command_to_request(command)?;
    let response = overseer::client::send_request(&paths, &request)?;
    if cli.json {
        print_response_json(&response)?;
    } else {
        print_response(&response);
    }
    if !response.is_success() {
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn split_args(args: Option<&str>) -> color_eyre::Result<Vec<String>> {
    cli::split_args(args).map_err(|e| eyre!("invalid --args: {e}"))
}

/// The supervisor resolves paths against its own working directory, so
/// archives are sent as absolute paths.
fn archive_path(path: &Path) -> color_eyre::Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

fn command_to_request(command: Command) -> color_eyre::Result<Request> {
    match command {
        Command::Run => unreachable!("run is handled directly in main"),
        Command::List => Ok(Request::List),
        Command::Log {
            name,
            lines,
            offset,
        } => Ok(Request::Log {
            name,
            lines,
            offset,
        }),
        Command::Start { name } => Ok(Request::Start { name }),
        Command::Stop { name } => Ok(Request::Stop { name }),
        Command::Restart { name } => Ok(Request::Restart { name }),
        Command::Add {
            name,
            script,
            options,
            venv,
            cwd,
        } => {
            let ProgramArgs {
                kind,
                disabled,
                comment,
                args,
                env,
            } = options;
            let mut spec = ProgramSpec::new(&name, &script, kind);
            spec.enabled = !disabled;
            spec.comment = comment;
            spec.venv = venv.map(PathBuf::from);
            spec.cwd = cwd.map(PathBuf::from);
            spec.args = split_args(args.as_deref())?;
            spec.environment = env;
            Ok(Request::Add { spec })
        }
        Command::Remove { name } => Ok(Request::Remove { name }),
        Command::Edit {
            name,
            rename,
            script,
            kind,
            enabled,
            comment,
            venv,
            cwd,
            args,
            env,
            clear_env,
        } => {
            let args = match args {
                Some(args) => Some(split_args(Some(&args))?),
                None => None,
            };
            let environment = if clear_env {
                Some(Vec::new())
            } else if env.is_empty() {
                None
            } else {
                Some(env)
            };
            Ok(Request::Edit {
                name,
                edit: ProgramEdit {
                    new_name: rename,
                    script,
                    kind,
                    enabled,
                    comment,
                    venv,
                    cwd,
                    args,
                    environment,
                },
            })
        }
        Command::Upload {
            name,
            archive,
            script,
            options,
        } => Ok(Request::Upload {
            program: UploadOptions {
                name,
                script,
                kind: options.kind,
                enabled: !options.disabled,
                comment: options.comment,
                args: split_args(options.args.as_deref())?,
                environment: options.env,
            },
            archive: archive_path(&archive)?,
        }),
        Command::Update { name, archive } => Ok(Request::Update {
            name,
            archive: archive_path(&archive)?,
        }),
        Command::Reload => Ok(Request::Reload),
        Command::Reset { name } => Ok(Request::ResetRestarts { name }),
        Command::Kill => Ok(Request::Kill),
    }
}

fn print_response_json(response: &Response) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string(response)?);
    Ok(())
}

fn status_color(status: ProgramStatus) -> Color {
    match status {
        ProgramStatus::Running => Color::Green,
        ProgramStatus::Stopping | ProgramStatus::Restarting => Color::Yellow,
        ProgramStatus::Installing => Color::Blue,
        ProgramStatus::Broken => Color::Magenta,
        ProgramStatus::Error => Color::Red,
        ProgramStatus::Stopped => Color::Reset,
    }
}

fn print_response(response: &Response) {
    match response {
        Response::Success { message } => {
            if let Some(msg) = message {
                println!("{}", msg.green());
            } else {
                println!("{}", "ok".green());
            }
        }
        Response::Error { message } => {
            eprintln!("{} {}", "error:".red().bold(), message);
        }
        Response::ProgramList { programs } => {
            if programs.is_empty() {
                println!("{}", "no programs configured".yellow());
                return;
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL_CONDENSED);
            table.set_header(vec![
                Cell::new("name").add_attribute(Attribute::Bold),
                Cell::new("type").add_attribute(Attribute::Bold),
                Cell::new("pid").add_attribute(Attribute::Bold),
                Cell::new("status").add_attribute(Attribute::Bold),
                Cell::new("cpu").add_attribute(Attribute::Bold),
                Cell::new("uptime").add_attribute(Attribute::Bold),
                Cell::new("restarts").add_attribute(Attribute::Bold),
                Cell::new("failures").add_attribute(Attribute::Bold),
                Cell::new("log").add_attribute(Attribute::Bold),
                Cell::new("comment").add_attribute(Attribute::Bold),
            ]);
            for p in programs {
                let pid = match p.pid {
                    Some(pid) if p.owned => pid.to_string(),
                    Some(pid) => format!("{pid}*"),
                    None => "-".to_string(),
                };
                let mut name_cell = Cell::new(&p.spec.name).fg(Color::Cyan);
                if !p.spec.enabled {
                    name_cell = name_cell.add_attribute(Attribute::Dim);
                }
                let restarts = p.total_restarts.to_string();
                let restarts_cell = if p.total_restarts > 0 {
                    Cell::new(&restarts).fg(Color::Yellow)
                } else {
                    Cell::new(&restarts)
                };
                let failures = p.consecutive_failures.to_string();
                let failures_cell = if p.is_broken {
                    Cell::new(&failures).fg(Color::Red)
                } else {
                    Cell::new(&failures)
                };
                table.add_row(vec![
                    name_cell,
                    Cell::new(p.spec.kind.to_string()),
                    Cell::new(&pid),
                    Cell::new(p.status.to_string()).fg(status_color(p.status)),
                    Cell::new(format_cpu(p.cpu_percent)),
                    Cell::new(format_uptime(p.uptime)),
                    restarts_cell,
                    failures_cell,
                    Cell::new(format_size(p.log_size)),
                    Cell::new(p.spec.comment.as_deref().unwrap_or("")),
                ]);
            }
            println!("{table}");
        }
        Response::LogPage { name, page } => {
            if page.total_lines == 0 {
                println!("{}", format!("log for '{name}' is empty").yellow());
                return;
            }
            print!("{}", page.content);
            if !page.content.ends_with('\n') {
                println!();
            }
            let mut footer = format!(
                "[{name}] lines {}-{} of {}",
                page.start_line, page.end_line, page.total_lines
            );
            if page.has_more {
                footer.push_str(", older lines available with --offset");
            }
            println!("{}", footer.dimmed());
        }
    }
}

fn format_cpu(cpu: Option<f32>) -> String {
    match cpu {
        Some(v) => format!("{v:.1}%"),
        None => "-".to_string(),
    }
}

fn format_size(bytes: u64) -> String {
    match bytes {
        b if b < 1024 => format!("{b}B"),
        b if b < 1024 * 1024 => format!("{:.1}K", b as f64 / 1024.0),
        b if b < 1024 * 1024 * 1024 => format!("{:.1}M", b as f64 / (1024.0 * 1024.0)),
        b => format!("{:.1}G", b as f64 / (1024.0 * 1024.0 * 1024.0)),
    }
}

fn format_uptime(seconds: Option<u64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 60 => format!("{s}s"),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        Some(s) => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}
