//! webscale - generate and synchronize nginx configuration
//!
//! Usage:
//!   webscale [--config <path>] <command>
//!
//!   configure [--reload]              Render nginx.conf from the template and options
//!   reload                            Verify (if configured) and reload nginx
//!   verify                            Run the verify command only
//!   topology                          Show the proxy endpoint and application server ports
//!   servers                           List upstream servers in the primary routing file
//!   install-check                     Exit 2 if enabling the proxy would clash with an
//!                                     existing multi-instance setup
//!   backend add <kind> <id> <host>    Route a collector or hub through the proxy
//!   backend update <kind> <id> <host> [field...]
//!   backend remove <kind> <id>
//!   backend list
//!   event <json|->                    Handle a backend event delivered as JSON
//!   migrate remove-port [port]        Drop an unused upstream port (default 9090)

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use webscale::config::Settings;
use webscale::events::{BackendEvent, EventHandler, TracingSink};
use webscale::fragment::{BackendKind, FragmentRepository, FsFragmentStore};
use webscale::generate::ConfigGenerator;
use webscale::migrate::{remove_unused_port, UNUSED_PORT};
use webscale::options::Options;
use webscale::reload::ReloadCoordinator;
use webscale::topology::TopologySource;
use webscale::upstream::list_servers;

const DEFAULT_SETTINGS_FILE: &str = "webscale.toml";
const EXIT_UNSAFE_TO_ENABLE: u8 = 2;

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Configure { reload: bool },
    Reload,
    Verify,
    Topology,
    Servers,
    InstallCheck,
    Backend(BackendCommand),
    Event { source: String },
    RemovePort { port: u16 },
}

#[derive(Debug, PartialEq)]
enum BackendCommand {
    Add {
        kind: BackendKind,
        id: String,
        host: String,
    },
    Update {
        kind: BackendKind,
        id: String,
        host: String,
        fields: Vec<String>,
    },
    Remove {
        kind: BackendKind,
        id: String,
    },
    List,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("webscale=info".parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, args) = split_config_flag(&args)?;
    let command = parse_command(&args)?;

    match command {
        Command::Help => {
            print_help();
            return Ok(ExitCode::SUCCESS);
        }
        Command::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let settings = load_settings(config_path.as_deref())?;

    match command {
        Command::Configure { reload } => {
            let generator = ConfigGenerator::from_settings(&settings);
            generator.generate()?;
            println!("Wrote {}", generator.output_path().display());
            if reload {
                ReloadCoordinator::from_settings(&settings)?.reload().await?;
            }
        }
        Command::Reload => ReloadCoordinator::from_settings(&settings)?.reload().await?,
        Command::Verify => ReloadCoordinator::from_settings(&settings)?.verify().await?,
        Command::Topology => {
            let endpoint = Options::load(settings.paths.options_file()).endpoint();
            let snapshot = TopologySource::from_settings(&settings).discover();
            println!("proxy: {}", endpoint);
            println!("base port: {}", snapshot.base_port);
            for port in &snapshot.secondary_ports {
                println!("secondary: {}", port);
            }
            for warning in &snapshot.warnings {
                println!("skipped: {}", warning);
            }
        }
        Command::Servers => {
            for server in list_servers(&settings.paths.upstream_file())? {
                println!("{}", server);
            }
        }
        Command::InstallCheck => {
            if TopologySource::from_settings(&settings).has_multiple_secondaries() {
                warn!("Already using multiple Zope instances; not switching to the proxy by default");
                println!("unsafe: multiple Zope instances already configured");
                return Ok(ExitCode::from(EXIT_UNSAFE_TO_ENABLE));
            }
            println!("safe: proxy can be enabled");
        }
        Command::Backend(BackendCommand::List) => {
            let store = FsFragmentStore::new(settings.paths.fragment_dir());
            for fragment in store.list()? {
                println!(
                    "{:<10} {:<24} {}:{}  {}",
                    fragment.kind,
                    fragment.id,
                    fragment.host,
                    fragment.port,
                    fragment.render_url_prefix()
                );
            }
        }
        Command::Backend(cmd) => {
            let event = backend_event(cmd);
            handle_event(&settings, &event).await?;
        }
        Command::Event { source } => {
            let json = if source == "-" {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read event from stdin")?;
                buf
            } else {
                source
            };
            let event: BackendEvent =
                serde_json::from_str(&json).context("Failed to parse backend event")?;
            handle_event(&settings, &event).await?;
        }
        Command::RemovePort { port } => {
            let topology = TopologySource::from_settings(&settings);
            let upstream = settings.paths.upstream_file();
            if remove_unused_port(&topology, &upstream, port)? {
                println!("Removed port {} from {}", port, upstream.display());
            } else {
                println!("No change to {}", upstream.display());
            }
        }
        Command::Help | Command::Version => unreachable!("handled before loading settings"),
    }

    Ok(ExitCode::SUCCESS)
}

async fn handle_event(settings: &Settings, event: &BackendEvent) -> Result<()> {
    let handler = EventHandler::new(
        FsFragmentStore::new(settings.paths.fragment_dir()),
        ReloadCoordinator::from_settings(settings)?,
        Box::new(TracingSink),
    )
    .with_reload_on_remove(settings.proxy.reload_on_remove);

    let outcome = handler.handle(event).await?;
    info!(?outcome, "Backend event handled");
    Ok(())
}

fn backend_event(cmd: BackendCommand) -> BackendEvent {
    match cmd {
        BackendCommand::Add { kind, id, host } => BackendEvent::BackendInstalled {
            kind,
            id,
            hostname: host,
        },
        BackendCommand::Update {
            kind,
            id,
            host,
            fields,
        } => BackendEvent::BackendUpdated {
            kind,
            id,
            hostname: host,
            changed_fields: if fields.is_empty() {
                vec!["hostname".to_string()]
            } else {
                fields
            },
        },
        BackendCommand::Remove { kind, id } => BackendEvent::BackendRemoved { kind, id },
        BackendCommand::List => unreachable!("list does not produce an event"),
    }
}

fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    if let Some(path) = explicit {
        let settings = Settings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        info!(path = %path.display(), "Settings loaded");
        return Ok(settings);
    }

    let default_path = Path::new(DEFAULT_SETTINGS_FILE);
    if default_path.is_file() {
        let settings = Settings::load(default_path)
            .with_context(|| format!("Failed to load settings from {}", DEFAULT_SETTINGS_FILE))?;
        info!(path = DEFAULT_SETTINGS_FILE, "Settings loaded");
        return Ok(settings);
    }

    let settings = match std::env::var_os("ZENHOME") {
        Some(home) => Settings::with_instance_home(PathBuf::from(home)),
        None => Settings::default(),
    };
    info!(
        instance_home = %settings.paths.instance_home.display(),
        "No settings file; using defaults"
    );
    Ok(settings)
}

/// Pull `--config <path>` out of the argument list
fn split_config_flag(args: &[String]) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            match iter.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("{} requires a path", arg),
            }
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((config, rest))
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };

    let command = match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "configure" | "generate" => Command::Configure {
            reload: args[1..].iter().any(|a| a == "--reload"),
        },
        "reload" => Command::Reload,
        "verify" | "test" => Command::Verify,
        "topology" => Command::Topology,
        "servers" => Command::Servers,
        "install-check" => Command::InstallCheck,
        "backend" | "backends" => Command::Backend(parse_backend_command(&args[1..])?),
        "event" => Command::Event {
            source: args.get(1).cloned().unwrap_or_else(|| "-".to_string()),
        },
        "migrate" => match args.get(1).map(String::as_str) {
            Some("remove-port") => Command::RemovePort {
                port: match args.get(2) {
                    Some(raw) => raw
                        .parse()
                        .with_context(|| format!("Invalid port '{}'", raw))?,
                    None => UNUSED_PORT,
                },
            },
            other => bail!("Unknown migration {:?}; expected 'remove-port'", other),
        },
        other => bail!("Unknown command '{}'; run 'webscale help'", other),
    };
    Ok(command)
}

fn parse_backend_command(args: &[String]) -> Result<BackendCommand> {
    let Some(sub) = args.first() else {
        return Ok(BackendCommand::List);
    };

    let kind = || -> Result<BackendKind> {
        let raw = args.get(1).context("Missing backend kind (collector or hub)")?;
        raw.parse().map_err(anyhow::Error::msg)
    };
    let arg = |index: usize, name: &str| -> Result<String> {
        args.get(index)
            .cloned()
            .with_context(|| format!("Missing {}", name))
    };

    let command = match sub.as_str() {
        "add" | "install" => BackendCommand::Add {
            kind: kind()?,
            id: arg(2, "backend id")?,
            host: arg(3, "hostname")?,
        },
        "update" => BackendCommand::Update {
            kind: kind()?,
            id: arg(2, "backend id")?,
            host: arg(3, "hostname")?,
            fields: args.iter().skip(4).cloned().collect(),
        },
        "remove" | "rm" | "delete" => BackendCommand::Remove {
            kind: kind()?,
            id: arg(2, "backend id")?,
        },
        "list" | "ls" => BackendCommand::List,
        other => bail!("Unknown backend command '{}'", other),
    };
    Ok(command)
}

fn print_help() {
    println!(
        r#"webscale - nginx configuration management

USAGE:
    webscale [--config <path>] <command>

COMMANDS:
    configure [--reload]              Render nginx.conf from the template and options
    reload                            Verify (if configured) and reload nginx
    verify                            Run the verify command only
    topology                          Show the proxy endpoint and application server ports
    servers                           List upstream servers in the primary routing file
    install-check                     Exit 2 if enabling the proxy would clash with an
                                      existing multi-instance setup
    backend add <kind> <id> <host>    Route a collector or hub through the proxy
    backend update <kind> <id> <host> [field...]
    backend remove <kind> <id>
    backend list
    event <json|->                    Handle a backend event delivered as JSON
    migrate remove-port [port]        Drop an unused upstream port (default 9090)

Settings are read from --config, then ./webscale.toml, then built-in defaults
rooted at $ZENHOME."#
    );
}
