use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use agent_backend::backends::{
    Backend, Content, ExecOptions, FileBackend, ReadOptions, RemoveOptions, ScopeConfig,
};
use agent_backend::config::{BackendConfig, Config, LocalConfig, LoggingConfig};
use agent_backend::oplog::TracingOperationsLogger;
use agent_backend::safety::{SafetyPolicy, Verdict};

const DEFAULT_CONFIG_PATH: &str = "config/backend.toml";

fn print_help() {
    println!(
        "\
agent-backend v{}

Run file and shell operations against a bounded agent workspace.

USAGE:
    agent-backend [OPTIONS] <COMMAND> [ARGS...]

COMMANDS:
    exec <cmd>                Run a shell command at the workspace root
    read <path>               Print a file
    write <path> <text>       Write text to a file
    ls [path]                 List a directory
    rm <path> [-r] [-f]       Remove a file or directory
    mkdir <path>              Create a directory (with parents)
    stat <path>               Show file metadata
    check <cmd>               Classify a command without running it

OPTIONS:
    -c, --config <PATH>  TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
                         Without a file, a local backend rooted at the
                         current directory is used.
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, agent_backend=debug,warn)

EXAMPLES:
    agent-backend ls
    agent-backend exec 'cargo --version'
    agent-backend --config ws.toml rm build -r -f
    RUST_LOG=debug agent-backend check 'rm -rf /'",
        env!("CARGO_PKG_VERSION"),
    );
}

struct Cli {
    config_path: Option<String>,
    command: String,
    args: Vec<String>,
}

fn parse_args() -> Result<Option<Cli>> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        // options are only recognized before the command
        if !rest.is_empty() {
            rest.push(arg);
            continue;
        }
        match arg.as_str() {
            "--version" | "-V" => {
                println!("agent-backend v{}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--config" | "-c" => {
                let path = args.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                config_path = Some(path);
            }
            _ => rest.push(arg),
        }
    }

    if rest.is_empty() {
        print_help();
        return Ok(None);
    }
    let command = rest.remove(0);
    Ok(Some(Cli {
        config_path,
        command,
        args: rest,
    }))
}

fn load_config(explicit: Option<&str>) -> Result<Config> {
    match explicit {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(DEFAULT_CONFIG_PATH)
        }
        None => {
            let cwd = std::env::current_dir()?;
            Ok(Config {
                backend: BackendConfig::Local(LocalConfig::new(cwd.to_string_lossy())),
                logging: LoggingConfig::default(),
            })
        }
    }
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing <{name}> argument"))
}

fn print_content(content: Content) {
    match content {
        Content::Text(text) => println!("{text}"),
        Content::Binary(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
    }
}

/// Prints the classifier verdict; needs no backend.
fn check(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("missing <cmd> argument");
    }
    match SafetyPolicy::new().classify(&args.join(" ")) {
        Verdict::Safe => println!("safe"),
        Verdict::Unsafe { category, reason } => println!("unsafe ({category:?}): {reason}"),
    }
    Ok(())
}

async fn run(cli: Cli, config: &Config, backend: &Backend) -> Result<()> {
    let logger = Arc::new(TracingOperationsLogger::new(config.logging.mode));
    let workspace = backend.scope(".", ScopeConfig::default().with_logger(logger))?;
    let args = &cli.args;

    match cli.command.as_str() {
        "exec" => {
            if args.is_empty() {
                bail!("missing <cmd> argument");
            }
            let output = workspace.execute(&args.join(" "), ExecOptions::default()).await?;
            print_content(output);
        }
        "read" => {
            let content = workspace
                .read(arg(args, 0, "path")?, ReadOptions::default())
                .await?;
            print_content(content);
        }
        "write" => {
            let path = arg(args, 0, "path")?;
            let text = arg(args, 1, "text")?;
            workspace.write(path, Content::from(text)).await?;
        }
        "ls" => {
            let path = args.first().map(String::as_str).unwrap_or(".");
            for name in workspace.list(path).await? {
                println!("{name}");
            }
        }
        "rm" => {
            let path = arg(args, 0, "path")?;
            let mut options = RemoveOptions::default();
            for flag in &args[1..] {
                match flag.as_str() {
                    "-r" => options.recursive = true,
                    "-f" => options.force = true,
                    "-rf" | "-fr" => {
                        options.recursive = true;
                        options.force = true;
                    }
                    other => bail!("unknown rm flag: {other}"),
                }
            }
            workspace.remove(path, options).await?;
        }
        "mkdir" => workspace.make_dir(arg(args, 0, "path")?, true).await?,
        "stat" => {
            let stat = workspace.stat(arg(args, 0, "path")?).await?;
            let kind = if stat.is_directory { "directory" } else { "file" };
            println!("type:     {kind}");
            println!("size:     {}", stat.size);
            println!("modified: {}", stat.modified.to_rfc3339());
        }
        other => bail!("unknown command: {other} (see --help)"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(cli) = parse_args()? else {
        return Ok(());
    };

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agent_backend=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.command == "check" {
        return check(&cli.args);
    }

    let config = load_config(cli.config_path.as_deref())?;
    info!("Backend: {}", config.backend.description());
    let backend = Backend::from_config(&config.backend).await?;

    let outcome = run(cli, &config, &backend).await;
    backend.destroy().await?;
    outcome
}
