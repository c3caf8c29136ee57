use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{crate_authors, crate_description, crate_name, crate_version, Arg, ArgAction, Command, ValueHint};
use is_terminal::IsTerminal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

use kude::engine::{Engine, EngineOptions};
use kude::step::container::ContainerRuntime;
use kude::{Error, Result, ENGINE_VERSION};

fn main() -> ExitCode {
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .args([
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count)
                .help("raise the tracing filter; repeatable (-v debug, -vv trace)"),
            Arg::new("inline_builtins")
                .long("inline-builtins")
                .global(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool))
                .default_value("true")
                .help("run built-in steps in-process even when a container dispatch would otherwise be taken"),
            Arg::new("log_format")
                .long("log-format")
                .global(true)
                .value_parser(["pretty", "json"])
                .default_value("pretty")
                .help("structured log encoding for non-interactive output"),
        ])
        .subcommands([
            Command::new("build")
                .about("render a package's pipeline to stdout")
                .arg(
                    Arg::new("dir")
                        .default_value(".")
                        .value_hint(ValueHint::DirPath)
                        .help("package directory containing kude.yaml"),
                ),
            Command::new("version").about("print the engine version"),
        ]);

    let matches = cmd.get_matches();
    if let Err(e) = run(&matches) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(matches: &clap::ArgMatches) -> Result<()> {
    setup_tracing(matches)?;

    match matches.subcommand() {
        Some(("version", _)) => {
            println!("kude {ENGINE_VERSION}");
            Ok(())
        }
        Some(("build", sub)) => {
            let dir: PathBuf = sub.get_one::<String>("dir").expect("has a default").into();
            let inline_builtins = *matches.get_one::<bool>("inline_builtins").expect("has a default");
            let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            rt.block_on(build(dir, inline_builtins))
        }
        _ => unreachable!("clap enforces subcommand_required"),
    }
}

fn setup_tracing(matches: &clap::ArgMatches) -> Result<()> {
    let directive = match matches.get_count("verbose") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directive))?;
    let json = matches.get_one::<String>("log_format").map(String::as_str) == Some("json");
    let pretty = !json && std::io::stderr().is_terminal();

    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(pretty.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .with((!pretty).then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)));
    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}

async fn build(dir: PathBuf, inline_builtins: bool) -> Result<()> {
    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("error reading interrupt signal: {e}");
                return;
            }
            token.cancel();
        });
    }

    let options = EngineOptions {
        inline_builtins,
        runtime: default_runtime(),
        cancellation: token,
    };
    let engine = Engine::new(dir, options)?;

    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    engine.run(&mut lock).await
}

/// default_runtime picks the sandbox backend for container steps: a real
/// Docker Engine connection when the `docker` feature is enabled and a
/// daemon answers, otherwise a backend that only fails non-built-in steps
/// (built-ins keep working via the in-process dispatch path regardless).
fn default_runtime() -> Arc<dyn ContainerRuntime> {
    #[cfg(feature = "docker")]
    {
        match kude::step::container::docker::DockerRuntime::connect_with_defaults() {
            Ok(rt) => return Arc::new(rt),
            Err(e) => {
                warn!(error = %e, "failed connecting to Docker daemon; container steps will fail if invoked");
            }
        }
    }
    Arc::new(kude::step::container::unavailable::UnavailableRuntime)
}
