use std::{env, process::exit};

use args::{ArgumentsRequest, StartupArguments, Verbosity};
use tokio::{
    io::{stdin, stdout},
    net::TcpStream,
    task::LocalSet,
};
use tracing_subscriber::EnvFilter;

mod args;

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'r2tcli --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    init_logging(startup_args.verbosity);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    LocalSet::new().block_on(&runtime, async_main(startup_args));
}

fn init_logging(verbosity: Verbosity) {
    let default_directive = match verbosity {
        Verbosity::Quiet => "warn",
        Verbosity::Normal => "info",
        Verbosity::Verbose => "debug",
        Verbosity::VeryVerbose => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).with_writer(std::io::stderr).init();
}

/// Exits with status 0 on SIGINT/SIGPIPE/SIGUSR1 per spec §6; otherwise returns once the channel
/// transport (stdin/stdout, or `--channel-tcp`) hits EOF.
async fn async_main(startup_args: StartupArguments) {
    tokio::task::spawn_local(watch_for_exit_signals());

    match startup_args.channel_tcp {
        Some(target) => match TcpStream::connect(&target).await {
            Ok(stream) => {
                tracing::info!(target = %target, "channel connected over TCP");
                let (read_half, write_half) = stream.into_split();
                r2t_core::client::run(read_half, write_half, startup_args.controller_bind).await;
            }
            Err(error) => {
                tracing::error!(target = %target, %error, "failed to connect channel");
                exit(1);
            }
        },
        None => {
            tracing::info!("channel attached to stdin/stdout");
            r2t_core::client::run(stdin(), stdout(), startup_args.controller_bind).await;
        }
    }
}

#[cfg(unix)]
async fn watch_for_exit_signals() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigpipe = signal(SignalKind::pipe()).expect("failed to install SIGPIPE handler");
    let mut sigusr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");

    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT, exiting"),
        _ = sigpipe.recv() => tracing::info!("received SIGPIPE, exiting"),
        _ = sigusr1.recv() => tracing::info!("received SIGUSR1, exiting"),
    }
    exit(0);
}

#[cfg(not(unix))]
async fn watch_for_exit_signals() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received Ctrl-C, exiting");
    exit(0);
}
