use std::{fmt, net::SocketAddr};

use r2t_proto::{DEFAULT_CONTROLLER_HOST, DEFAULT_CONTROLLER_PORT};

pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub fn get_help_string() -> &'static str {
    "Usage: r2tcli [options] [bind-host [bind-port]]\n\n\
     Reads the rdp2tcp virtual channel on stdin/stdout and serves a text controller\n\
     (spec §4.7) and per-request SOCKS5/forward/reverse tunnels on bind-host:bind-port.\n\n\
     Options:\n  \
     -v, --verbose       raise log verbosity (repeatable)\n  \
     -q, --quiet         only log warnings and errors\n  \
     --channel-tcp HOST:PORT   dial HOST:PORT for the channel instead of stdin/stdout\n  \
     -V, --version       print version and exit\n  \
     -h, --help          print this help and exit"
}

#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    Help,
    Version,
    Run(StartupArguments),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    VeryVerbose,
}

#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    pub controller_bind: SocketAddr,
    pub channel_tcp: Option<String>,
    pub verbosity: Verbosity,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    InvalidBindHost(String),
    InvalidBindPort(String),
    MissingChannelTcpValue,
    TooManyPositionalArguments(String),
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::InvalidBindHost(host) => write!(f, "Invalid bind host: {host}"),
            Self::InvalidBindPort(port) => write!(f, "Invalid bind port: {port}"),
            Self::MissingChannelTcpValue => write!(f, "Expected HOST:PORT after --channel-tcp"),
            Self::TooManyPositionalArguments(arg) => write!(f, "Unexpected extra argument: {arg}"),
        }
    }
}

pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut bind_host = DEFAULT_CONTROLLER_HOST.to_owned();
    let mut bind_port = DEFAULT_CONTROLLER_PORT;
    let mut channel_tcp = None;
    let mut verbosity = Verbosity::Normal;
    let mut positional = Vec::new();

    // Ignore the first argument, as it's by convention the name of the program
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        } else if arg.eq("-v") || arg.eq_ignore_ascii_case("--verbose") {
            verbosity = if verbosity == Verbosity::Verbose { Verbosity::VeryVerbose } else { Verbosity::Verbose };
        } else if arg.eq("-q") || arg.eq_ignore_ascii_case("--quiet") {
            verbosity = Verbosity::Quiet;
        } else if arg.eq_ignore_ascii_case("--channel-tcp") {
            channel_tcp = Some(args.next().ok_or(ArgumentsError::MissingChannelTcpValue)?);
        } else if arg.starts_with('-') {
            return Err(ArgumentsError::UnknownArgument(arg));
        } else {
            positional.push(arg);
        }
    }

    let mut positional = positional.into_iter();
    if let Some(host) = positional.next() {
        bind_host = host;
    }
    if let Some(port) = positional.next() {
        bind_port = port.parse().map_err(|_| ArgumentsError::InvalidBindPort(port))?;
    }
    if let Some(extra) = positional.next() {
        return Err(ArgumentsError::TooManyPositionalArguments(extra));
    }

    let controller_bind = format!("{bind_host}:{bind_port}")
        .parse()
        .or_else(|_| format!("[{bind_host}]:{bind_port}").parse())
        .map_err(|_| ArgumentsError::InvalidBindHost(bind_host))?;

    Ok(ArgumentsRequest::Run(StartupArguments { controller_bind, channel_tcp, verbosity }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> impl Iterator<Item = String> {
        std::iter::once("r2tcli".to_owned()).chain(s.split_whitespace().map(String::from))
    }

    #[test]
    fn defaults_to_localhost_8477() {
        let ArgumentsRequest::Run(startup) = parse_arguments(args("")).unwrap() else { panic!("expected Run") };
        assert_eq!(startup.controller_bind, "127.0.0.1:8477".parse().unwrap());
        assert_eq!(startup.channel_tcp, None);
        assert_eq!(startup.verbosity, Verbosity::Normal);
    }

    #[test]
    fn accepts_bind_host_and_port() {
        let ArgumentsRequest::Run(startup) = parse_arguments(args("0.0.0.0 9000")).unwrap() else { panic!("expected Run") };
        assert_eq!(startup.controller_bind, "0.0.0.0:9000".parse().unwrap());
    }

    #[test]
    fn repeated_verbose_escalates() {
        let ArgumentsRequest::Run(startup) = parse_arguments(args("-v -v")).unwrap() else { panic!("expected Run") };
        assert_eq!(startup.verbosity, Verbosity::VeryVerbose);
    }

    #[test]
    fn channel_tcp_requires_a_value() {
        assert_eq!(parse_arguments(args("--channel-tcp")).unwrap_err(), ArgumentsError::MissingChannelTcpValue);
    }

    #[test]
    fn rejects_unknown_flag() {
        assert_eq!(parse_arguments(args("--bogus")).unwrap_err(), ArgumentsError::UnknownArgument("--bogus".to_owned()));
    }

    #[test]
    fn version_and_help_short_circuit() {
        assert_eq!(parse_arguments(args("-V")).unwrap(), ArgumentsRequest::Version);
        assert_eq!(parse_arguments(args("-h")).unwrap(), ArgumentsRequest::Help);
    }
}
