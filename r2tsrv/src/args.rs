use std::fmt;

use r2t_proto::DEFAULT_CHANNEL_NAME;

pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub fn get_help_string() -> &'static str {
    "Usage: r2tsrv [options] [channel-name]\n\n\
     Attaches to the named rdp2tcp virtual channel (default \"rdp2tcp\") and accepts\n\
     forward/reverse/process tunnels requested by the client (spec §4.4, §4.8).\n\n\
     Options:\n  \
     -v, --verbose       raise log verbosity (repeatable)\n  \
     -q, --quiet         only log warnings and errors\n  \
     --channel-tcp HOST:PORT   dial HOST:PORT for the channel instead of the named channel\n  \
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
    pub channel_name: String,
    pub channel_tcp: Option<String>,
    pub verbosity: Verbosity,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    MissingChannelTcpValue,
    TooManyPositionalArguments(String),
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::MissingChannelTcpValue => write!(f, "Expected HOST:PORT after --channel-tcp"),
            Self::TooManyPositionalArguments(arg) => write!(f, "Unexpected extra argument: {arg}"),
        }
    }
}

pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut channel_name = DEFAULT_CHANNEL_NAME.to_owned();
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
    if let Some(name) = positional.next() {
        channel_name = name;
    }
    if let Some(extra) = positional.next() {
        return Err(ArgumentsError::TooManyPositionalArguments(extra));
    }

    Ok(ArgumentsRequest::Run(StartupArguments { channel_name, channel_tcp, verbosity }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> impl Iterator<Item = String> {
        std::iter::once("r2tsrv".to_owned()).chain(s.split_whitespace().map(String::from))
    }

    #[test]
    fn defaults_to_rdp2tcp_channel_name() {
        let ArgumentsRequest::Run(startup) = parse_arguments(args("")).unwrap() else { panic!("expected Run") };
        assert_eq!(startup.channel_name, "rdp2tcp");
        assert_eq!(startup.channel_tcp, None);
    }

    #[test]
    fn accepts_a_custom_channel_name() {
        let ArgumentsRequest::Run(startup) = parse_arguments(args("mychannel")).unwrap() else { panic!("expected Run") };
        assert_eq!(startup.channel_name, "mychannel");
    }

    #[test]
    fn rejects_extra_positional_arguments() {
        assert_eq!(
            parse_arguments(args("mychannel extra")).unwrap_err(),
            ArgumentsError::TooManyPositionalArguments("extra".to_owned())
        );
    }

    #[test]
    fn channel_tcp_requires_a_value() {
        assert_eq!(parse_arguments(args("--channel-tcp")).unwrap_err(), ArgumentsError::MissingChannelTcpValue);
    }
}
