use anyhow::bail;
use callscope_core::types::{DEFAULT_BIDI_BURST, DEFAULT_SERVER_STREAM_BURST};
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `callscope-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first when present).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "callscope-server",
    version,
    about = "A gRPC endpoint serving unary, client, server, and bidirectional streams"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:8888" or "/tmp/callscope.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8888"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Number of responses a server-streaming call emits for its request.
    ///
    /// Environment variable: `SERVER_STREAM_BURST`
    #[arg(long, env = "SERVER_STREAM_BURST", default_value_t = DEFAULT_SERVER_STREAM_BURST)]
    pub server_stream_burst: usize,

    /// Number of responses a bidirectional call emits per client message.
    ///
    /// Environment variable: `BIDI_BURST`
    #[arg(long, env = "BIDI_BURST", default_value_t = DEFAULT_BIDI_BURST)]
    pub bidi_burst: usize,

    /// Seconds to wait for in-flight calls to finish on shutdown before they
    /// are cancelled.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub server_stream_burst: usize,
    pub bidi_burst: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: String::from("0.0.0.0:8888"),
            uds: false,
            server_stream_burst: DEFAULT_SERVER_STREAM_BURST,
            bidi_burst: DEFAULT_BIDI_BURST,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.server_stream_burst == 0 {
            bail!("SERVER_STREAM_BURST must be greater than 0");
        }

        if args.bidi_burst == 0 {
            bail!("BIDI_BURST must be greater than 0");
        }

        if args.server_addr.is_empty() {
            bail!("SERVER_ADDR must not be empty");
        }

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            server_stream_burst: args.server_stream_burst,
            bidi_burst: args.bidi_burst,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(core::iter::once("callscope-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::try_from(parse(&[])).unwrap();
        assert_eq!(config.server_addr, "0.0.0.0:8888");
        assert!(!config.uds);
        assert_eq!(config.server_stream_burst, 5);
        assert_eq!(config.bidi_burst, 3);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
    }

    #[test]
    fn overrides() {
        let config = ServerConfig::try_from(parse(&[
            "--server-addr",
            "/tmp/callscope.sock",
            "--uds",
            "--server-stream-burst",
            "2",
            "--bidi-burst",
            "7",
        ]))
        .unwrap();
        assert_eq!(config.server_addr, "/tmp/callscope.sock");
        assert!(config.uds);
        assert_eq!(config.server_stream_burst, 2);
        assert_eq!(config.bidi_burst, 7);
    }

    #[test]
    fn zero_bursts_are_rejected() {
        let err = ServerConfig::try_from(parse(&["--bidi-burst", "0"])).unwrap_err();
        assert!(err.to_string().contains("BIDI_BURST"));

        let err = ServerConfig::try_from(parse(&["--server-stream-burst", "0"])).unwrap_err();
        assert!(err.to_string().contains("SERVER_STREAM_BURST"));
    }
}
