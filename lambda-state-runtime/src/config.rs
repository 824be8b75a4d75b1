use crate::Error;
use std::env;
use std::time::Duration;

/// The name of the environment variable in the Lambda execution environment
/// holding `host:port` of the Runtime API endpoint.
pub const RUNTIME_ENDPOINT_VAR: &str = "AWS_LAMBDA_RUNTIME_API";

/// Network location of the Runtime API control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address of the control plane.
    pub host: String,
    /// TCP port of the control plane.
    pub port: u16,
}

impl Endpoint {
    /// Parse an endpoint of the form `host:port`, tolerating an `http://`
    /// prefix and a trailing slash as found in some emulator setups.
    pub fn parse(value: &str) -> Result<Self, Error> {
        let value = value.strip_prefix("http://").unwrap_or(value);
        let value = value.trim_end_matches('/');
        if value.is_empty() {
            return Err("runtime API endpoint is empty".into());
        }
        match value.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::from(format!("invalid runtime API port in {value:?}")))?;
                Ok(Endpoint {
                    host: host.to_owned(),
                    port,
                })
            }
            None => Ok(Endpoint {
                host: value.to_owned(),
                port: 80,
            }),
        }
    }
}

/// Process signals that request a graceful shutdown of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// `SIGINT`.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
    /// `SIGHUP`.
    Hangup,
}

/// Runtime configuration.
///
/// The default configuration reads the endpoint from
/// [`AWS_LAMBDA_RUNTIME_API`](RUNTIME_ENDPOINT_VAR) at startup, traps
/// `SIGINT` and `SIGTERM`, and serves invocations until told to stop.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane endpoint. When `None`, the runtime reads
    /// [`RUNTIME_ENDPOINT_VAR`] at startup, falling back to the local
    /// loopback server when the `local` feature is enabled.
    pub endpoint: Option<Endpoint>,
    /// Exit after this many invocations have been acknowledged; `0` means
    /// unbounded.
    pub max_invocations: u64,
    /// Signals that request a graceful shutdown.
    pub stop_signals: Vec<StopSignal>,
    /// Timeout applied to the `/next` long poll. `None` waits forever;
    /// expiry is a transport failure that terminates the runtime.
    pub request_timeout: Option<Duration>,
    /// Log level the runtime installs if no tracing subscriber is set up
    /// yet. `None` defers to `AWS_LAMBDA_LOG_LEVEL` and `RUST_LOG`.
    pub log_level: Option<tracing::Level>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: None,
            max_invocations: 0,
            stop_signals: vec![StopSignal::Interrupt, StopSignal::Terminate],
            request_timeout: None,
            log_level: None,
        }
    }
}

impl Config {
    /// Attempts to read configuration from environment variables.
    pub fn from_env() -> Result<Self, Error> {
        let endpoint = match env::var(RUNTIME_ENDPOINT_VAR) {
            Ok(value) => Some(Endpoint::parse(&value)?),
            Err(_) => None,
        };
        Ok(Config {
            endpoint,
            ..Config::default()
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_host_and_port() {
        let endpoint = Endpoint::parse("127.0.0.1:9001").unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, 9001);
    }

    #[test]
    fn parse_tolerates_scheme_and_trailing_slash() {
        let endpoint = Endpoint::parse("http://localhost:9001/").unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 9001);
    }

    #[test]
    fn parse_defaults_to_port_80() {
        let endpoint = Endpoint::parse("control-plane.internal").unwrap();
        assert_eq!(endpoint.port, 80);
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(Endpoint::parse("localhost:not-a-port").is_err());
        assert!(Endpoint::parse("").is_err());
    }

    #[test]
    fn default_traps_interrupt_and_terminate() {
        let config = Config::default();
        assert_eq!(
            config.stop_signals,
            vec![StopSignal::Interrupt, StopSignal::Terminate]
        );
        assert_eq!(config.max_invocations, 0);
        assert!(config.request_timeout.is_none());
    }
}
