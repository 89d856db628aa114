// src/config.rs
use clap::builder::FalseyValueParser;
use clap::Parser;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 50000;
pub const HEADLESS_ENV: &str = "CVEP_SPELLER_HEADLESS";

/// Startup parameters: `cvep-speller [HOST PORT] [--headless]`.
#[derive(Parser, Clone, Debug, PartialEq, Eq)]
#[command(name = "cvep-speller", about = "c-VEP speller stimulus client")]
pub struct ClientConfig {
    /// Controller address
    #[arg(default_value = DEFAULT_HOST, requires = "port")]
    pub host: String,

    /// Controller port
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Run without a window, presentation calls go to the log
    #[arg(long, env = HEADLESS_ENV, value_parser = FalseyValueParser::new())]
    pub headless: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ClientConfig, clap::Error> {
        ClientConfig::try_parse_from(std::iter::once("cvep-speller").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_without_arguments() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn host_port_and_headless() {
        let config = parse(&["10.0.0.5", "6000", "--headless"]).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 6000);
        assert!(config.headless);
    }

    #[test]
    fn bad_arguments_are_errors() {
        assert!(parse(&["localhost", "port"]).is_err());
        assert!(parse(&["localhost"]).is_err());
        assert!(parse(&["--fullscreen"]).is_err());
        assert!(parse(&["localhost", "70000"]).is_err());
    }
}
