//! Process-level configuration: CLI arguments and tracing setup.

pub mod cli {
    //! Parse from either cli or env var

    /// Default DHCPv4 listen address
    pub static DEFAULT_V4_ADDR: &str = "0.0.0.0:67";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/ember/config.yaml";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "ember-dhcp-worker";
    /// default log level; any RUST_LOG-style directive is accepted
    pub const DEFAULT_EMBER_LOG: &str = "info";

    use std::{net::SocketAddr, path::PathBuf};

    pub use clap::Parser;

    /// parses from cli & environment var
    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "ember", bin_name = "ember", about, long_about = None)]
    pub struct Config {
        /// path to ember's config file
        #[clap(short, long, value_parser, env = "EMBER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        pub config_path: PathBuf,
        /// the v4 address to listen on
        #[clap(long, env = "EMBER_V4_ADDR", value_parser, default_value = DEFAULT_V4_ADDR)]
        pub v4_addr: SocketAddr,
        /// worker thread name
        #[clap(long, env = "EMBER_THREAD_NAME", value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of tokio worker threads; defaults to the logical CPU count
        #[clap(long, env = "EMBER_THREADS", value_parser)]
        pub threads: Option<usize>,
        /// log filter override; takes precedence over the config file's
        /// observability.log_level
        #[clap(long, env = "EMBER_LOG", value_parser, default_value = DEFAULT_EMBER_LOG)]
        pub ember_log: String,
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Log output settings, combined from config file and CLI.
    #[derive(Debug)]
    pub struct Config {
        /// formatting applied to logs: "json", "pretty", or "standard"
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber.
        pub fn init(level: &str, format: &str) -> Result<Self> {
            let filter =
                EnvFilter::try_new(level).or_else(|_| EnvFilter::try_new("info"))?;

            match format {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: format.to_string(),
            })
        }
    }
}
