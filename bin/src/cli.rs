//! Parse from either cli or env var

use std::path::PathBuf;

pub use clap::Parser;
use clap::Subcommand;

use crate::trace::LogFormat;

/// Default channel size for the event queues
pub const DEFAULT_CHANNEL_SIZE: usize = 1_000;
/// Seconds to wait for the cluster to answer before giving up
pub const DEFAULT_ALIVE_TIMEOUT: u64 = 30;
/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "sdn-registry-worker";
/// default log level. Can use this argument or REGISTRY_LOG env var
pub const DEFAULT_REGISTRY_LOG: &str = "info";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "sdn-registry", bin_name = "sdn-registry", about, long_about = None)]
/// parses from cli & environment var. `.env` in the working dir is loaded as well
pub struct Config {
    /// path to the etcd connection config (yaml or json). Built-in defaults
    /// are used when absent
    #[clap(short, long, value_parser, env)]
    pub config_path: Option<PathBuf>,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env, value_parser, default_value = DEFAULT_REGISTRY_LOG)]
    pub registry_log: String,
    /// log output format
    #[clap(long, env, value_enum, default_value_t = LogFormat::Standard)]
    pub log_format: LogFormat,
    /// seconds to wait for a healthy cluster at startup
    #[clap(long, env, value_parser, default_value_t = DEFAULT_ALIVE_TIMEOUT)]
    pub alive_timeout: u64,
    /// capacity of the host and subnet event queues
    #[clap(long, env, value_parser, default_value_t = DEFAULT_CHANNEL_SIZE)]
    pub channel_size: usize,
    /// number of worker threads, defaults to the number of logical CPUs
    #[clap(long, env, value_parser)]
    pub threads: Option<usize>,
    /// Worker thread name
    #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
    pub thread_name: String,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// follow host and subnet changes until ctrl-c
    Watch,
    /// print registered hosts
    Hosts,
    /// print assigned subnets
    Subnets,
    /// write the container network and subnet length
    SetNetwork {
        /// container network in CIDR notation
        #[clap(long, value_parser)]
        network: String,
        /// prefix length of each host subnet
        #[clap(long, value_parser)]
        subnet_length: u32,
    },
    /// print the container network and subnet length
    ShowNetwork,
}
