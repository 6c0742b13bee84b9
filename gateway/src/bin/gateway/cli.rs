use clap::{Parser, Subcommand, ValueHint};
use gateway::prover::cli::CliProverConfig;
use url::Url;

const RPC_HELP_HEADING: &str = "RPC options";

/// Storage-proof gateway tooling
#[derive(Parser)]
#[command(version, propagate_version = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,

    #[clap(flatten)]
    pub(crate) prover_config: CliProverConfig,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Prints the instructions of a hex-encoded request.
    Disasm {
        /// ABI-encoded request or program, `0x` prefix optional.
        request: String,
        /// Treat the input as a nested program without an output count.
        #[arg(long, default_value_t = false)]
        program: bool,
    },
    /// Evaluates a request against a node and prints its outputs, proofs and
    /// witness as JSON.
    Prove {
        /// ABI-encoded request, `0x` prefix optional.
        request: String,
        /// The node RPC URL.
        #[arg(short = 'u', long, env = "GATEWAY_RPC_URL", value_hint = ValueHint::Url, help_heading = RPC_HELP_HEADING)]
        rpc_url: Url,
        /// Block to prove against. Defaults to the latest block aligned to
        /// `step`.
        #[arg(short = 'b', long, env = "GATEWAY_BLOCK", help_heading = RPC_HELP_HEADING)]
        block: Option<u64>,
        /// Only prove against block numbers divisible by this.
        #[arg(long, env = "GATEWAY_STEP", default_value_t = 1, help_heading = RPC_HELP_HEADING)]
        step: u64,
        /// Backoff in milliseconds for the first retry of a request.
        #[arg(long, env = "GATEWAY_BACKOFF", default_value_t = 250, help_heading = RPC_HELP_HEADING)]
        backoff: u64,
        /// The maximum number of retries per request.
        #[arg(long, env = "GATEWAY_MAX_RETRIES", default_value_t = 8, help_heading = RPC_HELP_HEADING)]
        max_retries: u32,
        /// The maximum number of RPC requests in flight.
        #[arg(long, env = "GATEWAY_MAX_PARALLEL_REQUESTS", default_value_t = gateway::provider::MAX_NUMBER_OF_PARALLEL_REQUESTS, help_heading = RPC_HELP_HEADING)]
        max_parallel_requests: usize,
    },
}
