use clap::Args;
use gateway_vm::MachineConfig;

use super::ReadMode;

const HELP_HEADING: &str = "Prover options";

/// Prover and machine limits, settable from the command line or environment.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct CliProverConfig {
    /// Maximum stack depth of a single evaluation frame.
    #[arg(long, env="GATEWAY_MAX_STACK", help_heading = HELP_HEADING, default_value_t = 64)]
    max_stack: usize,
    /// Maximum number of distinct contracts a request may touch.
    #[arg(long, env="GATEWAY_MAX_TARGETS", help_heading = HELP_HEADING, default_value_t = 32)]
    max_targets: usize,
    /// Maximum number of distinct storage proofs per request.
    #[arg(long, env="GATEWAY_MAX_UNIQUE_PROOFS", help_heading = HELP_HEADING, default_value_t = 128)]
    max_unique_proofs: usize,
    /// Maximum storage bytes a request may read.
    #[arg(long, env="GATEWAY_MAX_READ_BYTES", help_heading = HELP_HEADING, default_value_t = 8192)]
    max_read_bytes: usize,
    /// Maximum length of any single value a request builds.
    #[arg(long, env="GATEWAY_MAX_VALUE_BYTES", help_heading = HELP_HEADING, default_value_t = 32_768)]
    max_value_bytes: usize,
    /// Whether evaluation reads plain values or proofs that `prove` reuses.
    #[arg(long, env = "GATEWAY_READ_MODE", help_heading = HELP_HEADING, value_enum, default_value = "values")]
    read_mode: ReadMode,
    /// Number of slots requested per proof call.
    #[arg(long, env="GATEWAY_PROOF_BATCH_SIZE", help_heading = HELP_HEADING, default_value_t = 32)]
    proof_batch_size: usize,
    /// Number of fetches in flight per request.
    #[arg(long, env="GATEWAY_FETCH_CONCURRENCY", help_heading = HELP_HEADING, default_value_t = 16)]
    fetch_concurrency: usize,
    /// Number of account and storage proofs kept in memory.
    #[arg(long, env="GATEWAY_PROOF_CACHE_SIZE", help_heading = HELP_HEADING, default_value_t = 10_000)]
    proof_cache_size: usize,
    /// Lifetime of cached storage values in milliseconds. Unset keeps them
    /// forever, which is only safe for finalized blocks.
    #[arg(long, env = "GATEWAY_STORAGE_TTL_MS", help_heading = HELP_HEADING)]
    storage_ttl_ms: Option<u64>,
}

impl From<CliProverConfig> for super::ProverConfig {
    fn from(cli: CliProverConfig) -> Self {
        Self {
            limits: MachineConfig {
                max_stack: cli.max_stack,
                max_targets: cli.max_targets,
                max_unique_proofs: cli.max_unique_proofs,
                max_read_bytes: cli.max_read_bytes,
                max_value_bytes: cli.max_value_bytes,
            },
            read_mode: cli.read_mode,
            proof_batch_size: cli.proof_batch_size,
            fetch_concurrency: cli.fetch_concurrency,
            proof_cache_size: cli.proof_cache_size,
            storage_ttl_ms: cli.storage_ttl_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::prover::ProverConfig;

    #[derive(Parser)]
    struct Cli {
        #[clap(flatten)]
        config: CliProverConfig,
    }

    #[test]
    fn defaults_match_prover_config() {
        let cli = Cli::parse_from(["gateway"]);
        assert_eq!(ProverConfig::from(cli.config), ProverConfig::default());
    }

    #[test]
    fn flags_reach_the_config() {
        let cli = Cli::parse_from([
            "gateway",
            "--read-mode",
            "proofs",
            "--max-value-bytes",
            "64",
        ]);
        let config = ProverConfig::from(cli.config);
        assert_eq!(config.read_mode, ReadMode::Proofs);
        assert_eq!(config.limits.max_value_bytes, 64);
    }
}
