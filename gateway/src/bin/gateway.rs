use alloy::primitives::{Bytes, B256};
use anyhow::{Context as _, Result};
use clap::Parser;
use gateway::env::load_dotenvy_vars_if_present;
use gateway::provider::CachedProvider;
use gateway::prover::ProverConfig;
use gateway::rollup::{Rollup, SelfConfig, SelfRollup};
use gateway::rpc::retry::{build_http_retry_provider, DEFAULT_UNBATCHABLE};
use gateway_vm::{disassemble, GatewayProgram, GatewayRequest};
use serde::Serialize;
use tracing::info;

use crate::cli::{Cli, Command};

#[path = "gateway/cli.rs"]
mod cli;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProveOutput {
    block: u64,
    state_root: B256,
    exit_code: u8,
    values: Vec<Bytes>,
    proofs: Vec<Bytes>,
    order: Bytes,
    witness: Bytes,
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let input = input.trim();
    hex::decode(input.strip_prefix("0x").unwrap_or(input)).context("input is not valid hex")
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenvy_vars_if_present();
    gateway::tracing::init();

    let args = Cli::parse();
    let prover_config: ProverConfig = args.prover_config.into();

    match args.command {
        Command::Disasm { request, program } => {
            let data = parse_hex(&request)?;
            let disassembly = if program {
                disassemble(GatewayProgram::decode(&data)?.ops(), false)?
            } else {
                disassemble(GatewayRequest::decode(&data)?.ops(), true)?
            };
            println!("{disassembly}");
        }
        Command::Prove {
            request,
            rpc_url,
            block,
            step,
            backoff,
            max_retries,
            max_parallel_requests,
        } => {
            let request = GatewayRequest::decode(&parse_hex(&request)?)?;
            let provider = CachedProvider::new(
                build_http_retry_provider(rpc_url, backoff, max_retries, &DEFAULT_UNBATCHABLE),
                max_parallel_requests,
            );
            let rollup = SelfRollup::new(
                provider,
                SelfConfig {
                    step,
                    prover: prover_config,
                    ..Default::default()
                },
            );
            let commit = match block {
                Some(block) => rollup.fetch_commit(block).await?,
                None => rollup.fetch_latest_commit().await?,
            };
            info!(block = commit.index, state_root = %commit.state_root, "proving");

            let result = commit.prover.execute(&request).await?;
            let proofs = commit.prover.prove(&result.needs).await?;
            let witness = rollup.encode_witness(&commit, &proofs);
            let output = ProveOutput {
                block: commit.index,
                state_root: commit.state_root,
                exit_code: result.exit_code,
                values: result.values,
                proofs: proofs.proofs,
                order: proofs.order,
                witness,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}
