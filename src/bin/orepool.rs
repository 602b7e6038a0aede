// Copyright 2021 The Orepool Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Main entry point: reads the config, wires the job maker (when
//! configured) to the session engine through the in-process job topic,
//! and serves miners until interrupted.
//!
//! Upstream gateway messages (block templates, aux-pow and sidechain
//! work) arrive as line-delimited JSON on stdin, one object per line,
//! tagged with a `stream` field naming their stream.

use std::fs;
use std::io::BufRead;
use std::sync::Arc;

use clap::{App, Arg};
use log::{error, info, warn};
use tokio::sync::mpsc;

use orepool_servers::common::topics::ChannelTopic;
use orepool_servers::common::stats::ServerStateInfo;
use orepool_servers::common::types::{ChainType, PoolConfig};
use orepool_servers::jobmaker::{
	JobMaker, JobMakerHandlerBitcoin, JobMakerHandlerEth, JobMakerStreams,
};
use orepool_servers::mining::pipeline::SharePipeline;
use orepool_servers::mining::repository::JobRepository;
use orepool_servers::mining::validator::BitcoinShareValidator;
use orepool_servers::mining::OpenUserAuthenticator;
use orepool_servers::StratumServer;
use orepool_util::StopState;

fn load_config(path: Option<&str>) -> Result<PoolConfig, String> {
	match path {
		Some(path) => {
			let text = fs::read_to_string(path)
				.map_err(|e| format!("cannot read config {}: {}", path, e))?;
			toml::from_str(&text).map_err(|e| format!("cannot parse config {}: {}", path, e))
		}
		None => Ok(PoolConfig::default()),
	}
}

/// Fan stdin gateway lines out to the per-stream channels.
fn spawn_stdin_gateway(
	raw_template: mpsc::UnboundedSender<String>,
	aux_work: mpsc::UnboundedSender<String>,
	sidechain_work: mpsc::UnboundedSender<String>,
) {
	std::thread::spawn(move || {
		let stdin = std::io::stdin();
		for line in stdin.lock().lines() {
			let line = match line {
				Ok(l) => l,
				Err(_) => break,
			};
			if line.trim().is_empty() {
				continue;
			}
			let stream = serde_json::from_str::<serde_json::Value>(&line)
				.ok()
				.and_then(|v| v.get("stream").and_then(|s| s.as_str()).map(String::from))
				.unwrap_or_else(|| "rawgbt".to_string());
			let result = match stream.as_str() {
				"auxpow" => aux_work.send(line),
				"sidechain" => sidechain_work.send(line),
				_ => raw_template.send(line),
			};
			if result.is_err() {
				break;
			}
		}
		warn!("gateway stdin closed");
	});
}

fn main() {
	let args = App::new("orepool")
		.version("1.1.0")
		.about("mining pool server: job maker, stratum sessions, share pipeline")
		.arg(
			Arg::with_name("config")
				.short("c")
				.long("config")
				.value_name("FILE")
				.help("Path to the TOML configuration file")
				.takes_value(true),
		)
		.get_matches();

	let config = match load_config(args.value_of("config")) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("{}", e);
			std::process::exit(1);
		}
	};

	orepool_util::init_logger(config.logging.clone());
	info!("orepool starting, chain: {:?}", config.stratum.chain);

	let stop_state = Arc::new(StopState::new());
	{
		let stop_state = stop_state.clone();
		ctrlc::set_handler(move || {
			warn!("interrupt received, shutting down");
			stop_state.stop();
		})
		.expect("set interrupt handler");
	}

	let runtime = tokio::runtime::Runtime::new().expect("build tokio runtime");
	runtime.block_on(async {
		let state = ServerStateInfo::default();

		// the job topic connects the job maker to this server's
		// repository; in multi-instance deployments a durable broker
		// implements TopicPublisher instead
		let (job_topic, job_rx) = ChannelTopic::new("stratum-jobs");
		let (share_topic, mut share_rx) = ChannelTopic::new("shares");
		let (solved_topic, mut solved_rx) = ChannelTopic::new("solved-blocks");

		// drain the produced topics; external consumers attach here
		tokio::spawn(async move { while share_rx.recv().await.is_some() {} });
		tokio::spawn(async move {
			while let Some(msg) = solved_rx.recv().await {
				warn!("solved block: {}", String::from_utf8_lossy(&msg));
			}
		});

		let repository = JobRepository::new(config.stratum.job_expiry_secs, state.clone());
		tokio::spawn(repository.clone().run(job_rx));

		if let Some(jobmaker_config) = config.jobmaker.clone() {
			let (raw_tx, raw_rx) = mpsc::unbounded_channel();
			let (aux_tx, aux_rx) = mpsc::unbounded_channel();
			let (side_tx, side_rx) = mpsc::unbounded_channel();
			spawn_stdin_gateway(raw_tx, aux_tx, side_tx);
			let streams = JobMakerStreams {
				raw_template: raw_rx,
				aux_work: aux_rx,
				sidechain_work: side_rx,
			};
			match jobmaker_config.chain {
				ChainType::Bitcoin => match JobMakerHandlerBitcoin::new(jobmaker_config) {
					Ok(handler) => {
						let maker =
							JobMaker::new(handler, streams, job_topic.clone(), stop_state.clone());
						tokio::spawn(maker.run());
					}
					Err(e) => {
						error!("jobmaker config invalid: {:?}", e);
						std::process::exit(1);
					}
				},
				ChainType::Eth => {
					let handler = JobMakerHandlerEth::new(jobmaker_config);
					let maker =
						JobMaker::new(handler, streams, job_topic.clone(), stop_state.clone());
					tokio::spawn(maker.run());
				}
			}
		} else {
			// without a job maker nothing feeds the topic in-process;
			// deployments consuming a broker topic replace this wiring
			warn!("no jobmaker configured, expecting jobs from an external source");
		}

		let validator = match config.stratum.chain {
			ChainType::Bitcoin => Arc::new(BitcoinShareValidator),
			ChainType::Eth => {
				// ethash needs a DAG-backed provider; deployments link one
				// and construct EthShareValidator with it
				error!("eth serving requires an ethash provider, none is linked");
				std::process::exit(1)
			}
		};

		let pipeline = SharePipeline::new(share_topic, solved_topic, state.clone());
		let server = StratumServer::new(
			config.stratum.clone(),
			repository,
			pipeline,
			validator,
			Arc::new(OpenUserAuthenticator),
			state,
			stop_state.clone(),
		);
		if let Err(e) = server.run().await {
			error!("stratum server failed: {}", e);
		}
	});

	info!("orepool stopped");
}
