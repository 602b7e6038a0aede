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

//! Server types: configuration for every component plus the error type
//! wrapping underlying module errors.

use std::convert::From;
use std::io;

use orepool_core::job;
use orepool_util::LoggingConfig;

/// Error type wrapping underlying module errors.
#[derive(Debug)]
pub enum Error {
	/// Error originating from job construction or parsing.
	Job(job::Error),
	/// Error originating from share record serialization.
	Ser(orepool_core::ser::Error),
	/// Error originating from network I/O.
	Io(io::Error),
	/// Error originating from JSON handling.
	Json(serde_json::Error),
	/// Invalid configuration value.
	Config(String),
	/// Session-level protocol violation that forces a disconnect.
	Protocol(String),
}

impl From<job::Error> for Error {
	fn from(e: job::Error) -> Error {
		Error::Job(e)
	}
}

impl From<orepool_core::ser::Error> for Error {
	fn from(e: orepool_core::ser::Error) -> Error {
		Error::Ser(e)
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(e)
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Error {
		Error::Json(e)
	}
}

/// Which chain a server instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainType {
	/// SHA256 chains served over generic stratum.
	Bitcoin,
	/// Ethereum family, served over stratum / ethproxy / nicehash.
	Eth,
}

impl Default for ChainType {
	fn default() -> ChainType {
		ChainType::Bitcoin
	}
}

/// How merge-mining work triggers job updates.
/// Policy 0 disables merge-mining triggers entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergedMiningNotifyPolicy {
	/// Never trigger a job for merge-mining updates.
	Disabled,
	/// Trigger on the gateway's notify flag (sidechain) or a higher aux
	/// height (aux-pow).
	ByNotifyFlag,
	/// Trigger whenever the merge-mined block hash changes.
	ByHashChange,
}

impl Default for MergedMiningNotifyPolicy {
	fn default() -> MergedMiningNotifyPolicy {
		MergedMiningNotifyPolicy::ByNotifyFlag
	}
}

/// Stratum server (session engine) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumConfig {
	/// Address the acceptor binds.
	pub listen_addr: String,
	/// Chain this instance serves.
	pub chain: ChainType,
	/// Server instance id, the low byte of every job id it publishes.
	pub server_id: u8,
	/// Target seconds between shares per miner; the difficulty
	/// controller converges on this.
	pub share_avg_seconds: u32,
	/// Difficulty assigned to fresh sessions.
	pub default_difficulty: u64,
	/// Lower clamp for per-miner difficulty.
	pub min_difficulty: u64,
	/// Upper clamp for per-miner difficulty.
	pub max_difficulty: u64,
	/// BIP310 version bits this pool lets miners roll.
	pub version_mask: u32,
	/// Sessions idle longer than this many seconds are closed.
	pub idle_timeout_secs: u64,
	/// How many local jobs a session keeps before rotating out the
	/// oldest.
	pub local_job_window: usize,
	/// Jobs older than this many seconds fall out of the repository.
	pub job_expiry_secs: u64,
	/// Maximum number of concurrent sessions.
	pub max_sessions: usize,
}

impl Default for StratumConfig {
	fn default() -> StratumConfig {
		StratumConfig {
			listen_addr: "0.0.0.0:3333".to_string(),
			chain: ChainType::Bitcoin,
			server_id: 1,
			share_avg_seconds: 10,
			default_difficulty: 16384,
			min_difficulty: 64,
			max_difficulty: 4_611_686_018_427_387_904, // 2^62
			version_mask: 0x1fff_e000,
			idle_timeout_secs: 600,
			local_job_window: 10,
			job_expiry_secs: 300,
			max_sessions: 50_000,
		}
	}
}

/// Job maker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMakerConfig {
	/// Chain this maker builds jobs for.
	pub chain: ChainType,
	/// Server instance id folded into job ids.
	pub server_id: u8,
	/// Seconds between unconditional job publications.
	pub job_interval_secs: u64,
	/// Seconds a non-empty template stays eligible.
	pub gbt_life_time_secs: u64,
	/// Seconds an empty template stays eligible; strictly shorter than
	/// `gbt_life_time_secs`.
	pub empty_gbt_life_time_secs: u64,
	/// Tag written into the coinbase scriptSig.
	pub coinbase_info: String,
	/// Pool payout scriptPubKey, hex encoded.
	pub payout_script_hex: String,
	/// Fixed block version, or 0 to take the template's.
	pub block_version: u32,
	/// How merge-mining updates trigger new jobs.
	pub merged_mining_notify_policy: MergedMiningNotifyPolicy,
}

impl Default for JobMakerConfig {
	fn default() -> JobMakerConfig {
		JobMakerConfig {
			chain: ChainType::Bitcoin,
			server_id: 1,
			job_interval_secs: 30,
			gbt_life_time_secs: 90,
			empty_gbt_life_time_secs: 15,
			coinbase_info: "/orepool/".to_string(),
			payout_script_hex: String::new(),
			block_version: 0,
			merged_mining_notify_policy: MergedMiningNotifyPolicy::ByNotifyFlag,
		}
	}
}

/// Top-level server configuration as read from the config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolConfig {
	/// Logging setup, None leaves logging untouched.
	pub logging: Option<LoggingConfig>,
	/// Session engine configuration.
	#[serde(default)]
	pub stratum: StratumConfig,
	/// Job maker configuration, absent when this instance only serves
	/// sessions.
	pub jobmaker: Option<JobMakerConfig>,
}

impl JobMakerConfig {
	/// Decode the payout script, failing on malformed hex.
	pub fn payout_script(&self) -> Result<Vec<u8>, Error> {
		if self.payout_script_hex.is_empty() {
			return Err(Error::Config("payout_script_hex is empty".to_string()));
		}
		orepool_util::from_hex(&self.payout_script_hex).map_err(Error::Config)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = StratumConfig::default();
		assert!(cfg.min_difficulty <= cfg.default_difficulty);
		assert!(cfg.default_difficulty <= cfg.max_difficulty);

		let jm = JobMakerConfig::default();
		assert!(jm.empty_gbt_life_time_secs < jm.gbt_life_time_secs);
	}

	#[test]
	fn payout_script_decodes() {
		let mut jm = JobMakerConfig::default();
		assert!(jm.payout_script().is_err());
		jm.payout_script_hex = "76a91400000000000000000000000000000000000000aa88ac".to_string();
		assert_eq!(jm.payout_script().unwrap().len(), 25);
	}
}
