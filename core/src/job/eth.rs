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

//! Ethereum stratum jobs. Far simpler than their bitcoin counterpart:
//! the gateway hands us finished header work, so a job is little more
//! than the hashes and the network target.

use super::{make_job_id, Error};
use crate::hash::sha256d;
use crate::target::{eth_target_to_diff, target_from_hex, U256};

/// An ethereum stratum job as serialized onto the job topic. The "chain"
/// tag distinguishes these from bitcoin jobs on the shared topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StratumJobEth {
	/// Pool-wide job id, see `make_job_id`.
	pub job_id: u64,
	/// Always "ETH".
	pub chain: String,
	/// Block height of the work.
	pub height: u64,
	/// Header pow hash, 0x-prefixed hex.
	pub header_hash: String,
	/// Epoch seed hash, 0x-prefixed hex.
	pub seed_hash: String,
	/// Network target, hex.
	pub network_target: String,
}

#[derive(Deserialize)]
struct EthGetWork {
	height: u64,
	header: String,
	seed: String,
	target: String,
}

impl StratumJobEth {
	/// Build a job from a gateway getwork message carrying header, seed,
	/// target and height.
	pub fn init_from_gw(gw_json: &str, server_id: u8, now: u64) -> Result<StratumJobEth, Error> {
		let gw: EthGetWork = serde_json::from_str(gw_json)?;
		// the header hash doubles as the template fingerprint
		let fingerprint = sha256d(gw.header.as_bytes());
		Ok(StratumJobEth {
			job_id: make_job_id(now, &fingerprint, server_id),
			chain: "ETH".to_string(),
			height: gw.height,
			header_hash: gw.header,
			seed_hash: gw.seed,
			network_target: gw.target,
		})
	}

	/// Network target as a 256-bit integer.
	pub fn network_target(&self) -> Result<U256, Error> {
		target_from_hex(&self.network_target).map_err(Error::Hex)
	}

	/// Network difficulty implied by the target.
	pub fn network_diff(&self) -> u64 {
		match self.network_target() {
			Ok(t) => eth_target_to_diff(&t),
			Err(_) => 0,
		}
	}

	/// Header hash without the 0x prefix, as notify lines want it.
	pub fn header_hash_plain(&self) -> &str {
		strip_0x(&self.header_hash)
	}

	/// Seed hash without the 0x prefix.
	pub fn seed_hash_plain(&self) -> &str {
		strip_0x(&self.seed_hash)
	}

	/// First 8 bytes of the header hash as a u64, the duplicate-share
	/// fingerprint.
	pub fn header_hash_prefix(&self) -> u64 {
		header_prefix(&self.header_hash).unwrap_or(0)
	}
}

/// Strip a 0x/0X prefix if present.
pub fn strip_0x(s: &str) -> &str {
	if s.starts_with("0x") || s.starts_with("0X") {
		&s[2..]
	} else {
		s
	}
}

/// Parse the first 8 bytes of a 0x-prefixed hash into a u64.
pub fn header_prefix(header: &str) -> Option<u64> {
	let plain = strip_0x(header);
	if plain.len() < 16 {
		return None;
	}
	u64::from_str_radix(&plain[..16], 16).ok()
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::job::StratumJob;

	const HEADER: &str = "0xae778d304393d441bf8e1c47237261675caa3827997f671d8e5ec3bd5d862503";
	const SEED: &str = "0xa8784097a4d03c2d2ac6a3a2beebd0606aa30a8536a700446b40800841c0162c";

	fn gw_json() -> String {
		format!(
			"{{\"height\":12000000,\"header\":\"{}\",\"seed\":\"{}\",\
			 \"target\":\"0x0000000112e0be826d694b2e62d01511f12a6061fbaec8bc02357593e70e52ba\"}}",
			HEADER, SEED
		)
	}

	#[test]
	fn init_from_gw_and_round_trip() {
		let job = StratumJobEth::init_from_gw(&gw_json(), 7, 1_620_000_000).unwrap();
		assert_eq!(job.height, 12_000_000);
		assert_eq!(job.job_id & 0xff, 7);
		assert_eq!(job.header_hash_plain().len(), 64);

		let json = StratumJob::Eth(job.clone()).serialize_to_json();
		match StratumJob::parse_from_json(&json).unwrap() {
			StratumJob::Eth(parsed) => assert_eq!(parsed, job),
			other => panic!("wrong chain: {:?}", other),
		}
	}

	#[test]
	fn header_prefix_parses() {
		assert_eq!(header_prefix(HEADER), Some(0xae77_8d30_4393_d441));
		assert_eq!(header_prefix("0x123"), None);
	}

	#[test]
	fn network_diff_from_target() {
		let job = StratumJobEth::init_from_gw(&gw_json(), 1, 0).unwrap();
		assert!(job.network_diff() > 0);
	}
}
