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

//! Canonical stratum jobs. A job captures everything a miner needs to
//! hash one chain tip; it is immutable once created and shared by
//! reference between the repository and the sessions.

use std::fmt;

use crate::hash::Hash;

pub mod bitcoin;
pub mod eth;
pub mod merged;

pub use self::bitcoin::StratumJobBitcoin;
pub use self::eth::StratumJobEth;
pub use self::merged::{AuxWork, SidechainWork};

/// Errors constructing or parsing jobs.
#[derive(Debug)]
pub enum Error {
	/// Underlying JSON was invalid or missing required fields.
	Json(serde_json::Error),
	/// A hex field failed to decode.
	Hex(String),
	/// The assembled coinbase transaction exceeded the hard cap.
	CoinbaseTooLarge(usize),
	/// The coinbase scriptSig exceeded the consensus cap.
	ScriptSigTooLarge(usize),
	/// A gbt transaction could not be parsed.
	Transaction(crate::transaction::Error),
	/// Template height too large to encode.
	HeightOutOfRange(i32),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Json(e) => write!(f, "job json error: {}", e),
			Error::Hex(e) => write!(f, "job hex field error: {}", e),
			Error::CoinbaseTooLarge(n) => write!(f, "coinbase tx size {} over maximum", n),
			Error::ScriptSigTooLarge(n) => write!(f, "coinbase scriptSig size {} over maximum", n),
			Error::Transaction(e) => write!(f, "gbt transaction error: {:?}", e),
			Error::HeightOutOfRange(h) => write!(f, "template height {} out of range", h),
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Error {
		Error::Json(e)
	}
}

impl From<crate::transaction::Error> for Error {
	fn from(e: crate::transaction::Error) -> Error {
		Error::Transaction(e)
	}
}

/// Compose a job id out of its three components: seconds since epoch in
/// the top 32 bits, 24 bits of template hash fingerprint, and the server
/// id in the low byte. Ids from one server are therefore strictly
/// increasing second over second, and never collide across servers.
pub fn make_job_id(ts: u64, template_hash: &Hash, server_id: u8) -> u64 {
	(ts << 32) | ((template_hash.low_u32() & 0xffff_ff00) as u64) | server_id as u64
}

/// The seconds-since-epoch component of a job id.
pub fn job_id_time(job_id: u64) -> u64 {
	job_id >> 32
}

/// The server id component of a job id.
pub fn job_id_server(job_id: u64) -> u8 {
	(job_id & 0xff) as u8
}

/// A stratum job of whichever chain this pool serves.
#[derive(Debug, Clone, PartialEq)]
pub enum StratumJob {
	/// A bitcoin (SHA256 family) job.
	Bitcoin(StratumJobBitcoin),
	/// An ethereum job.
	Eth(StratumJobEth),
}

impl StratumJob {
	/// Pool-wide job id.
	pub fn job_id(&self) -> u64 {
		match self {
			StratumJob::Bitcoin(j) => j.job_id,
			StratumJob::Eth(j) => j.job_id,
		}
	}

	/// Chain tip height the job mines on.
	pub fn height(&self) -> u64 {
		match self {
			StratumJob::Bitcoin(j) => j.height as u64,
			StratumJob::Eth(j) => j.height,
		}
	}

	/// Serialize for the job topic. One JSON object per job.
	pub fn serialize_to_json(&self) -> String {
		match self {
			StratumJob::Bitcoin(j) => serde_json::to_string(j).expect("job serialization"),
			StratumJob::Eth(j) => serde_json::to_string(j).expect("job serialization"),
		}
	}

	/// Parse a job off the job topic. Ethereum jobs tag themselves with a
	/// "chain" field; everything else is a bitcoin job.
	pub fn parse_from_json(json: &str) -> Result<StratumJob, Error> {
		let peek: serde_json::Value = serde_json::from_str(json)?;
		match peek.get("chain").and_then(|c| c.as_str()) {
			Some("ETH") => Ok(StratumJob::Eth(serde_json::from_str(json)?)),
			_ => Ok(StratumJob::Bitcoin(serde_json::from_str(json)?)),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn job_id_layout() {
		let h = Hash::from_hex("00000000000000000328e9fea9914ad83b7404a838aa66aefb970e5689c2f63d")
			.unwrap();
		let id = make_job_id(0x60d4e2ab, &h, 5);
		assert_eq!(job_id_time(id), 0x60d4e2ab);
		assert_eq!(job_id_server(id), 5);
		// fingerprint keeps bits 8..32 of the low digest word
		assert_eq!((id >> 8) & 0xff_ffff, (h.low_u32() >> 8) as u64);
	}

	#[test]
	fn job_ids_increase_with_time() {
		let h = Hash([7u8; 32]);
		let a = make_job_id(1000, &h, 1);
		let b = make_job_id(1001, &h, 1);
		assert!(b > a);
	}
}
