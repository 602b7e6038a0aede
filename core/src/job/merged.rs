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

//! Merge-mining work units consumed by the job maker: aux-pow blocks
//! (namecoin style) and sidechain work (RSK style).

use super::Error;
use crate::hash::Hash;

/// One aux-pow block announcement from the aux chain gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxWork {
	/// Gateway-side creation time, unix seconds.
	pub created_at_ts: u64,
	/// Aux block header hash to commit to in the coinbase.
	pub hash: Hash,
	/// Merkle size for the aux commitment (1 unless mining several aux
	/// chains).
	pub merkle_size: i32,
	/// Merkle nonce for the aux commitment.
	pub merkle_nonce: i32,
	/// Aux chain height.
	pub height: i32,
	/// Compact bits of the aux chain target, hex encoded.
	pub bits: String,
	/// RPC endpoint a block submitter should call.
	pub rpc_addr: String,
	/// Credentials for that endpoint.
	pub rpc_userpass: String,
}

impl AuxWork {
	/// Parse an aux-pow gateway message.
	pub fn parse(json: &str) -> Result<AuxWork, Error> {
		Ok(serde_json::from_str(json)?)
	}

	/// Compact bits as a number.
	pub fn bits_value(&self) -> Result<u32, Error> {
		let trimmed = self.bits.trim_start_matches("0x");
		u32::from_str_radix(trimmed, 16).map_err(|e| Error::Hex(format!("aux bits: {}", e)))
	}
}

/// One unit of sidechain work from the sidechain gateway. Kept as a
/// current/previous pair by the job maker so hash changes can be
/// detected.
#[derive(Debug, Clone, PartialEq)]
pub struct SidechainWork {
	/// Gateway-side creation time, unix seconds.
	pub created_at: u64,
	/// Sidechain block hash to commit to in the coinbase tag.
	pub block_hash: String,
	/// Sidechain network target, hex encoded.
	pub target: String,
	/// Fees the sidechain pays for the merged block.
	pub fees: String,
	/// RPC endpoint a block submitter should call.
	pub rpc_address: String,
	/// Credentials for that endpoint.
	pub rpc_user_pwd: String,
	/// Gateway asks for an immediate job update.
	pub notify_flag: bool,
}

impl SidechainWork {
	/// Parse a sidechain getwork message. The gateway format is loose
	/// JSON, so fields are pulled out individually.
	pub fn init_from_gw(json: &str, created_at: u64) -> Result<SidechainWork, Error> {
		let v: serde_json::Value = serde_json::from_str(json)?;
		let field = |name: &str| -> Result<String, Error> {
			v.get(name)
				.and_then(|x| x.as_str())
				.map(|s| s.to_string())
				.ok_or_else(|| Error::Hex(format!("sidechain work missing {}", name)))
		};
		Ok(SidechainWork {
			created_at,
			block_hash: field("blockHashForMergedMining")?,
			target: field("target")?,
			fees: field("feesPaidToMiner")?,
			rpc_address: field("rpcAddress")?,
			rpc_user_pwd: field("rpcUserPwd")?,
			notify_flag: v
				.get("notifyFlag")
				.and_then(|x| x.as_bool())
				.unwrap_or(false),
		})
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn aux_work_parses() {
		let json = r#"{
			"created_at_ts": 1620000000,
			"hash": "5f2d1bd4f13f5ddf0f964a9e1e28a0d0d1a9162da4b13e422be22e1b09e95b3a",
			"merkle_size": 1,
			"merkle_nonce": 0,
			"height": 560000,
			"bits": "180290c8",
			"rpc_addr": "http://127.0.0.1:8336",
			"rpc_userpass": "user:pass"
		}"#;
		let aux = AuxWork::parse(json).unwrap();
		assert_eq!(aux.merkle_size, 1);
		assert_eq!(aux.bits_value().unwrap(), 0x180290c8);
	}

	#[test]
	fn sidechain_work_parses() {
		let json = r#"{
			"blockHashForMergedMining": "0xe2b2a23f5a5cb0e33be467af9b0b4e1a2d3d8a4f",
			"target": "0x00000000000000000000000000000000000000000001222212221222122212",
			"feesPaidToMiner": "0",
			"rpcAddress": "http://127.0.0.1:4444",
			"rpcUserPwd": "user:pass",
			"notifyFlag": true
		}"#;
		let gw = SidechainWork::init_from_gw(json, 1_620_000_000).unwrap();
		assert!(gw.notify_flag);
		assert_eq!(gw.created_at, 1_620_000_000);
	}

	#[test]
	fn sidechain_work_missing_field() {
		assert!(SidechainWork::init_from_gw("{}", 0).is_err());
	}
}
