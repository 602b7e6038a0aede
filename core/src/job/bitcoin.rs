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

//! Bitcoin stratum jobs: built out of a getblocktemplate result plus the
//! pool's coinbase configuration and any pending merge-mining work, then
//! shipped as JSON over the job topic.

use serde::{Deserialize, Deserializer, Serializer};

use super::merged::{AuxWork, SidechainWork};
use super::{make_job_id, Error};
use crate::consensus::{
	AUX_POW_MAX_AGE, COINBASE_SCRIPT_SIG_MAX_SIZE, COINBASE_TX_MAX_SIZE, EXTRA_NONCE1_SIZE,
	EXTRA_NONCE2_SIZE, EXTRA_NONCE_PLACEHOLDER_BYTE, MERGED_MINING_MAGIC, RSK_BLOCK_TAG,
};
use crate::hash::{sha256d, Hash};
use crate::target::{bits_to_target, U256};
use crate::transaction::{
	push_script_num, serialize_coinbase, txid_from_raw, CoinbaseOutput,
};
use crate::merkle::make_merkle_branch;

/// The extra nonce placeholder spliced into the coinbase template:
/// 4 bytes extraNonce1 + 8 bytes extraNonce2.
const PLACEHOLDER_LEN: usize = EXTRA_NONCE1_SIZE + EXTRA_NONCE2_SIZE;

/// A bitcoin stratum job as serialized onto the job topic. We use a
/// key->value json object so it's easy to update the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StratumJobBitcoin {
	/// Pool-wide job id, see `make_job_id`.
	pub job_id: u64,
	/// Hash of the template this job came from.
	pub gbt_hash: String,
	/// Previous block hash.
	pub prev_hash: Hash,
	/// Previous block hash in the word-swapped form stratum notify wants.
	pub prev_hash_be_str: String,
	/// Template height.
	pub height: i32,
	/// Coinbase transaction bytes before the extra nonce, hex.
	pub coinbase1: String,
	/// Coinbase transaction bytes after the extra nonce, hex.
	pub coinbase2: String,
	/// Merkle branch for the coinbase position.
	#[serde(with = "merkle_branch_hex", default)]
	pub merkle_branch: Vec<Hash>,
	/// Block version miners should use.
	pub n_version: i32,
	/// Compact network target.
	pub n_bits: u32,
	/// Template current time.
	pub n_time: u32,
	/// Earliest time a miner may roll nTime back to.
	pub min_time: u32,
	/// Total coinbase payout in satoshi.
	pub coinbase_value: i64,
	/// Segwit witness commitment, when the template carries one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub witness_commitment: Option<String>,
	/// Aux chain block hash (namecoin style merge mining).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nmc_block_hash: Option<Hash>,
	/// Aux chain compact target.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nmc_bits: Option<u32>,
	/// Aux chain height.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nmc_height: Option<i32>,
	/// Aux chain submit endpoint.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nmc_rpc_addr: Option<String>,
	/// Aux chain submit credentials.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nmc_rpc_userpass: Option<String>,
	/// Sidechain block hash committed in the coinbase tag.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rsk_block_hash_for_merged_mining: Option<String>,
	/// Sidechain network target, hex.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rsk_network_target: Option<String>,
	/// Fees the sidechain pays.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rsk_fees_for_miner: Option<String>,
	/// Sidechain submit endpoint.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rskd_rpc_address: Option<String>,
	/// Sidechain submit credentials.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rskd_rpc_user_pwd: Option<String>,
	/// Whether merge-mining work changed, forcing miners to restart.
	#[serde(default)]
	pub merged_mining_clean: bool,
}

mod merkle_branch_hex {
	use super::*;

	pub fn serialize<S>(branch: &[Hash], serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		let mut s = String::with_capacity(branch.len() * 64);
		for h in branch {
			s.push_str(&h.to_hex());
		}
		serializer.serialize_str(&s)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Hash>, D::Error>
	where
		D: Deserializer<'de>,
	{
		use serde::de::Error as DeError;
		let s = String::deserialize(deserializer)?;
		if s.len() % 64 != 0 {
			return Err(D::Error::custom("merkle branch length not a multiple of 64"));
		}
		(0..s.len() / 64)
			.map(|i| Hash::from_hex(&s[i * 64..(i + 1) * 64]).map_err(D::Error::custom))
			.collect()
	}
}

#[derive(Deserialize)]
struct GbtWrapper {
	result: GbtResult,
}

#[derive(Deserialize)]
struct GbtResult {
	previousblockhash: String,
	height: i32,
	version: u32,
	bits: String,
	curtime: u32,
	mintime: u32,
	coinbasevalue: i64,
	#[serde(default)]
	transactions: Vec<GbtTransaction>,
	#[serde(default)]
	default_witness_commitment: Option<String>,
}

#[derive(Deserialize)]
struct GbtTransaction {
	data: String,
}

/// The few template facts the job maker's cache logic needs, parsed
/// without building a full job.
#[derive(Debug, Copy, Clone)]
pub struct GbtSummary {
	/// Template height.
	pub height: i32,
	/// True when the template carries no transactions beside the
	/// coinbase.
	pub is_empty: bool,
}

impl GbtSummary {
	/// Extract height and emptiness from a decoded gbt json string.
	pub fn parse(gbt_json: &str) -> Result<GbtSummary, Error> {
		let wrapper: GbtWrapper = serde_json::from_str(gbt_json)?;
		Ok(GbtSummary {
			height: wrapper.result.height,
			is_empty: wrapper.result.transactions.is_empty(),
		})
	}
}

impl StratumJobBitcoin {
	/// Build a job from a decoded getblocktemplate response. `aux` and
	/// `sidechain` fold pending merge-mining work into the coinbase;
	/// `merged_mining_clean` marks the job as one miners must restart
	/// for. Aux work older than `AUX_POW_MAX_AGE` is ignored.
	pub fn init_from_gbt(
		gbt_json: &str,
		coinbase_info: &str,
		payout_script: &[u8],
		block_version: u32,
		aux: Option<&AuxWork>,
		sidechain: Option<&SidechainWork>,
		server_id: u8,
		merged_mining_clean: bool,
		now: u64,
	) -> Result<StratumJobBitcoin, Error> {
		let gbt_hash = sha256d(gbt_json.as_bytes());
		let wrapper: GbtWrapper = serde_json::from_str(gbt_json)?;
		let gbt = wrapper.result;

		if gbt.height < 0 || gbt.height == i32::max_value() {
			return Err(Error::HeightOutOfRange(gbt.height));
		}

		let job_id = make_job_id(now, &gbt_hash, server_id);
		let prev_hash = Hash::from_hex(&gbt.previousblockhash).map_err(Error::Hex)?;
		let n_version = if block_version != 0 {
			block_version as i32
		} else {
			gbt.version as i32
		};
		let n_bits = u32::from_str_radix(gbt.bits.trim_start_matches("0x"), 16)
			.map_err(|e| Error::Hex(format!("gbt bits: {}", e)))?;

		// witness commitment must be at least 38 bytes
		let witness_commitment = gbt
			.default_witness_commitment
			.filter(|wc| wc.len() >= 38 * 2);

		let mut txids = Vec::with_capacity(gbt.transactions.len());
		for tx in &gbt.transactions {
			let raw = orepool_util::from_hex(&tx.data).map_err(Error::Hex)?;
			txids.push(txid_from_raw(&raw)?);
		}
		let merkle_branch = make_merkle_branch(&txids);

		let aux = match aux {
			Some(a) if a.created_at_ts + AUX_POW_MAX_AGE < now => {
				warn!(
					"too old aux-pow work, created at {}, now {}",
					a.created_at_ts, now
				);
				None
			}
			other => other,
		};

		let mut job = StratumJobBitcoin {
			job_id,
			gbt_hash: gbt_hash.to_hex(),
			prev_hash,
			prev_hash_be_str: prev_hash_be_str(&prev_hash),
			height: gbt.height,
			coinbase1: String::new(),
			coinbase2: String::new(),
			merkle_branch,
			n_version,
			n_bits,
			n_time: gbt.curtime,
			min_time: gbt.mintime,
			coinbase_value: gbt.coinbasevalue,
			witness_commitment,
			nmc_block_hash: aux.map(|a| a.hash),
			nmc_bits: match aux {
				Some(a) => Some(a.bits_value()?),
				None => None,
			},
			nmc_height: aux.map(|a| a.height),
			nmc_rpc_addr: aux.map(|a| a.rpc_addr.clone()),
			nmc_rpc_userpass: aux.map(|a| a.rpc_userpass.clone()),
			rsk_block_hash_for_merged_mining: sidechain.map(|s| s.block_hash.clone()),
			rsk_network_target: sidechain.map(|s| s.target.clone()),
			rsk_fees_for_miner: sidechain.map(|s| s.fees.clone()),
			rskd_rpc_address: sidechain.map(|s| s.rpc_address.clone()),
			rskd_rpc_user_pwd: sidechain.map(|s| s.rpc_user_pwd.clone()),
			merged_mining_clean,
		};
		job.build_coinbase(coinbase_info, payout_script, aux, sidechain, now)?;
		Ok(job)
	}

	/// Assemble the coinbase transaction and split it into coinbase1 and
	/// coinbase2 around the extra nonce placeholder.
	fn build_coinbase(
		&mut self,
		coinbase_info: &str,
		payout_script: &[u8],
		aux: Option<&AuxWork>,
		sidechain: Option<&SidechainWork>,
		now: u64,
	) -> Result<(), Error> {
		let mut script_sig = Vec::with_capacity(COINBASE_SCRIPT_SIG_MAX_SIZE);

		// block height, BIP34
		push_script_num(&mut script_sig, self.height as u64);

		// current timestamp, so identical merkle roots can't hand two
		// miners the same search space
		push_script_num(&mut script_sig, now);

		// pool's info
		script_sig.extend_from_slice(coinbase_info.as_bytes());

		// aux-pow commitment, 44 bytes:
		// magic | aux block hash | merkle_size | merkle_nonce
		if let Some(aux) = aux {
			script_sig.extend_from_slice(&MERGED_MINING_MAGIC);
			let mut hash_be = aux.hash.to_bytes();
			hash_be.reverse();
			script_sig.extend_from_slice(&hash_be);
			script_sig.extend_from_slice(&aux.merkle_size.to_le_bytes());
			script_sig.extend_from_slice(&aux.merkle_nonce.to_le_bytes());
		}

		// extra nonce placeholder: extraNonce1 + extraNonce2
		let placeholder = [EXTRA_NONCE_PLACEHOLDER_BYTE; PLACEHOLDER_LEN];
		script_sig.extend_from_slice(&placeholder);

		// coinbase scriptSig range is (2, 100) per CheckTransaction
		if script_sig.len() >= COINBASE_SCRIPT_SIG_MAX_SIZE {
			return Err(Error::ScriptSigTooLarge(script_sig.len()));
		}

		let mut outputs = vec![CoinbaseOutput {
			value: self.coinbase_value,
			script_pubkey: payout_script.to_vec(),
		}];

		if let Some(wc) = &self.witness_commitment {
			outputs.push(CoinbaseOutput {
				value: 0,
				script_pubkey: orepool_util::from_hex(wc).map_err(Error::Hex)?,
			});
		}

		if let Some(sidechain) = sidechain {
			let mut script = RSK_BLOCK_TAG.to_vec();
			script.extend_from_slice(
				&orepool_util::from_hex(&sidechain.block_hash).map_err(Error::Hex)?,
			);
			outputs.push(CoinbaseOutput {
				value: 0,
				script_pubkey: script,
			});
		}

		let raw = serialize_coinbase(&script_sig, &outputs);
		if raw.len() >= COINBASE_TX_MAX_SIZE {
			return Err(Error::CoinbaseTooLarge(raw.len()));
		}

		let split = find_placeholder(&raw, &placeholder)
			.expect("placeholder was appended to the scriptSig");
		self.coinbase1 = orepool_util::to_hex(&raw[..split]);
		self.coinbase2 = orepool_util::to_hex(&raw[split + PLACEHOLDER_LEN..]);
		Ok(())
	}

	/// Full 256-bit network target from the compact bits.
	pub fn network_target(&self) -> U256 {
		bits_to_target(self.n_bits)
	}

	/// A job with no transactions beside the coinbase.
	pub fn is_empty_block(&self) -> bool {
		self.merkle_branch.is_empty()
	}

	/// Whether this job carries aux-pow merge mining work.
	pub fn has_aux_work(&self) -> bool {
		self.nmc_block_hash.is_some()
	}
}

/// The previous block hash in the per-word byte-swapped hex form that
/// goes into mining.notify.
fn prev_hash_be_str(prev_hash: &Hash) -> String {
	let bytes = prev_hash.to_bytes();
	let mut s = String::with_capacity(64);
	for chunk in bytes.chunks(4) {
		let mut word = [chunk[0], chunk[1], chunk[2], chunk[3]];
		word.reverse();
		s.push_str(&orepool_util::to_hex(&word));
	}
	s
}

/// Locate the extra nonce placeholder, scanning from the end since the
/// tail is where it was appended.
fn find_placeholder(raw: &[u8], placeholder: &[u8]) -> Option<usize> {
	if raw.len() < placeholder.len() {
		return None;
	}
	(0..=raw.len() - placeholder.len())
		.rev()
		.find(|&i| &raw[i..i + placeholder.len()] == placeholder)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::job::StratumJob;

	const PREV_HASH: &str = "00000000000000000328e9fea9914ad83b7404a838aa66aefb970e5689c2f63d";

	fn gbt_json(n_tx: usize) -> String {
		// one hand-built legacy tx repeated
		let tx = {
			let raw = serialize_coinbase(
				&[0x01, 0x02, 0x03],
				&[CoinbaseOutput {
					value: 1000,
					script_pubkey: vec![0x51],
				}],
			);
			orepool_util::to_hex(&raw)
		};
		let txs: Vec<String> = (0..n_tx).map(|_| format!("{{\"data\":\"{}\"}}", tx)).collect();
		format!(
			"{{\"result\":{{\
			 \"previousblockhash\":\"{}\",\
			 \"height\":680000,\
			 \"version\":536870912,\
			 \"bits\":\"1d00ffff\",\
			 \"curtime\":1620000000,\
			 \"mintime\":1619999000,\
			 \"coinbasevalue\":625000000,\
			 \"transactions\":[{}]\
			 }}}}",
			PREV_HASH,
			txs.join(",")
		)
	}

	fn make_job(n_tx: usize) -> StratumJobBitcoin {
		StratumJobBitcoin::init_from_gbt(
			&gbt_json(n_tx),
			"/orepool/",
			&[0x76, 0xa9, 0x14, 0x00, 0x88, 0xac],
			0,
			None,
			None,
			3,
			false,
			1_620_000_123,
		)
		.unwrap()
	}

	#[test]
	fn coinbase_splits_around_placeholder() {
		let job = make_job(2);
		let cb1 = orepool_util::from_hex(&job.coinbase1).unwrap();
		let cb2 = orepool_util::from_hex(&job.coinbase2).unwrap();
		let mut full = cb1.clone();
		full.extend_from_slice(&[EXTRA_NONCE_PLACEHOLDER_BYTE; PLACEHOLDER_LEN]);
		full.extend_from_slice(&cb2);
		// the placeholder splits at its last occurrence
		assert_eq!(find_placeholder(&full, &[0xEE; 12]), Some(cb1.len()));
		// coinbase_info made it into coinbase1
		assert!(job.coinbase1.contains(&orepool_util::to_hex(b"/orepool/")));
	}

	#[test]
	fn empty_block_detection() {
		assert!(make_job(0).is_empty_block());
		assert!(!make_job(1).is_empty_block());
	}

	#[test]
	fn prev_hash_be_words() {
		let prev = Hash::from_hex(PREV_HASH).unwrap();
		assert_eq!(
			prev_hash_be_str(&prev),
			"89c2f63dfb970e5638aa66ae3b7404a8a9914ad80328e9fe0000000000000000"
		);
	}

	#[test]
	fn job_id_carries_time_and_server() {
		let job = make_job(0);
		assert_eq!(job.job_id >> 32, 1_620_000_123);
		assert_eq!(job.job_id & 0xff, 3);
	}

	#[test]
	fn json_round_trip_plain() {
		let job = make_job(3);
		let json = job.serialize_wire();
		match StratumJob::parse_from_json(&json).unwrap() {
			StratumJob::Bitcoin(parsed) => assert_eq!(parsed, job),
			other => panic!("wrong chain: {:?}", other),
		}
	}

	#[test]
	fn json_round_trip_with_merged_mining() {
		let aux = AuxWork {
			created_at_ts: 1_620_000_100,
			hash: Hash::from_hex(
				"5f2d1bd4f13f5ddf0f964a9e1e28a0d0d1a9162da4b13e422be22e1b09e95b3a",
			)
			.unwrap(),
			merkle_size: 1,
			merkle_nonce: 0,
			height: 560_000,
			bits: "180290c8".to_string(),
			rpc_addr: "http://127.0.0.1:8336".to_string(),
			rpc_userpass: "u:p".to_string(),
		};
		let sidechain = SidechainWork {
			created_at: 1_620_000_100,
			block_hash: "e2b2a23f5a5cb0e33be467af9b0b4e1a".to_string(),
			target: "00000000000000000000000000000000000000000001222212221222122212"
				.to_string(),
			fees: "0".to_string(),
			rpc_address: "http://127.0.0.1:4444".to_string(),
			rpc_user_pwd: "u:p".to_string(),
			notify_flag: true,
		};
		let job = StratumJobBitcoin::init_from_gbt(
			&gbt_json(1),
			"/orepool/",
			&[0x51],
			0x2000_0000,
			Some(&aux),
			Some(&sidechain),
			9,
			true,
			1_620_000_123,
		)
		.unwrap();

		assert!(job.merged_mining_clean);
		assert_eq!(job.n_version, 0x2000_0000);
		// aux commitment sits in coinbase1: magic then the display-order hash
		let magic_hex = orepool_util::to_hex(&MERGED_MINING_MAGIC);
		let expected = format!("{}{}", magic_hex, aux.hash.to_hex());
		assert!(job.coinbase1.contains(&expected));
		// sidechain tag sits in an output in coinbase2
		assert!(job.coinbase2.contains(&orepool_util::to_hex(RSK_BLOCK_TAG)));

		let json = job.serialize_wire();
		match StratumJob::parse_from_json(&json).unwrap() {
			StratumJob::Bitcoin(parsed) => assert_eq!(parsed, job),
			other => panic!("wrong chain: {:?}", other),
		}
	}

	#[test]
	fn stale_aux_work_is_dropped() {
		let aux = AuxWork {
			created_at_ts: 1_619_000_000, // long past
			hash: Hash([1u8; 32]),
			merkle_size: 1,
			merkle_nonce: 0,
			height: 1,
			bits: "180290c8".to_string(),
			rpc_addr: String::new(),
			rpc_userpass: String::new(),
		};
		let job = StratumJobBitcoin::init_from_gbt(
			&gbt_json(0),
			"/orepool/",
			&[0x51],
			0,
			Some(&aux),
			None,
			1,
			false,
			1_620_000_123,
		)
		.unwrap();
		assert!(!job.has_aux_work());
	}

	#[test]
	fn oversized_coinbase_info_rejected() {
		let long_tag = "x".repeat(COINBASE_SCRIPT_SIG_MAX_SIZE);
		let res = StratumJobBitcoin::init_from_gbt(
			&gbt_json(0),
			&long_tag,
			&[0x51],
			0,
			None,
			None,
			1,
			false,
			1_620_000_123,
		);
		match res {
			Err(Error::ScriptSigTooLarge(_)) => (),
			other => panic!("expected scriptSig error, got {:?}", other.map(|_| ())),
		}
	}

	impl StratumJobBitcoin {
		fn serialize_wire(&self) -> String {
			StratumJob::Bitcoin(self.clone()).serialize_to_json()
		}
	}
}
