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

//! The share validation seam. Given a job and the miner's nonce
//! material, a validator recomputes the proof of work and classifies the
//! share against the session and network targets. Validators are pure:
//! deterministic, side-effect free, safe to call from any session task.
//!
//! The SHA256 validator is complete. Ethash is heavy machinery with its
//! own DAG lifecycle, so the ethereum validator delegates the hashing to
//! an `EthashProvider` supplied by the deployment.

use orepool_core::hash::{sha256d, Hash};
use orepool_core::job::{StratumJobBitcoin, StratumJobEth};
use orepool_core::merkle::branch_root;
use orepool_core::target::U256;
use orepool_core::StratumStatus;

/// Seconds a submitted nTime may run ahead of the wall clock.
const MAX_TIME_AHEAD: u32 = 600;

/// Everything a validator needs to judge one share.
pub enum ShareCheck<'a> {
	/// A SHA256-chain share.
	Bitcoin {
		/// Job the share was mined on.
		job: &'a StratumJobBitcoin,
		/// Whether the job was already superseded.
		job_is_stale: bool,
		/// The session's extra nonce.
		extra_nonce1: u32,
		/// The miner's extra nonce.
		extra_nonce2: u64,
		/// Header time the miner chose.
		n_time: u32,
		/// Header nonce.
		nonce: u32,
		/// Rolled version bits, already masked by the session.
		version_bits: u32,
		/// Target the share must meet.
		share_target: U256,
		/// Wall clock, for nTime range checks.
		now: u64,
	},
	/// An ethereum share.
	Eth {
		/// Job the share was mined on.
		job: &'a StratumJobEth,
		/// Whether the job was already superseded.
		job_is_stale: bool,
		/// Full 64-bit nonce, session prefix included.
		nonce: u64,
		/// Target the share must meet.
		share_target: U256,
	},
}

/// Validator verdict plus the artifacts solved-block publication needs.
pub struct CheckResult {
	/// Share classification.
	pub status: StratumStatus,
	/// Recomputed mix hash (ethereum solved shares).
	pub mix_hash: Option<String>,
	/// Serialized 80-byte block header (bitcoin solved shares), hex.
	pub header_hex: Option<String>,
	/// Full coinbase transaction (bitcoin solved shares), hex.
	pub coinbase_hex: Option<String>,
}

impl CheckResult {
	fn status_only(status: StratumStatus) -> CheckResult {
		CheckResult {
			status,
			mix_hash: None,
			header_hex: None,
			coinbase_hex: None,
		}
	}
}

/// The external share validation contract.
pub trait ShareValidator: Send + Sync {
	/// Recompute the proof of work and classify the share.
	fn check_share(&self, check: &ShareCheck<'_>) -> CheckResult;
}

/// Ethash backend the ethereum validator delegates to.
pub trait EthashProvider: Send + Sync {
	/// Compute (mix hash hex, pow value) for the given work.
	fn compute(&self, height: u64, header_hash: &str, nonce: u64) -> (String, U256);
}

/// Complete SHA256-chain validator.
pub struct BitcoinShareValidator;

impl BitcoinShareValidator {
	/// Rebuild the coinbase transaction with the nonces spliced in.
	fn rebuild_coinbase(
		job: &StratumJobBitcoin,
		extra_nonce1: u32,
		extra_nonce2: u64,
	) -> Result<Vec<u8>, String> {
		let mut coinbase = orepool_util::from_hex(&job.coinbase1)?;
		coinbase.extend_from_slice(&extra_nonce1.to_be_bytes());
		coinbase.extend_from_slice(&extra_nonce2.to_be_bytes());
		coinbase.extend_from_slice(&orepool_util::from_hex(&job.coinbase2)?);
		Ok(coinbase)
	}

	/// Serialize the 80-byte block header for this share.
	fn build_header(
		job: &StratumJobBitcoin,
		merkle_root: &Hash,
		n_time: u32,
		nonce: u32,
		version_bits: u32,
	) -> Vec<u8> {
		let version = (job.n_version as u32) | version_bits;
		let mut header = Vec::with_capacity(80);
		header.extend_from_slice(&(version as i32).to_le_bytes());
		header.extend_from_slice(job.prev_hash.as_slice());
		header.extend_from_slice(merkle_root.as_slice());
		header.extend_from_slice(&n_time.to_le_bytes());
		header.extend_from_slice(&job.n_bits.to_le_bytes());
		header.extend_from_slice(&nonce.to_le_bytes());
		header
	}
}

impl ShareValidator for BitcoinShareValidator {
	fn check_share(&self, check: &ShareCheck<'_>) -> CheckResult {
		let (job, job_is_stale, extra_nonce1, extra_nonce2, n_time, nonce, version_bits, share_target, now) =
			match check {
				ShareCheck::Bitcoin {
					job,
					job_is_stale,
					extra_nonce1,
					extra_nonce2,
					n_time,
					nonce,
					version_bits,
					share_target,
					now,
				} => (
					*job,
					*job_is_stale,
					*extra_nonce1,
					*extra_nonce2,
					*n_time,
					*nonce,
					*version_bits,
					*share_target,
					*now,
				),
				_ => return CheckResult::status_only(StratumStatus::IllegalParams),
			};

		if n_time < job.min_time {
			return CheckResult::status_only(StratumStatus::TimeTooOld);
		}
		if u64::from(n_time) > now + u64::from(MAX_TIME_AHEAD) {
			return CheckResult::status_only(StratumStatus::TimeTooNew);
		}

		let coinbase = match Self::rebuild_coinbase(job, extra_nonce1, extra_nonce2) {
			Ok(c) => c,
			Err(e) => {
				debug!("coinbase rebuild failed: {}", e);
				return CheckResult::status_only(StratumStatus::IllegalParams);
			}
		};
		let coinbase_txid = sha256d(&coinbase);
		let merkle_root = branch_root(&coinbase_txid, &job.merkle_branch);

		let header = Self::build_header(job, &merkle_root, n_time, nonce, version_bits);
		let pow = U256::from_little_endian(sha256d(&header).as_slice());

		let status = if pow <= job.network_target() {
			if job_is_stale {
				StratumStatus::SolvedStale
			} else {
				StratumStatus::Solved
			}
		} else if pow <= share_target {
			if job_is_stale {
				StratumStatus::AcceptStale
			} else {
				StratumStatus::Accept
			}
		} else {
			StratumStatus::LowDifficulty
		};

		if status.is_solved() {
			CheckResult {
				status,
				mix_hash: None,
				header_hex: Some(orepool_util::to_hex(&header)),
				coinbase_hex: Some(orepool_util::to_hex(&coinbase)),
			}
		} else {
			CheckResult::status_only(status)
		}
	}
}

/// Ethereum validator generic over the ethash backend.
pub struct EthShareValidator<P: EthashProvider> {
	provider: P,
}

impl<P: EthashProvider> EthShareValidator<P> {
	/// Wrap an ethash backend.
	pub fn new(provider: P) -> EthShareValidator<P> {
		EthShareValidator { provider }
	}
}

impl<P: EthashProvider> ShareValidator for EthShareValidator<P> {
	fn check_share(&self, check: &ShareCheck<'_>) -> CheckResult {
		let (job, job_is_stale, nonce, share_target) = match check {
			ShareCheck::Eth {
				job,
				job_is_stale,
				nonce,
				share_target,
			} => (*job, *job_is_stale, *nonce, *share_target),
			_ => return CheckResult::status_only(StratumStatus::IllegalParams),
		};

		let (mix_hash, pow) = self
			.provider
			.compute(job.height, job.header_hash_plain(), nonce);

		let network_target = match job.network_target() {
			Ok(t) => t,
			Err(_) => return CheckResult::status_only(StratumStatus::IllegalParams),
		};

		let status = if pow <= network_target {
			if job_is_stale {
				StratumStatus::SolvedStale
			} else {
				StratumStatus::Solved
			}
		} else if pow <= share_target {
			if job_is_stale {
				StratumStatus::AcceptStale
			} else {
				StratumStatus::Accept
			}
		} else {
			StratumStatus::LowDifficulty
		};

		CheckResult {
			status,
			mix_hash: Some(mix_hash),
			header_hex: None,
			coinbase_hex: None,
		}
	}
}
