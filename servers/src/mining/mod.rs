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

//! The session engine and everything a session needs: worker identity,
//! per-session local jobs with duplicate detection, the difficulty
//! controller, the job repository and the share pipeline.

use std::collections::{HashSet, VecDeque};

use orepool_core::hash::sha256d;

pub mod agent;
pub mod bitcoin;
pub mod codec;
pub mod difficulty;
pub mod eth;
pub mod pipeline;
pub mod repository;
pub mod server;
pub mod session;
pub mod validator;

/// The worker name used when a miner authorizes with a bare user name.
pub const DEFAULT_WORKER_NAME: &str = "__default__";

/// Authenticated identity of the miner behind a session (or behind one
/// agent sub-session).
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
	/// Pool account id from the authenticator.
	pub user_id: i32,
	/// Stable hash of the worker name.
	pub worker_hash_id: i64,
	/// Account name, the part before the first dot.
	pub user_name: String,
	/// Worker name, the part after the first dot.
	pub worker_name: String,
	/// The name exactly as the miner sent it.
	pub full_name: String,
}

/// Split a `user.worker` name. A missing or empty worker part gets the
/// default worker name; characters stratum cannot carry safely are
/// dropped from the worker part.
pub fn split_worker_name(full_name: &str) -> (String, String) {
	let mut parts = full_name.splitn(2, '.');
	let user = parts.next().unwrap_or("").trim().to_string();
	let worker: String = parts
		.next()
		.unwrap_or("")
		.chars()
		.filter(|c| c.is_ascii_graphic() && *c != '"' && *c != '\\')
		.collect();
	if worker.is_empty() {
		(user, DEFAULT_WORKER_NAME.to_string())
	} else {
		(user, worker)
	}
}

/// Stable 64-bit id for a worker name. Derived from the name bytes so
/// every server instance agrees without coordination.
pub fn worker_hash_id(worker_name: &str) -> i64 {
	let digest = sha256d(worker_name.as_bytes());
	let mut bytes = [0u8; 8];
	bytes.copy_from_slice(&digest.as_slice()[..8]);
	let id = i64::from_le_bytes(bytes);
	// zero is reserved for "no worker"
	if id == 0 {
		1
	} else {
		id
	}
}

/// Strip the `0x<40-hex>.` ethereum address prefix off a full worker
/// name. The rule is strict: exactly 42 characters before the first dot,
/// starting `0x`, otherwise the name passes through unchanged.
pub fn strip_eth_addr_from_full_name(full_name: &str) -> &str {
	match full_name.find('.') {
		Some(42) => {
			let bytes = full_name.as_bytes();
			if bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X') {
				&full_name[43..]
			} else {
				full_name
			}
		}
		_ => full_name,
	}
}

/// Optional server-wide duplicate share filter, for chains whose nonce
/// space spans sessions (ethereum). Typically backed by a bloom filter
/// shared between server instances; the in-session seen-sets stay in
/// force either way.
pub trait DuplicateShareChecker: Send + Sync {
	/// Record one (jobId, nonce) sighting. False means it was already
	/// seen and the share is a duplicate.
	fn add_share(&self, job_id: u64, nonce: u64) -> bool;
}

/// Outcome of the external user authenticator.
pub type AuthResult = Result<(i32, i64), String>;

/// The external account system. `authorize` may block on I/O; sessions
/// call it at a suspension point and hold no locks across it.
#[async_trait::async_trait]
pub trait UserAuthenticator: Send + Sync {
	/// Resolve a worker's credentials to (userId, workerHashId).
	async fn authorize(&self, full_name: &str, password: &str) -> AuthResult;
}

/// An authenticator that admits every well-formed name. The user id is
/// derived from the user name; deployments with a real account system
/// implement `UserAuthenticator` against it instead.
pub struct OpenUserAuthenticator;

#[async_trait::async_trait]
impl UserAuthenticator for OpenUserAuthenticator {
	async fn authorize(&self, full_name: &str, _password: &str) -> AuthResult {
		let (user, worker) = split_worker_name(full_name);
		if user.is_empty() {
			return Err("empty user name".to_string());
		}
		let user_id = (worker_hash_id(&user).unsigned_abs() % i32::max_value() as u64) as i32;
		Ok((user_id.max(1), worker_hash_id(&worker)))
	}
}

/// One nonce tuple a session has already seen within a local job. For
/// ethereum the nonce rides in `extra_nonce2` and the other fields stay
/// zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LocalShare {
	/// Miner-enumerated extra nonce (bitcoin) or full nonce (eth).
	pub extra_nonce2: u64,
	/// Header time the miner chose.
	pub n_time: u32,
	/// Version bits the miner rolled.
	pub version_mask: u32,
}

/// A per-session projection of a pool job: the handle miners submit
/// against, plus the seen-set that catches duplicate shares.
#[derive(Debug)]
pub struct LocalJob {
	/// Pool-wide job id.
	pub job_id: u64,
	/// Rotating one-byte id used on SHA256 chains.
	pub short_job_id: u8,
	/// Plain header hash hex, the submit handle on ethereum.
	pub header_hash: String,
	/// Difficulty the miner was given for this job.
	pub job_difficulty: u64,
	/// Network bits at the time of the notify.
	pub blk_bits: u32,
	seen_shares: HashSet<LocalShare>,
}

impl LocalJob {
	/// New local job with an empty seen-set.
	pub fn new(job_id: u64, short_job_id: u8, job_difficulty: u64, blk_bits: u32) -> LocalJob {
		LocalJob {
			job_id,
			short_job_id,
			header_hash: String::new(),
			job_difficulty,
			blk_bits,
			seen_shares: HashSet::new(),
		}
	}

	/// Record a share tuple. False means the tuple was already seen and
	/// the submit is a duplicate.
	pub fn add_local_share(&mut self, share: LocalShare) -> bool {
		self.seen_shares.insert(share)
	}
}

/// The bounded per-session job window. Oldest jobs rotate out; submits
/// against them come back as "job not found".
#[derive(Debug)]
pub struct LocalJobs {
	jobs: VecDeque<LocalJob>,
	window: usize,
}

impl LocalJobs {
	/// Window keeping the last `window` jobs.
	pub fn new(window: usize) -> LocalJobs {
		LocalJobs {
			jobs: VecDeque::with_capacity(window),
			window: window.max(1),
		}
	}

	/// Push a new job, dropping the oldest beyond the window.
	pub fn push(&mut self, job: LocalJob) {
		while self.jobs.len() >= self.window {
			self.jobs.pop_front();
		}
		self.jobs.push_back(job);
	}

	/// Find by short job id.
	pub fn find_by_short_id(&mut self, short_job_id: u8) -> Option<&mut LocalJob> {
		self.jobs
			.iter_mut()
			.rev()
			.find(|j| j.short_job_id == short_job_id)
	}

	/// Find by header hash (ethereum submits).
	pub fn find_by_header(&mut self, header_hash: &str) -> Option<&mut LocalJob> {
		self.jobs
			.iter_mut()
			.rev()
			.find(|j| j.header_hash == header_hash)
	}

	/// Most recent local job.
	pub fn latest(&self) -> Option<&LocalJob> {
		self.jobs.back()
	}

	/// Number of jobs currently kept.
	pub fn len(&self) -> usize {
		self.jobs.len()
	}

	/// True when no job was pushed yet.
	pub fn is_empty(&self) -> bool {
		self.jobs.is_empty()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn worker_name_splitting() {
		assert_eq!(
			split_worker_name("alice.rig1"),
			("alice".to_string(), "rig1".to_string())
		);
		assert_eq!(
			split_worker_name("alice"),
			("alice".to_string(), DEFAULT_WORKER_NAME.to_string())
		);
		assert_eq!(
			split_worker_name("alice."),
			("alice".to_string(), DEFAULT_WORKER_NAME.to_string())
		);
		// quotes cannot survive into json payloads
		assert_eq!(
			split_worker_name("alice.r\"ig"),
			("alice".to_string(), "rig".to_string())
		);
	}

	#[test]
	fn eth_addr_stripping_rule() {
		assert_eq!(
			strip_eth_addr_from_full_name(
				"0x00d8c82Eb65124Ea3452CaC59B64aCC230AA3482.test.aaa"
			),
			"test.aaa"
		);
		assert_eq!(strip_eth_addr_from_full_name("test.aaa"), "test.aaa");
		// invalid hex length before the dot: unchanged
		assert_eq!(strip_eth_addr_from_full_name("0xZZZ.worker"), "0xZZZ.worker");
		// 42 chars but not 0x-prefixed: unchanged
		assert_eq!(
			strip_eth_addr_from_full_name(
				"ax00d8c82Eb65124Ea3452CaC59B64aCC230AA3482.test"
			),
			"ax00d8c82Eb65124Ea3452CaC59B64aCC230AA3482.test"
		);
	}

	#[test]
	fn worker_hash_id_is_stable_and_nonzero() {
		assert_eq!(worker_hash_id("rig1"), worker_hash_id("rig1"));
		assert_ne!(worker_hash_id("rig1"), worker_hash_id("rig2"));
		assert_ne!(worker_hash_id(""), 0);
	}

	#[test]
	fn local_job_dedup() {
		let mut job = LocalJob::new(1, 0, 16384, 0x1d00ffff);
		let tuple = LocalShare {
			extra_nonce2: 1,
			n_time: 1000,
			version_mask: 0,
		};
		assert!(job.add_local_share(tuple));
		assert!(!job.add_local_share(tuple));
		// any component change makes it a new tuple
		assert!(job.add_local_share(LocalShare {
			extra_nonce2: 1,
			n_time: 1001,
			version_mask: 0,
		}));
	}

	#[test]
	fn local_jobs_rotate_past_window() {
		let mut jobs = LocalJobs::new(3);
		for i in 0..5u8 {
			jobs.push(LocalJob::new(i as u64, i, 1, 0));
		}
		assert_eq!(jobs.len(), 3);
		// 0 and 1 rotated out
		assert!(jobs.find_by_short_id(0).is_none());
		assert!(jobs.find_by_short_id(1).is_none());
		assert!(jobs.find_by_short_id(4).is_some());
	}
}
