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

//! The per-server job index. Consumes the job topic, keeps every live
//! job addressable by id for late share validation, tracks the latest
//! job, and fans new jobs out to the sessions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::common::stats::ServerStateInfo;
use crate::common::unix_now;
use orepool_core::job::{job_id_time, StratumJob};
use orepool_util::RwLock;

/// Capacity of the job broadcast channel. Sessions that lag further than
/// this fall back to fetching the latest job, which is the coalescing
/// the backpressure rules ask for.
const JOB_BROADCAST_CAPACITY: usize = 16;

/// A stratum job wrapped with its distribution state. `state` only ever
/// moves active -> stale.
pub struct StratumJobEx {
	/// The immutable job, shared with every session that mined it.
	pub job: Arc<StratumJob>,
	/// Miners must drop earlier work when they see this job.
	pub is_clean: bool,
	stale: AtomicBool,
}

impl StratumJobEx {
	/// Wrap a freshly received job.
	pub fn new(job: StratumJob, is_clean: bool) -> StratumJobEx {
		StratumJobEx {
			job: Arc::new(job),
			is_clean,
			stale: AtomicBool::new(false),
		}
	}

	/// Whether a newer job has replaced this one.
	pub fn is_stale(&self) -> bool {
		self.stale.load(Ordering::Relaxed)
	}

	fn mark_stale(&self) {
		self.stale.store(true, Ordering::Relaxed);
	}
}

/// In-memory index of live jobs for one server instance.
pub struct JobRepository {
	jobs: RwLock<BTreeMap<u64, Arc<StratumJobEx>>>,
	latest: RwLock<Option<Arc<StratumJobEx>>>,
	broadcaster: broadcast::Sender<Arc<StratumJobEx>>,
	state: ServerStateInfo,
	/// seconds a superseded job stays resolvable
	expiry_secs: u64,
}

impl JobRepository {
	/// Empty repository.
	pub fn new(expiry_secs: u64, state: ServerStateInfo) -> Arc<JobRepository> {
		let (broadcaster, _) = broadcast::channel(JOB_BROADCAST_CAPACITY);
		Arc::new(JobRepository {
			jobs: RwLock::new(BTreeMap::new()),
			latest: RwLock::new(None),
			broadcaster,
			state,
			expiry_secs,
		})
	}

	/// Subscribe to job announcements. Each session holds one receiver.
	pub fn subscribe(&self) -> broadcast::Receiver<Arc<StratumJobEx>> {
		self.broadcaster.subscribe()
	}

	/// The current latest job, if any arrived yet.
	pub fn latest_job(&self) -> Option<Arc<StratumJobEx>> {
		self.latest.read().clone()
	}

	/// Look a job up by id; late shares validate against this.
	pub fn get_job(&self, job_id: u64) -> Option<Arc<StratumJobEx>> {
		self.jobs.read().get(&job_id).cloned()
	}

	/// Number of jobs currently indexed.
	pub fn len(&self) -> usize {
		self.jobs.read().len()
	}

	/// Whether no job arrived yet.
	pub fn is_empty(&self) -> bool {
		self.jobs.read().is_empty()
	}

	/// Digest one message off the job topic.
	pub fn on_job_message(&self, payload: &[u8], now: u64) {
		let text = match std::str::from_utf8(payload) {
			Ok(t) => t,
			Err(_) => {
				error!("job topic message is not utf-8, dropping");
				return;
			}
		};
		let job = match StratumJob::parse_from_json(text) {
			Ok(j) => j,
			Err(e) => {
				error!("parse job topic message fail: {}", e);
				return;
			}
		};
		self.accept_job(job, now);
	}

	/// Index a parsed job, mark the previous latest stale, and fan out.
	pub fn accept_job(&self, job: StratumJob, now: u64) {
		let job_id = job.job_id();
		{
			let jobs = self.jobs.read();
			if jobs.contains_key(&job_id) {
				warn!("duplicate job on topic, jobId: {}", job_id);
				return;
			}
		}

		// a clean job is one that moves the chain tip (or forces a
		// merge-mining restart): miners must abandon earlier work
		let previous = self.latest.read().clone();
		let is_clean = match (&previous, &job) {
			(None, _) => true,
			(Some(prev), StratumJob::Bitcoin(j)) => {
				let prev_changed = match prev.job.as_ref() {
					StratumJob::Bitcoin(p) => p.prev_hash != j.prev_hash,
					_ => true,
				};
				prev_changed || j.merged_mining_clean
			}
			(Some(prev), StratumJob::Eth(j)) => prev.job.height() != j.height,
		};

		let exjob = Arc::new(StratumJobEx::new(job, is_clean));

		{
			let mut jobs = self.jobs.write();
			if let Some(prev) = &previous {
				prev.mark_stale();
			}
			jobs.insert(job_id, exjob.clone());
			// expire superseded jobs past the grace window, keeping the
			// fresh one regardless
			let horizon = now.saturating_sub(self.expiry_secs);
			jobs.retain(|&id, _| id == job_id || job_id_time(id) >= horizon);
		}
		*self.latest.write() = Some(exjob.clone());

		{
			let mut stats = self.state.stratum_stats.write();
			stats.block_height = exjob.job.height();
			if let StratumJob::Bitcoin(j) = exjob.job.as_ref() {
				stats.network_difficulty =
					orepool_core::target::target_to_diff(&j.network_target());
			} else if let StratumJob::Eth(j) = exjob.job.as_ref() {
				stats.network_difficulty = j.network_diff();
			}
		}

		info!(
			"received new job, jobId: {}, height: {}, isClean: {}",
			job_id,
			exjob.job.height(),
			is_clean
		);
		// no receivers is fine; sessions may come later
		let _ = self.broadcaster.send(exjob);
	}

	/// Drain the job topic until it closes.
	pub async fn run(self: Arc<Self>, mut job_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
		while let Some(payload) = job_rx.recv().await {
			self.on_job_message(&payload, unix_now());
		}
		info!("job topic consumer stopped");
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use orepool_core::job::StratumJobEth;

	fn eth_job(job_id_ts: u64, height: u64) -> StratumJob {
		StratumJob::Eth(StratumJobEth {
			job_id: job_id_ts << 32 | 1,
			chain: "ETH".to_string(),
			height,
			header_hash: format!("0x{:064x}", height),
			seed_hash: format!("0x{:064x}", 7u64),
			network_target: format!("{:064x}", u64::max_value()),
		})
	}

	#[test]
	fn tracks_latest_and_marks_stale() {
		let repo = JobRepository::new(300, ServerStateInfo::default());
		repo.accept_job(eth_job(1000, 100), 1000);
		let first = repo.latest_job().unwrap();
		assert!(first.is_clean);
		assert!(!first.is_stale());

		repo.accept_job(eth_job(1001, 101), 1001);
		let second = repo.latest_job().unwrap();
		assert!(second.is_clean);
		assert!(first.is_stale());
		assert!(!second.is_stale());

		// the stale job remains resolvable for late shares
		assert!(repo.get_job(first.job.job_id()).is_some());
	}

	#[test]
	fn same_height_is_not_clean_for_eth() {
		let repo = JobRepository::new(300, ServerStateInfo::default());
		repo.accept_job(eth_job(1000, 100), 1000);
		repo.accept_job(eth_job(1001, 100), 1001);
		assert!(!repo.latest_job().unwrap().is_clean);
	}

	#[test]
	fn duplicate_job_id_ignored() {
		let repo = JobRepository::new(300, ServerStateInfo::default());
		repo.accept_job(eth_job(1000, 100), 1000);
		repo.accept_job(eth_job(1000, 100), 1000);
		assert_eq!(repo.len(), 1);
	}

	#[test]
	fn old_jobs_expire_but_latest_survives() {
		let repo = JobRepository::new(300, ServerStateInfo::default());
		repo.accept_job(eth_job(1000, 100), 1000);
		// much later a new job arrives; the old one is past grace
		repo.accept_job(eth_job(2000, 101), 2000);
		assert_eq!(repo.len(), 1);
		assert_eq!(repo.latest_job().unwrap().job.height(), 101);
	}

	#[test]
	fn malformed_topic_payloads_dropped() {
		let repo = JobRepository::new(300, ServerStateInfo::default());
		repo.on_job_message(b"\xff\xfe", 1000);
		repo.on_job_message(b"not json", 1000);
		assert!(repo.is_empty());
	}

	#[tokio::test]
	async fn broadcast_reaches_subscribers() {
		let repo = JobRepository::new(300, ServerStateInfo::default());
		let mut rx = repo.subscribe();
		repo.accept_job(eth_job(1000, 100), 1000);
		let job = rx.recv().await.unwrap();
		assert_eq!(job.job.height(), 100);
	}
}
