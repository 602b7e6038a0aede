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

//! Server stat collection types, to be used by tests, logging or a
//! status endpoint to collect information about server health, plus the
//! per-worker sliding-window share counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use orepool_core::share::IpAddress;
use orepool_core::{Share, WorkerKey};
use orepool_util::RwLock;

/// Seconds of history the worker windows keep.
pub const STATS_SLIDING_WINDOW_SECONDS: u64 = 3600;

/// A sliding window of counters bucketed by a fixed time unit. Inserts
/// for a time older than the window are dropped; advancing the window
/// strictly zeroes the buckets it rotates past.
#[derive(Debug, Clone)]
pub struct StatsWindow {
	buckets: Vec<u64>,
	/// seconds per bucket
	time_unit: u64,
	/// most recent bucket index ever touched, in time units
	max_idx: i64,
}

impl StatsWindow {
	/// A window of `size` buckets, each covering `time_unit` seconds.
	pub fn new(size: usize, time_unit: u64) -> StatsWindow {
		StatsWindow {
			buckets: vec![0; size],
			time_unit,
			max_idx: -1,
		}
	}

	fn advance(&mut self, idx: i64) {
		if self.max_idx < 0 {
			self.max_idx = idx;
			return;
		}
		let steps = idx - self.max_idx;
		if steps <= 0 {
			return;
		}
		let len = self.buckets.len() as i64;
		// rotating further than the window clears everything
		for i in 0..steps.min(len) {
			let slot = ((idx - i).rem_euclid(len)) as usize;
			self.buckets[slot] = 0;
		}
		self.max_idx = idx;
	}

	/// Add `value` into the bucket covering `time` (unix seconds).
	/// Returns false when the time already rotated out of the window.
	pub fn insert(&mut self, time: u64, value: u64) -> bool {
		let idx = (time / self.time_unit) as i64;
		if self.max_idx >= 0 && idx + (self.buckets.len() as i64) <= self.max_idx {
			return false;
		}
		self.advance(idx);
		let len = self.buckets.len() as i64;
		let slot = (idx.rem_euclid(len)) as usize;
		self.buckets[slot] += value;
		true
	}

	/// Sum of the `len` most recent buckets as of `time`.
	pub fn sum_range(&mut self, time: u64, len: usize) -> u64 {
		let idx = (time / self.time_unit) as i64;
		self.advance(idx);
		let size = self.buckets.len() as i64;
		let len = (len as i64).min(size);
		let mut total = 0;
		for i in 0..len {
			let slot = ((idx - i).rem_euclid(size)) as usize;
			total += self.buckets[slot];
		}
		total
	}

	/// Sum of the whole window as of `time`.
	pub fn sum(&mut self, time: u64) -> u64 {
		let len = self.buckets.len();
		self.sum_range(time, len)
	}
}

/// Snapshot of a worker's counters, merged over its machines.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatus {
	/// Accepted shares (difficulty-weighted) over the last hour.
	pub accept_1h: u64,
	/// Rejected shares (difficulty-weighted) over the last hour.
	pub reject_1h: u64,
	/// Accepted shares over the last 5 minutes.
	pub accept_5m: u64,
	/// Accepted shares over the last minute.
	pub accept_1m: u64,
	/// Total accepted share count since connect.
	pub accept_count: u32,
	/// Source of the last share.
	pub last_share_ip: String,
	/// Time of the last share, unix seconds.
	pub last_share_time: u64,
}

/// Per-worker sliding-window counters. Some miners run the same user and
/// worker name on different machines; they fold into one entry keyed by
/// (userId, workerHashId).
pub struct WorkerShares {
	worker_key: WorkerKey,
	accept_count: u32,
	last_share_ip: IpAddress,
	last_share_time: u64,
	/// accepted difficulty per second over the last hour
	accept_share_sec: StatsWindow,
	/// rejected difficulty per minute over the last hour
	reject_share_min: StatsWindow,
}

impl WorkerShares {
	/// Fresh counters for a worker.
	pub fn new(worker_key: WorkerKey) -> WorkerShares {
		WorkerShares {
			worker_key,
			accept_count: 0,
			last_share_ip: IpAddress::default(),
			last_share_time: 0,
			accept_share_sec: StatsWindow::new(STATS_SLIDING_WINDOW_SECONDS as usize, 1),
			reject_share_min: StatsWindow::new(60, 60),
		}
	}

	/// Fold one share into the windows.
	pub fn process_share(&mut self, share: &Share) {
		let now = share.timestamp();
		if share.status().is_accepted() {
			self.accept_count += 1;
			self.accept_share_sec.insert(now, share.share_diff());
		} else {
			self.reject_share_min.insert(now, share.share_diff());
		}
		self.last_share_ip = share.ip();
		self.last_share_time = now;
	}

	/// Snapshot the counters as of `now`.
	pub fn worker_status(&mut self, now: u64) -> WorkerStatus {
		WorkerStatus {
			accept_1h: self.accept_share_sec.sum(now),
			reject_1h: self.reject_share_min.sum(now),
			accept_5m: self.accept_share_sec.sum_range(now, 300),
			accept_1m: self.accept_share_sec.sum_range(now, 60),
			accept_count: self.accept_count,
			last_share_ip: self.last_share_ip.to_string(),
			last_share_time: self.last_share_time,
		}
	}

	/// Worker identity these counters belong to.
	pub fn worker_key(&self) -> WorkerKey {
		self.worker_key
	}

	/// Whether the worker went quiet for a full window.
	pub fn is_expired(&self, now: u64) -> bool {
		self.last_share_time + STATS_SLIDING_WINDOW_SECONDS < now
	}
}

/// Struct to return relevant information about the stratum server.
#[derive(Debug, Clone, Serialize)]
pub struct StratumStats {
	/// whether the server is currently accepting connections
	pub is_running: bool,
	/// number of connected sessions
	pub num_sessions: usize,
	/// number of authenticated sessions
	pub num_authenticated: usize,
	/// what block height we're mining at
	pub block_height: u64,
	/// current network difficulty we're working on
	pub network_difficulty: u64,
	/// when the server came up
	pub started_at: SystemTime,
}

impl Default for StratumStats {
	fn default() -> StratumStats {
		StratumStats {
			is_running: false,
			num_sessions: 0,
			num_authenticated: 0,
			block_height: 0,
			network_difficulty: 0,
			started_at: SystemTime::now(),
		}
	}
}

/// Server state info collection struct, to be passed around into
/// internals and populated when required.
#[derive(Clone)]
pub struct ServerStateInfo {
	/// Stratum stats
	pub stratum_stats: Arc<RwLock<StratumStats>>,
	/// Live per-worker counters
	pub worker_shares: Arc<RwLock<HashMap<WorkerKey, WorkerShares>>>,
}

impl Default for ServerStateInfo {
	fn default() -> ServerStateInfo {
		ServerStateInfo {
			stratum_stats: Arc::new(RwLock::new(StratumStats::default())),
			worker_shares: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl ServerStateInfo {
	/// Fold a share into the worker table, creating the entry on first
	/// sight.
	pub fn process_share(&self, share: &Share) {
		let key = share.worker_key();
		let mut table = self.worker_shares.write();
		table
			.entry(key)
			.or_insert_with(|| WorkerShares::new(key))
			.process_share(share);
	}

	/// Drop workers that have been quiet for a full window.
	pub fn remove_expired_workers(&self, now: u64) {
		let mut table = self.worker_shares.write();
		table.retain(|_, w| !w.is_expired(now));
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use orepool_core::share::{ShareBitcoin, BITCOIN_SHARE_VERSION};
	use orepool_core::StratumStatus;

	#[test]
	fn window_accumulates_and_rotates() {
		let mut w = StatsWindow::new(60, 1);
		assert!(w.insert(1000, 5));
		assert!(w.insert(1001, 7));
		assert_eq!(w.sum(1001), 12);
		// rotating past the window drops the old buckets
		assert_eq!(w.sum(1075), 0);
		// inserting into the distant past is refused
		assert!(!w.insert(1000, 1));
	}

	#[test]
	fn window_rotation_is_strict() {
		let mut w = StatsWindow::new(10, 1);
		w.insert(100, 1);
		w.insert(105, 2);
		// bucket at 100 still visible from 105 (6 most recent buckets)
		assert_eq!(w.sum_range(105, 6), 3);
		// but not from 110
		assert_eq!(w.sum_range(110, 6), 2);
	}

	#[test]
	fn worker_shares_classify_by_status() {
		fn share(status: StratumStatus, ts: u64) -> Share {
			Share::Bitcoin(ShareBitcoin {
				version: BITCOIN_SHARE_VERSION,
				job_id: 1,
				worker_hash_id: 11,
				user_id: 3,
				status,
				timestamp: ts,
				ip: IpAddress::default(),
				share_diff: 100,
				blk_bits: 0x1d00ffff,
				height: 1,
				nonce: 0,
				session_id: 0,
				extra_nonce2: 0,
				n_time: 0,
				version_mask: 0,
			})
		}

		let key = WorkerKey {
			user_id: 3,
			worker_hash_id: 11,
		};
		let mut ws = WorkerShares::new(key);
		ws.process_share(&share(StratumStatus::Accept, 5000));
		ws.process_share(&share(StratumStatus::Solved, 5001));
		ws.process_share(&share(StratumStatus::LowDifficulty, 5002));

		let status = ws.worker_status(5002);
		assert_eq!(status.accept_1h, 200);
		assert_eq!(status.reject_1h, 100);
		assert_eq!(status.accept_count, 2);
		assert_eq!(status.last_share_time, 5002);
	}

	#[test]
	fn state_info_tracks_workers() {
		let info = ServerStateInfo::default();
		let share = Share::Bitcoin(ShareBitcoin {
			version: BITCOIN_SHARE_VERSION,
			job_id: 1,
			worker_hash_id: 42,
			user_id: 9,
			status: StratumStatus::Accept,
			timestamp: 100,
			ip: IpAddress::default(),
			share_diff: 1,
			blk_bits: 0,
			height: 0,
			nonce: 0,
			session_id: 0,
			extra_nonce2: 0,
			n_time: 0,
			version_mask: 0,
		});
		info.process_share(&share);
		assert_eq!(info.worker_shares.read().len(), 1);
		info.remove_expired_workers(100 + STATS_SLIDING_WINDOW_SECONDS + 1);
		assert!(info.worker_shares.read().is_empty());
	}
}
