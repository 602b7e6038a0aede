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

//! The bitcoin job maker handler: a cache of recent block templates
//! ordered so its largest key is always the template most worth mining,
//! merge-mining work slots, and the four publication triggers.

use std::collections::{BTreeMap, VecDeque};

use crate::common::types::{Error, JobMakerConfig, MergedMiningNotifyPolicy};
use crate::jobmaker::JobMakerHandler;
use orepool_core::consensus::{
	GBT_HASH_DEDUP_WINDOW, GBT_MAX_TIME_DEVIATION, MAX_TEMPLATE_HEIGHT, SIDECHAIN_WORK_MAX_AGE,
};
use orepool_core::hash::Hash;
use orepool_core::job::bitcoin::GbtSummary;
use orepool_core::job::{AuxWork, SidechainWork, StratumJob, StratumJobBitcoin};

/// Envelope around a base64 block template as the template gateway
/// publishes it.
#[derive(Deserialize)]
struct RawGbtMessage {
	created_at_ts: u64,
	gbthash: String,
	block_template_base64: String,
}

/// Compose a template cache key. Ordering by this key makes the largest
/// element simultaneously the newest and, tie-breaking on the low bit,
/// the one most worth mining:
///
/// ```text
///  -----------------------------------------------------------------
/// |        32 bits        |          31 bits          |   1 bit     |
/// |        gbtTime        |          height           | nonEmptyFlag |
///  -----------------------------------------------------------------
/// ```
fn make_gbt_key(gbt_time: u64, is_empty_block: bool, height: u32) -> u64 {
	debug_assert!(height < MAX_TEMPLATE_HEIGHT);
	(gbt_time << 32) | ((height as u64) << 1) | (!is_empty_block as u64)
}

fn gbt_key_time(key: u64) -> u64 {
	key >> 32
}

fn gbt_key_height(key: u64) -> u32 {
	((key >> 1) & 0x7fff_ffff) as u32
}

fn gbt_key_is_empty(key: u64) -> bool {
	key & 1 == 0
}

/// Bitcoin half of the job maker. Driven from the job maker task, so all
/// state is plain; the template cache, the dedup window and the
/// merge-mining slots only ever see one thread.
pub struct JobMakerHandlerBitcoin {
	config: JobMakerConfig,
	payout_script: Vec<u8>,

	/// templates by cache key, decoded json
	rawgbt_map: BTreeMap<u64, String>,
	/// recently seen template hashes, for dedup
	latest_gbt_hashes: VecDeque<Hash>,

	curr_best_height: u32,
	last_job_send_time: u64,
	is_last_job_empty_block: bool,
	last_sent_best_key: u64,

	/// merge mining for aux-pow blocks (example: namecoin)
	aux_work: Option<AuxWork>,

	/// merge mining for sidechains (example: RSK)
	sidechain_current: Option<SidechainWork>,
	sidechain_previous: Option<SidechainWork>,

	/// a pending merge-mining update forces the next job out
	is_merged_mining_update: bool,
}

impl JobMakerHandlerBitcoin {
	/// Build the handler, decoding the payout script up front so a bad
	/// config fails at startup rather than on the first template.
	pub fn new(config: JobMakerConfig) -> Result<JobMakerHandlerBitcoin, Error> {
		let payout_script = config.payout_script()?;
		info!(
			"jobmaker bitcoin handler: coinbase info {:?}, block version {:#x}",
			config.coinbase_info, config.block_version
		);
		Ok(JobMakerHandlerBitcoin {
			config,
			payout_script,
			rawgbt_map: BTreeMap::new(),
			latest_gbt_hashes: VecDeque::with_capacity(GBT_HASH_DEDUP_WINDOW),
			curr_best_height: 0,
			last_job_send_time: 0,
			is_last_job_empty_block: false,
			last_sent_best_key: 0,
			aux_work: None,
			sidechain_current: None,
			sidechain_previous: None,
			is_merged_mining_update: false,
		})
	}

	fn add_raw_gbt(&mut self, msg: &str, now: u64) -> bool {
		let envelope: RawGbtMessage = match serde_json::from_str(msg) {
			Ok(e) => e,
			Err(e) => {
				error!("parse rawgbt message to json fail: {}", e);
				return false;
			}
		};

		let gbt_hash = match Hash::from_hex(&envelope.gbthash) {
			Ok(h) => h,
			Err(e) => {
				error!("invalid rawgbt gbthash: {}", e);
				return false;
			}
		};
		if self.latest_gbt_hashes.contains(&gbt_hash) {
			error!("duplicate gbt hash: {}", gbt_hash);
			return false;
		}

		let gbt_time = envelope.created_at_ts;
		let time_diff = now as i64 - gbt_time as i64;
		if time_diff.abs() >= GBT_MAX_TIME_DEVIATION {
			warn!("rawgbt diff time is more than {}, ignore it", GBT_MAX_TIME_DEVIATION);
			return false;
		}
		if time_diff.abs() >= 3 {
			warn!("rawgbt diff time is too large: {} seconds", time_diff);
		}

		let gbt = match base64::decode(&envelope.block_template_base64) {
			Ok(bytes) => match String::from_utf8(bytes) {
				Ok(s) => s,
				Err(e) => {
					error!("rawgbt template is not utf-8: {}", e);
					return false;
				}
			},
			Err(e) => {
				error!("rawgbt base64 decode fail: {}", e);
				return false;
			}
		};

		let summary = match GbtSummary::parse(&gbt) {
			Ok(s) => s,
			Err(e) => {
				error!("parse gbt message to json fail: {}", e);
				return false;
			}
		};
		if summary.height < 0 || summary.height as u32 >= MAX_TEMPLATE_HEIGHT {
			error!("gbt height out of range: {}", summary.height);
			return false;
		}
		let height = summary.height as u32;

		if let Some((&best_key, _)) = self.rawgbt_map.iter().next_back() {
			let best_time = gbt_key_time(best_key);
			let best_height = gbt_key_height(best_key);
			let best_is_empty = gbt_key_is_empty(best_key);

			// To prevent the job's block height ups and downs when the
			// heights of two upstream nodes are not synchronized. A height
			// drop must outlast twice the job interval without a higher
			// GBT before it is believed.
			if height < best_height
				&& !best_is_empty
				&& gbt_time.saturating_sub(best_time) < 2 * self.config.job_interval_secs
			{
				warn!(
					"skip low height GBT. height: {}, best height: {}, elapsed time after best GBT: {}s",
					height,
					best_height,
					gbt_time.saturating_sub(best_time)
				);
				return false;
			}
		}

		let key = make_gbt_key(gbt_time, summary.is_empty, height);
		if self.rawgbt_map.contains_key(&key) {
			error!("key already exist in rawgbt map: {}", key);
		} else {
			self.rawgbt_map.insert(key, gbt);
		}

		self.latest_gbt_hashes.push_back(gbt_hash);
		while self.latest_gbt_hashes.len() > GBT_HASH_DEDUP_WINDOW {
			self.latest_gbt_hashes.pop_front();
		}

		info!(
			"add rawgbt, height: {}, gbthash: {}..., gbtTime: {}, isEmpty: {}",
			height,
			&envelope.gbthash[..16.min(envelope.gbthash.len())],
			gbt_time,
			summary.is_empty
		);
		true
	}

	/// Evict expired templates, always sparing the last entry so jobs
	/// keep flowing through an upstream outage.
	fn clear_timeout_gbt(&mut self, now: u64) {
		let config = &self.config;
		let expired: Vec<u64> = self
			.rawgbt_map
			.keys()
			.cloned()
			.filter(|&key| {
				let ts = gbt_key_time(key);
				let life = if gbt_key_is_empty(key) {
					config.empty_gbt_life_time_secs
				} else {
					config.gbt_life_time_secs
				};
				ts + life <= now
			})
			.collect();
		for key in expired {
			if self.rawgbt_map.len() <= 1 {
				break;
			}
			info!(
				"remove timeout rawgbt: {}, height: {}, isEmptyBlock: {}",
				gbt_key_time(key),
				gbt_key_height(key),
				gbt_key_is_empty(key)
			);
			self.rawgbt_map.remove(&key);
		}
	}

	/// Expire sidechain work out of its slots.
	fn clear_timeout_gw(&mut self, now: u64) {
		if let Some(current) = &self.sidechain_current {
			if current.created_at + SIDECHAIN_WORK_MAX_AGE < now {
				self.sidechain_current = None;
			}
		}
		if let Some(previous) = &self.sidechain_previous {
			if previous.created_at + SIDECHAIN_WORK_MAX_AGE < now {
				self.sidechain_previous = None;
			}
		}
	}

	fn is_reach_timeout(&self, now: u64) -> bool {
		self.last_job_send_time + self.config.job_interval_secs <= now
	}

	fn trigger_sidechain_update(&self) -> bool {
		let (current, previous) = match (&self.sidechain_current, &self.sidechain_previous) {
			(Some(c), Some(p)) => (c, p),
			_ => return false,
		};
		match self.config.merged_mining_notify_policy {
			MergedMiningNotifyPolicy::Disabled => false,
			MergedMiningNotifyPolicy::ByNotifyFlag => current.notify_flag,
			MergedMiningNotifyPolicy::ByHashChange => current.block_hash != previous.block_hash,
		}
	}

	/// Decide whether a job is due and hand back the template to build
	/// it from.
	fn find_best_raw_gbt(&mut self, now: u64) -> Option<String> {
		self.clear_timeout_gbt(now);
		self.clear_timeout_gw(now);

		if self.rawgbt_map.is_empty() {
			warn!("rawgbt map is empty");
			return None;
		}

		// the map is sorted by (timestamp | height | nonEmptyFlag), so
		// the last entry is the newest and best one
		let (&best_key, _) = self.rawgbt_map.iter().next_back().expect("map not empty");
		let best_height = gbt_key_height(best_key);
		let current_gbt_is_empty = gbt_key_is_empty(best_key);

		if best_key == self.last_sent_best_key {
			warn!("best key is the same as last one: {}", best_key);
		}

		// if the last job mined an empty block, replace it with a
		// non-empty one at the same height as soon as we have it
		let need_update_empty_block_job = best_height == self.curr_best_height
			&& self.is_last_job_empty_block
			&& !current_gbt_is_empty;
		if need_update_empty_block_job {
			info!("--------update last empty block job--------");
		}

		let is_find_new_height = best_height > self.curr_best_height;
		if is_find_new_height {
			info!(
				">>>> found new best height: {}, curr: {} <<<<",
				best_height, self.curr_best_height
			);
		}

		if is_find_new_height
			|| need_update_empty_block_job
			|| self.is_merged_mining_update
			|| self.is_reach_timeout(now)
		{
			self.last_sent_best_key = best_key;
			self.curr_best_height = best_height;
			return self.rawgbt_map.get(&best_key).cloned();
		}

		None
	}

	fn make_stratum_job(&mut self, gbt: &str, now: u64) -> Option<String> {
		let job = match StratumJobBitcoin::init_from_gbt(
			gbt,
			&self.config.coinbase_info,
			&self.payout_script,
			self.config.block_version,
			self.aux_work.as_ref(),
			self.sidechain_current.as_ref(),
			self.config.server_id,
			self.is_merged_mining_update,
			now,
		) {
			Ok(job) => job,
			Err(e) => {
				error!("init stratum job message from gbt str fail: {}", e);
				return None;
			}
		};

		self.last_job_send_time = now;
		self.is_last_job_empty_block = job.is_empty_block();
		self.is_merged_mining_update = false;

		info!(
			"--------produce stratum job, jobId: {}, height: {}--------",
			job.job_id, job.height
		);
		Some(StratumJob::Bitcoin(job).serialize_to_json())
	}
}

impl JobMakerHandler for JobMakerHandlerBitcoin {
	fn process_raw_template(&mut self, msg: &str, now: u64) -> bool {
		debug!("process rawgbt: {}", msg);
		self.add_raw_gbt(msg, now)
	}

	fn process_aux_work(&mut self, msg: &str, now: u64) -> bool {
		let work = match AuxWork::parse(msg) {
			Ok(w) => w,
			Err(e) => {
				error!("parse aux work message fail: {}", e);
				return false;
			}
		};
		if work.created_at_ts + orepool_core::consensus::AUX_POW_MAX_AGE < now {
			error!("too old aux work, created at {}", work.created_at_ts);
			return false;
		}

		let previous = self.aux_work.replace(work);
		let current = self.aux_work.as_ref().expect("just set");

		let update = match self.config.merged_mining_notify_policy {
			MergedMiningNotifyPolicy::Disabled => false,
			MergedMiningNotifyPolicy::ByNotifyFlag => match &previous {
				Some(p) => current.height > p.height,
				None => true,
			},
			MergedMiningNotifyPolicy::ByHashChange => match &previous {
				Some(p) => current.hash != p.hash,
				None => true,
			},
		};
		self.is_merged_mining_update = update;
		update
	}

	fn process_sidechain_work(&mut self, msg: &str, now: u64) -> bool {
		match SidechainWork::init_from_gw(msg, now) {
			Ok(work) => {
				self.sidechain_previous = self.sidechain_current.take();
				self.sidechain_current = Some(work);
			}
			Err(e) => {
				error!("parse sidechain work fail: {}", e);
				return false;
			}
		}
		self.is_merged_mining_update = self.trigger_sidechain_update();
		self.is_merged_mining_update
	}

	fn make_stratum_job_msg(&mut self, now: u64) -> Option<String> {
		let gbt = self.find_best_raw_gbt(now)?;
		self.make_stratum_job(&gbt, now)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use orepool_core::hash::sha256d;
	use orepool_core::job::StratumJob;

	const PREV_HASH: &str = "00000000000000000328e9fea9914ad83b7404a838aa66aefb970e5689c2f63d";

	fn config() -> JobMakerConfig {
		let mut cfg = JobMakerConfig::default();
		cfg.payout_script_hex = "76a91400000000000000000000000000000000000000aa88ac".to_string();
		cfg.job_interval_secs = 30;
		cfg.gbt_life_time_secs = 90;
		cfg.empty_gbt_life_time_secs = 15;
		cfg
	}

	fn handler() -> JobMakerHandlerBitcoin {
		JobMakerHandlerBitcoin::new(config()).unwrap()
	}

	fn gbt_json(height: u32, n_tx: usize, curtime: u64) -> String {
		let tx_data = {
			let raw = orepool_core::transaction::serialize_coinbase(
				&[0x01],
				&[orepool_core::transaction::CoinbaseOutput {
					value: 1,
					script_pubkey: vec![0x51],
				}],
			);
			orepool_util::to_hex(&raw)
		};
		let txs: Vec<String> = (0..n_tx)
			.map(|_| format!("{{\"data\":\"{}\"}}", tx_data))
			.collect();
		format!(
			"{{\"result\":{{\"previousblockhash\":\"{}\",\"height\":{},\
			 \"version\":536870912,\"bits\":\"1d00ffff\",\"curtime\":{},\"mintime\":0,\
			 \"coinbasevalue\":625000000,\"transactions\":[{}]}}}}",
			PREV_HASH,
			height,
			curtime,
			txs.join(",")
		)
	}

	fn envelope(gbt: &str, ts: u64) -> String {
		// distinct templates get distinct hashes, like the gateway computes
		let hash = sha256d(gbt.as_bytes());
		format!(
			"{{\"created_at_ts\":{},\"gbthash\":\"{}\",\"block_template_base64\":\"{}\"}}",
			ts,
			hash.to_hex(),
			base64::encode(gbt)
		)
	}

	fn feed(h: &mut JobMakerHandlerBitcoin, height: u32, n_tx: usize, now: u64) -> bool {
		let gbt = gbt_json(height, n_tx, now);
		h.process_raw_template(&envelope(&gbt, now), now)
	}

	#[test]
	fn publishes_on_new_height() {
		let mut h = handler();
		assert!(feed(&mut h, 100, 1, 1000));
		let job = h.make_stratum_job_msg(1000).unwrap();
		match StratumJob::parse_from_json(&job).unwrap() {
			StratumJob::Bitcoin(j) => assert_eq!(j.height, 100),
			_ => panic!("wrong chain"),
		}
		// same template again: no new height, interval not reached
		assert!(h.make_stratum_job_msg(1001).is_none());
	}

	#[test]
	fn empty_then_nonempty_coalescing() {
		let mut h = handler();
		// first, an empty template at height 100
		assert!(feed(&mut h, 100, 0, 1000));
		let first = h.make_stratum_job_msg(1000).unwrap();
		match StratumJob::parse_from_json(&first).unwrap() {
			StratumJob::Bitcoin(j) => assert!(j.is_empty_block()),
			_ => panic!("wrong chain"),
		}

		// within the interval, a non-empty template at the same height
		assert!(feed(&mut h, 100, 2, 1003));
		let second = h.make_stratum_job_msg(1003).unwrap();
		match StratumJob::parse_from_json(&second).unwrap() {
			StratumJob::Bitcoin(j) => {
				assert!(!j.is_empty_block());
				assert_eq!(j.height, 100);
			}
			_ => panic!("wrong chain"),
		}

		// and nothing more until the interval elapses
		assert!(h.make_stratum_job_msg(1004).is_none());
		assert!(h.make_stratum_job_msg(1003 + 30).is_some());
	}

	#[test]
	fn job_ids_strictly_increase() {
		let mut h = handler();
		let mut last_id = 0u64;
		let mut now = 1000u64;
		for height in 100..105u32 {
			assert!(feed(&mut h, height, 1, now));
			let job = h.make_stratum_job_msg(now).unwrap();
			let id = StratumJob::parse_from_json(&job).unwrap().job_id();
			assert!(id > last_id, "job id must increase: {} -> {}", last_id, id);
			last_id = id;
			now += 2;
		}
	}

	#[test]
	fn height_drop_within_grace_is_skipped() {
		let mut h = handler();
		assert!(feed(&mut h, 101, 1, 1000));
		assert!(h.make_stratum_job_msg(1000).is_some());
		// a lagging node reports 100 right after; grace window holds
		assert!(!feed(&mut h, 100, 1, 1010));
		// after 2 x interval the reorg is believed
		assert!(feed(&mut h, 100, 1, 1000 + 61));
	}

	#[test]
	fn height_drop_past_empty_best_is_accepted() {
		let mut h = handler();
		assert!(feed(&mut h, 101, 0, 1000));
		// best is an empty block: the grace rule does not protect it
		assert!(feed(&mut h, 100, 1, 1001));
	}

	#[test]
	fn duplicate_gbt_hash_rejected() {
		let mut h = handler();
		let gbt = gbt_json(100, 1, 1000);
		let env = envelope(&gbt, 1000);
		assert!(h.process_raw_template(&env, 1000));
		assert!(!h.process_raw_template(&env, 1001));
	}

	#[test]
	fn clock_skewed_template_rejected() {
		let mut h = handler();
		let gbt = gbt_json(100, 1, 1000);
		assert!(!h.process_raw_template(&envelope(&gbt, 1000), 1000 + 60));
	}

	#[test]
	fn eviction_spares_last_entry() {
		let mut h = handler();
		assert!(feed(&mut h, 100, 1, 1000));
		// far in the future everything expired, but one template must
		// survive so jobs keep flowing
		let job = h.make_stratum_job_msg(1000 + 86_400);
		assert!(job.is_some());
		assert_eq!(h.rawgbt_map.len(), 1);
	}

	#[test]
	fn malformed_messages_do_not_panic() {
		let mut h = handler();
		assert!(!h.process_raw_template("not json", 1000));
		assert!(!h.process_raw_template("{\"created_at_ts\":1}", 1000));
		assert!(!h.process_aux_work("not json", 1000));
		assert!(!h.process_sidechain_work("{}", 1000));
	}

	#[test]
	fn aux_update_policy_by_height() {
		let mut h = handler();
		let aux = |height: u32, hash_byte: u8, ts: u64| {
			format!(
				"{{\"created_at_ts\":{},\"hash\":\"{}\",\"merkle_size\":1,\
				 \"merkle_nonce\":0,\"height\":{},\"bits\":\"180290c8\",\
				 \"rpc_addr\":\"x\",\"rpc_userpass\":\"y\"}}",
				ts,
				orepool_util::to_hex(&[hash_byte; 32]),
				height
			)
		};
		// first sighting triggers
		assert!(h.process_aux_work(&aux(10, 1, 1000), 1000));
		// same height does not
		assert!(!h.process_aux_work(&aux(10, 2, 1001), 1001));
		// higher height does
		assert!(h.process_aux_work(&aux(11, 3, 1002), 1002));
		// stale messages are refused outright
		assert!(!h.process_aux_work(&aux(12, 4, 500), 1000));
	}

	#[test]
	fn sidechain_update_policy_by_notify_flag() {
		let mut h = handler();
		let gw = |hash: &str, notify: bool| {
			format!(
				"{{\"blockHashForMergedMining\":\"{}\",\"target\":\"00ff\",\
				 \"feesPaidToMiner\":\"0\",\"rpcAddress\":\"x\",\"rpcUserPwd\":\"y\",\
				 \"notifyFlag\":{}}}",
				hash, notify
			)
		};
		// only one slot filled: no trigger yet
		assert!(!h.process_sidechain_work(&gw("aa", true), 1000));
		// both slots filled and the gateway says notify
		assert!(h.process_sidechain_work(&gw("bb", true), 1001));
		assert!(!h.process_sidechain_work(&gw("cc", false), 1002));
	}

	#[test]
	fn merged_mining_update_forces_job(){
		let mut h = handler();
		assert!(feed(&mut h, 100, 1, 1000));
		assert!(h.make_stratum_job_msg(1000).is_some());
		// aux work arrives: the pending update pushes a job before the
		// interval is up, and the job carries the clean flag
		let aux = format!(
			"{{\"created_at_ts\":1002,\"hash\":\"{}\",\"merkle_size\":1,\
			 \"merkle_nonce\":0,\"height\":7,\"bits\":\"180290c8\",\
			 \"rpc_addr\":\"x\",\"rpc_userpass\":\"y\"}}",
			orepool_util::to_hex(&[9u8; 32])
		);
		assert!(h.process_aux_work(&aux, 1002));
		let job = h.make_stratum_job_msg(1002).unwrap();
		match StratumJob::parse_from_json(&job).unwrap() {
			StratumJob::Bitcoin(j) => {
				assert!(j.merged_mining_clean);
				assert!(j.has_aux_work());
			}
			_ => panic!("wrong chain"),
		}
	}
}
