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

//! The SHA256 generic stratum dialect: subscribe, configure (BIP310
//! version rolling and minimum difficulty), authorize and submit, plus
//! the notify/set_difficulty push side.

use serde_json::Value;

use crate::mining::codec::StratumOut;
use crate::mining::repository::StratumJobEx;
use crate::mining::session::{ChainSession, Session, SessionState};
use crate::mining::validator::ShareCheck;
use crate::mining::{split_worker_name, LocalShare, WorkerIdentity};
use orepool_core::consensus::EXTRA_NONCE2_SIZE;
use orepool_core::job::StratumJob;
use orepool_core::share::{IpAddress, ShareBitcoin, BITCOIN_SHARE_VERSION};
use orepool_core::target::{diff_to_target, target_from_hex, target_to_diff};
use orepool_core::{Share, StratumStatus};

/// Capabilities advertised to agents: version rolling pass-through.
const AGENT_CAPABILITIES: &str = "[\"verrol\"]";

impl Session {
	pub(crate) async fn handle_bitcoin_request(
		&mut self,
		id: &Value,
		method: &str,
		params: &Value,
	) -> Result<Vec<StratumOut>, String> {
		// "mining.configure" and suggest calls may legally arrive before
		// subscribe, so no state gate up front.
		match method {
			"mining.subscribe" => Ok(self.handle_subscribe(id, params)),
			"mining.configure" => Ok(self.handle_mining_configure(id, params)),
			"mining.suggest_difficulty" => Ok(self.handle_suggest_difficulty(id, params)),
			"mining.suggest_target" => Ok(self.handle_suggest_target(id, params)),
			"agent.get_capabilities" => Ok(vec![StratumOut::Line(format!(
				"{{\"id\":{},\"result\":{{\"capabilities\":{}}}}}",
				Self::id_str(id),
				AGENT_CAPABILITIES
			))]),
			"mining.authorize" => Ok(self.handle_authorize(id, params).await),
			"mining.submit" => Ok(self.handle_submit(id, params)),
			_ => {
				// unknown methods are silently ignored
				debug!("unknown method: {}", method);
				Ok(Vec::new())
			}
		}
	}

	fn handle_subscribe(&mut self, id: &Value, params: &Value) -> Vec<StratumOut> {
		if self.state != SessionState::Connected {
			return vec![Self::response_error(id, StratumStatus::Unknown)];
		}
		self.state = SessionState::Subscribed;

		//  params[0] = client version     [optional]
		//  params[1] = session id of pool [optional]
		if let Some(agent) = params.get(0).and_then(|p| p.as_str()) {
			self.set_client_agent(agent);
			if let ChainSession::Bitcoin(data) = &mut self.chain {
				data.is_nicehash = agent.to_lowercase().starts_with("nicehash/");
			}
		}

		//  result[0] = 2-tuple with the subscribed notification names and
		//              subscription ids
		//  result[1] = ExtraNonce1, used for building the coinbase
		//  result[2] = ExtraNonce2 size in bytes
		vec![StratumOut::Line(format!(
			"{{\"id\":{},\"result\":[[[\"mining.set_difficulty\",\"{:08x}\"],[\"mining.notify\",\"{:08x}\"]],\"{:08x}\",{}],\"error\":null}}",
			Self::id_str(id),
			self.extra_nonce1,
			self.extra_nonce1,
			self.extra_nonce1,
			EXTRA_NONCE2_SIZE
		))]
	}

	fn handle_mining_configure(&mut self, id: &Value, params: &Value) -> Vec<StratumOut> {
		let allowed_mask = self.ctx.config.version_mask;
		let extensions = match params.get(0).and_then(|p| p.as_array()) {
			Some(e) => e.clone(),
			None => return vec![Self::response_error(id, StratumStatus::IllegalParams)],
		};
		let options = match params.get(1) {
			Some(o) if o.is_object() => o.clone(),
			_ => return vec![Self::response_error(id, StratumStatus::IllegalParams)],
		};

		let mut results: Vec<(String, String)> = Vec::new();
		let mut granted_mask = 0u32;

		for ext in extensions.iter().filter_map(|e| e.as_str()) {
			match ext {
				"minimum-difficulty" => {
					let value = options
						.get("minimum-difficulty.value")
						.and_then(|v| v.as_u64());
					match value {
						Some(diff) => {
							self.diff_controller.set_min_diff(diff);
							results.push(("minimum-difficulty".to_string(), "true".to_string()));
						}
						None => {
							results.push(("minimum-difficulty".to_string(), "false".to_string()));
						}
					}
				}
				"version-rolling" => {
					let mask = options
						.get("version-rolling.mask")
						.and_then(|v| v.as_str())
						.and_then(|s| u32::from_str_radix(s, 16).ok());
					match mask {
						Some(mask) => {
							if let ChainSession::Bitcoin(data) = &mut self.chain {
								data.version_mask = mask;
							}
							granted_mask = mask & allowed_mask;
							results.push(("version-rolling".to_string(), "true".to_string()));
							results.push((
								"version-rolling.mask".to_string(),
								format!("\"{:08x}\"", granted_mask),
							));
						}
						None => {
							results.push(("version-rolling".to_string(), "false".to_string()));
						}
					}
				}
				other => {
					results.push((other.to_string(), "false".to_string()));
				}
			}
		}

		let result_body = results
			.iter()
			.map(|(k, v)| format!("\"{}\":{}", k, v))
			.collect::<Vec<String>>()
			.join(",");

		let mut outs = vec![StratumOut::Line(format!(
			"{{\"id\":{},\"result\":{{{}}},\"error\":null}}",
			Self::id_str(id),
			result_body
		))];

		if granted_mask != 0 {
			outs.push(StratumOut::Line(format!(
				"{{\"id\":null,\"method\":\"mining.set_version_mask\",\"params\":[\"{:08x}\"]}}",
				granted_mask
			)));
		}
		outs
	}

	fn handle_suggest_difficulty(&mut self, id: &Value, params: &Value) -> Vec<StratumOut> {
		match params.get(0).and_then(|p| p.as_u64()) {
			Some(diff) => {
				self.diff_controller.set_cur_diff(diff);
				vec![Self::response_true(id)]
			}
			None => vec![Self::response_error(id, StratumStatus::IllegalParams)],
		}
	}

	fn handle_suggest_target(&mut self, id: &Value, params: &Value) -> Vec<StratumOut> {
		let diff = params
			.get(0)
			.and_then(|p| p.as_str())
			.and_then(|s| target_from_hex(s).ok())
			.map(|t| target_to_diff(&t));
		match diff {
			Some(diff) => {
				self.diff_controller.set_cur_diff(diff);
				vec![Self::response_true(id)]
			}
			None => vec![Self::response_error(id, StratumStatus::IllegalParams)],
		}
	}

	async fn handle_authorize(&mut self, id: &Value, params: &Value) -> Vec<StratumOut> {
		if self.state != SessionState::Subscribed {
			return vec![Self::response_error(id, StratumStatus::NotSubscribed)];
		}

		//  params[0] = user[.worker]
		//  params[1] = password, may be omitted
		let full_name = match params.get(0).and_then(|p| p.as_str()) {
			Some(name) if !name.is_empty() => name.to_string(),
			_ => return vec![Self::response_error(id, StratumStatus::InvalidUsername)],
		};
		let password = params
			.get(1)
			.and_then(|p| p.as_str())
			.unwrap_or("")
			.to_string();

		match self.ctx.authenticator.authorize(&full_name, &password).await {
			Ok((user_id, worker_hash_id)) => {
				let (user_name, worker_name) = split_worker_name(&full_name);
				let worker = WorkerIdentity {
					user_id,
					worker_hash_id,
					user_name,
					worker_name,
					full_name,
				};
				let mut outs = vec![Self::response_true(id)];
				outs.extend(self.finish_authorize(worker));
				outs
			}
			Err(e) => {
				warn!(
					"authorize failed, workerName: {}, clientIp: {}, reason: {}",
					full_name, self.peer, e
				);
				vec![Self::response_error(id, StratumStatus::InvalidUsername)]
			}
		}
	}

	fn handle_submit(&mut self, id: &Value, params: &Value) -> Vec<StratumOut> {
		if self.state != SessionState::Authenticated {
			// there must be something wrong on the miner side, ask for a
			// fresh connection
			return vec![
				Self::response_error(id, StratumStatus::Unauthorized),
				Self::client_reconnect(),
			];
		}

		//  params[0] = worker name
		//  params[1] = job id
		//  params[2] = extra nonce 2, hex
		//  params[3] = nTime, hex
		//  params[4] = nonce, hex
		//  params[5] = version bits, hex [optional, BIP310]
		let arr = match params.as_array() {
			Some(a) if a.len() >= 5 => a,
			_ => return vec![Self::response_error(id, StratumStatus::IllegalParams)],
		};
		let job_id_param = arr[1].as_str().map(|s| s.to_string()).or_else(|| {
			arr[1].as_u64().map(|n| n.to_string())
		});
		let parsed = (
			job_id_param,
			arr[2].as_str().and_then(|s| u64::from_str_radix(s, 16).ok()),
			arr[3].as_str().and_then(|s| u32::from_str_radix(s, 16).ok()),
			arr[4].as_str().and_then(|s| u32::from_str_radix(s, 16).ok()),
		);
		let (job_id_str, extra_nonce2, n_time, nonce) = match parsed {
			(Some(j), Some(e), Some(t), Some(n)) => (j, e, t, n),
			_ => return vec![Self::response_error(id, StratumStatus::IllegalParams)],
		};
		let version_bits = arr
			.get(5)
			.and_then(|v| v.as_str())
			.and_then(|s| u32::from_str_radix(s, 16).ok())
			.unwrap_or(0);

		let now = self.now();
		self.submit_bitcoin_share(
			id,
			&job_id_str,
			extra_nonce2,
			n_time,
			nonce,
			version_bits,
			now,
		)
	}

	/// The shared SHA256 submit path, also used by agent sub-sessions
	/// (which pass their own worker identity).
	pub(crate) fn submit_bitcoin_share(
		&mut self,
		id: &Value,
		job_id_str: &str,
		extra_nonce2: u64,
		n_time: u32,
		nonce: u32,
		version_bits: u32,
		now: u64,
	) -> Vec<StratumOut> {
		let is_nicehash = match &self.chain {
			ChainSession::Bitcoin(data) => data.is_nicehash,
			_ => false,
		};

		// NiceHash job ids are time*10+short; everyone else gets the
		// short id verbatim
		let short_job_id: u8 = match job_id_str.parse::<u64>() {
			Ok(n) if is_nicehash => (n % 10) as u8,
			Ok(n) if n < 256 => n as u8,
			_ => return vec![Self::response_error(id, StratumStatus::JobNotFound)],
		};

		// version bits outside the granted mask are a protocol offense
		let allowed_mask = self.ctx.config.version_mask;
		if version_bits & !allowed_mask != 0 {
			self.record_invalid_share(now);
			return vec![Self::response_error(id, StratumStatus::IllegalVerMask)];
		}

		enum Lookup {
			Found(u64, u64),
			Duplicate((u64, u64, u32)),
			NotFound,
		}
		let lookup = match self.local_jobs.find_by_short_id(short_job_id) {
			Some(local_job) => {
				let tuple = LocalShare {
					extra_nonce2,
					n_time,
					version_mask: version_bits,
				};
				if local_job.add_local_share(tuple) {
					Lookup::Found(local_job.job_id, local_job.job_difficulty)
				} else {
					Lookup::Duplicate(local_job_snapshot(local_job))
				}
			}
			None => Lookup::NotFound,
		};
		let (job_id, job_difficulty) = match lookup {
			Lookup::Found(job_id, job_difficulty) => (job_id, job_difficulty),
			Lookup::Duplicate(snapshot) => {
				let publish = self.record_invalid_share(now);
				return self.reject_and_publish_bitcoin(
					id,
					StratumStatus::DuplicateShare,
					snapshot,
					extra_nonce2,
					n_time,
					nonce,
					version_bits,
					now,
					publish,
				);
			}
			Lookup::NotFound => {
				self.record_invalid_share(now);
				return vec![Self::response_error(id, StratumStatus::JobNotFound)];
			}
		};

		let exjob = match self.ctx.repository.get_job(job_id) {
			Some(e) => e,
			None => {
				self.record_invalid_share(now);
				return vec![Self::response_error(id, StratumStatus::JobNotFound)];
			}
		};
		let job = match exjob.job.as_ref() {
			StratumJob::Bitcoin(j) => j,
			_ => return vec![Self::response_error(id, StratumStatus::IllegalParams)],
		};

		let check = ShareCheck::Bitcoin {
			job,
			job_is_stale: exjob.is_stale(),
			extra_nonce1: self.extra_nonce1,
			extra_nonce2,
			n_time,
			nonce,
			version_bits,
			share_target: diff_to_target(job_difficulty),
			now,
		};
		let result = self.ctx.validator.check_share(&check);

		let worker = self.worker.clone().expect("authenticated session has worker");
		let share = ShareBitcoin {
			version: BITCOIN_SHARE_VERSION,
			job_id,
			worker_hash_id: worker.worker_hash_id,
			user_id: worker.user_id,
			status: result.status,
			timestamp: now,
			ip: IpAddress::from_ip(self.peer.ip()),
			share_diff: job_difficulty,
			blk_bits: job.n_bits,
			height: job.height as u32,
			nonce,
			session_id: self.extra_nonce1,
			extra_nonce2,
			n_time,
			version_mask: version_bits,
		};

		let mut outs = Vec::new();
		let publish;
		if result.status.is_accepted() {
			if result.status.is_solved() {
				self.ctx.pipeline.publish_solved_bitcoin(
					job_id,
					job.height,
					result.header_hex.as_deref().unwrap_or(""),
					result.coinbase_hex.as_deref().unwrap_or(""),
					&worker,
				);
			}
			self.diff_controller.add_accepted_share(now);
			publish = true;
			// solved shares answer exactly like accepted ones; miners
			// learn about blocks from the chain, not from us
			outs.push(Self::response_true(id));
		} else {
			publish = self.record_invalid_share(now);
			outs.push(Self::response_error(id, result.status));
		}

		self.ctx.pipeline.handle_share(&Share::Bitcoin(share), publish);
		outs
	}

	/// Publication path for shares rejected before validation (duplicate
	/// tuples), which still hit the share topic unless suppressed.
	fn reject_and_publish_bitcoin(
		&mut self,
		id: &Value,
		status: StratumStatus,
		(job_id, job_difficulty, blk_bits): (u64, u64, u32),
		extra_nonce2: u64,
		n_time: u32,
		nonce: u32,
		version_bits: u32,
		now: u64,
		publish: bool,
	) -> Vec<StratumOut> {
		if let Some(worker) = self.worker.clone() {
			let share = ShareBitcoin {
				version: BITCOIN_SHARE_VERSION,
				job_id,
				worker_hash_id: worker.worker_hash_id,
				user_id: worker.user_id,
				status,
				timestamp: now,
				ip: IpAddress::from_ip(self.peer.ip()),
				share_diff: job_difficulty,
				blk_bits,
				height: 0,
				nonce,
				session_id: self.extra_nonce1,
				extra_nonce2,
				n_time,
				version_mask: version_bits,
			};
			self.ctx.pipeline.handle_share(&Share::Bitcoin(share), publish);
		}
		vec![Self::response_error(id, status)]
	}

	/// Build the set_difficulty / mining.notify push for a new job.
	pub(crate) fn send_mining_notify_bitcoin(
		&mut self,
		exjob: &std::sync::Arc<StratumJobEx>,
		is_first_job: bool,
	) -> Vec<StratumOut> {
		let job = match exjob.job.as_ref() {
			StratumJob::Bitcoin(j) => j,
			_ => return Vec::new(),
		};

		let now = self.now();
		let difficulty = self.diff_controller.calc_cur_diff(now);
		let (short_job_id, is_nicehash) = match &mut self.chain {
			ChainSession::Bitcoin(data) => (data.alloc_short_job_id(), data.is_nicehash),
			_ => return Vec::new(),
		};

		self.local_jobs.push(crate::mining::LocalJob::new(
			job.job_id,
			short_job_id,
			difficulty,
			job.n_bits,
		));

		let mut outs = Vec::new();
		// a difficulty move is delivered before the notify, never
		// mid-job
		if difficulty != self.last_sent_diff {
			outs.push(StratumOut::Line(format!(
				"{{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[{}]}}",
				difficulty
			)));
			self.last_sent_diff = difficulty;
		}

		// NiceHash clients have problems with short job ids
		let job_id_str = if is_nicehash {
			(now * 10 + short_job_id as u64).to_string()
		} else {
			short_job_id.to_string()
		};

		let branch = job
			.merkle_branch
			.iter()
			.map(|h| format!("\"{}\"", orepool_util::to_hex(h.as_slice())))
			.collect::<Vec<String>>()
			.join(",");

		let clean = is_first_job || exjob.is_clean;
		outs.push(StratumOut::Line(format!(
			"{{\"id\":null,\"method\":\"mining.notify\",\"params\":[\"{}\",\"{}\",\"{}\",\"{}\",[{}],\"{:08x}\",\"{:08x}\",\"{:08x}\",{}]}}",
			job_id_str,
			job.prev_hash_be_str,
			job.coinbase1,
			job.coinbase2,
			branch,
			job.n_version as u32,
			job.n_bits,
			job.n_time,
			clean
		)));

		// push per-worker difficulty down to agent sub-sessions
		outs.extend(self.agent_set_diff_frames(now));
		outs
	}
}

fn local_job_snapshot(job: &crate::mining::LocalJob) -> (u64, u64, u32) {
	(job.job_id, job.job_difficulty, job.blk_bits)
}
