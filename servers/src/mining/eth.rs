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

//! The three ethereum dialects. Protocol selection: a subscribe whose
//! second parameter starts with "ethereumstratum/" is NiceHash, any
//! other subscribe is generic stratum, and a session that never
//! subscribes but logs in with eth_submitLogin is ETHPROXY.

use serde_json::Value;

use crate::mining::codec::StratumOut;
use crate::mining::repository::StratumJobEx;
use crate::mining::session::{ChainSession, EthProtocol, Session, SessionState};
use crate::mining::validator::ShareCheck;
use crate::mining::{split_worker_name, strip_eth_addr_from_full_name, LocalShare, WorkerIdentity};
use orepool_core::job::eth::{header_prefix, strip_0x};
use orepool_core::job::StratumJob;
use orepool_core::share::{IpAddress, ShareEth, ETH_SHARE_VERSION};
use orepool_core::target::{eth_diff_to_nicehash_diff, eth_diff_to_target, target_to_hex};
use orepool_core::{Share, StratumStatus};

impl Session {
	fn eth_protocol(&self) -> EthProtocol {
		match &self.chain {
			ChainSession::Eth(data) => data.protocol,
			_ => EthProtocol::Stratum,
		}
	}

	pub(crate) async fn handle_eth_request(
		&mut self,
		id: &Value,
		method: &str,
		params: &Value,
		root: &Value,
	) -> Result<Vec<StratumOut>, String> {
		match method {
			"mining.subscribe" => Ok(self.handle_eth_subscribe(id, params)),
			"mining.authorize" | "eth_submitLogin" => {
				Ok(self.handle_eth_authorize(id, params, root).await)
			}
			"eth_getWork" => Ok(self.handle_eth_get_work(id)),
			"eth_submitHashrate" => Ok(vec![Self::rpc2_response_true(id)]),
			"mining.submit" | "eth_submitWork" => Ok(self.handle_eth_submit(id, params)),
			"mining.extranonce.subscribe" => Ok(vec![Self::rpc2_response_true(id)]),
			_ => {
				debug!("unknown method: {}", method);
				Ok(Vec::new())
			}
		}
	}

	fn handle_eth_subscribe(&mut self, id: &Value, params: &Value) -> Vec<StratumOut> {
		if self.state != SessionState::Connected {
			return vec![Self::rpc2_response_error(id, StratumStatus::Unknown)];
		}
		self.state = SessionState::Subscribed;

		if let Some(agent) = params.get(0).and_then(|p| p.as_str()) {
			self.set_client_agent(agent);
		}
		let protocol_str = params
			.get(1)
			.and_then(|p| p.as_str())
			.unwrap_or("")
			.to_lowercase();

		if protocol_str.starts_with("ethereumstratum/") {
			if let ChainSession::Eth(data) = &mut self.chain {
				data.protocol = EthProtocol::NiceHash;
			}
			// NiceHash wants its extra nonce at subscribe time; miners
			// zero-fill the remaining nonce bytes
			vec![StratumOut::Line(format!(
				"{{\"id\":{},\"jsonrpc\":\"2.0\",\"result\":[[\"mining.notify\",\"{:06x}\",\"EthereumStratum/1.0.0\"],\"{:06x}\"],\"error\":null}}",
				Self::id_str(id),
				self.extra_nonce1,
				self.extra_nonce1
			))]
		} else {
			if let ChainSession::Eth(data) = &mut self.chain {
				data.protocol = EthProtocol::Stratum;
			}
			vec![StratumOut::Line(format!(
				"{{\"id\":{},\"jsonrpc\":\"2.0\",\"result\":true}}",
				Self::id_str(id)
			))]
		}
	}

	async fn handle_eth_authorize(
		&mut self,
		id: &Value,
		params: &Value,
		root: &Value,
	) -> Vec<StratumOut> {
		// ETHPROXY skips subscribe; a login from CONNECTED implies it
		if self.state == SessionState::Connected {
			self.state = SessionState::Subscribed;
		}

		let mut full_name = match params.get(0).and_then(|p| p.as_str()) {
			Some(name) if !name.is_empty() => name.to_string(),
			_ => return vec![Self::rpc2_response_error(id, StratumStatus::InvalidUsername)],
		};
		// EthMiner sends the worker name out-of-band in the request root
		if self.eth_protocol() == EthProtocol::EthProxy {
			if let Some(worker) = root.get("worker").and_then(|w| w.as_str()) {
				full_name.push('.');
				full_name.push_str(worker);
			}
		}
		let full_name = strip_eth_addr_from_full_name(&full_name).to_string();
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
				let mut outs = vec![Self::rpc2_response_true(id)];
				outs.extend(self.finish_authorize(worker));
				outs
			}
			Err(e) => {
				warn!(
					"authorize failed, workerName: {}, clientIp: {}, reason: {}",
					full_name, self.peer, e
				);
				vec![Self::rpc2_response_error(id, StratumStatus::InvalidUsername)]
			}
		}
	}

	fn handle_eth_get_work(&mut self, id: &Value) -> Vec<StratumOut> {
		match self.ctx.repository.latest_job() {
			Some(latest) => self.send_mining_notify_eth(&latest, id),
			None => vec![Self::rpc2_response_error(id, StratumStatus::JobNotFound)],
		}
	}

	fn handle_eth_submit(&mut self, id: &Value, params: &Value) -> Vec<StratumOut> {
		if self.state != SessionState::Authenticated {
			return vec![
				Self::rpc2_response_error(id, StratumStatus::Unauthorized),
				Self::client_reconnect(),
			];
		}

		// STRATUM:  [worker, jobId, nonce, header, mix]
		// ETHPROXY: [nonce, header, mix]
		// NICEHASH: [worker, jobId, minerNonce]
		let arr = match params.as_array() {
			Some(a) => a,
			None => return vec![Self::rpc2_response_error(id, StratumStatus::IllegalParams)],
		};
		let protocol = self.eth_protocol();
		let min_params = match protocol {
			EthProtocol::Stratum => 4,
			_ => 3,
		};
		if arr.len() < min_params {
			return vec![Self::rpc2_response_error(id, StratumStatus::IllegalParams)];
		}
		let param = |i: usize| arr.get(i).and_then(|v| v.as_str()).unwrap_or("");

		let (job_handle, nonce_str) = match protocol {
			EthProtocol::Stratum => (param(1).to_string(), param(2).to_string()),
			EthProtocol::EthProxy => (param(1).to_string(), param(0).to_string()),
			EthProtocol::NiceHash => (param(1).to_string(), param(2).to_string()),
		};

		// Claymore prefixes job ids with 0x; strip for lookups
		let job_handle = strip_0x(&job_handle).to_string();

		// NiceHash sends a short miner nonce to be prefixed with the
		// session's extra nonce. The prefix is 3 bytes; shorter session
		// ids would produce malformed nonces, hence the %06x everywhere.
		let mut nonce_plain = strip_0x(&nonce_str).to_string();
		if protocol == EthProtocol::NiceHash && nonce_plain.len() != 16 {
			nonce_plain = format!("{:06x}{}", self.extra_nonce1, nonce_plain);
		}
		let nonce = match u64::from_str_radix(&nonce_plain, 16) {
			Ok(n) => n,
			Err(_) => return vec![Self::rpc2_response_error(id, StratumStatus::IllegalParams)],
		};

		let now = self.now();

		enum Lookup {
			Found(u64, u64, String),
			Duplicate(u64, u64),
			NotFound,
		}
		let lookup = match self.local_jobs.find_by_header(&job_handle) {
			Some(local_job) => {
				// the nonce is the whole dedup tuple on ethereum
				let tuple = LocalShare {
					extra_nonce2: nonce,
					n_time: 0,
					version_mask: 0,
				};
				if local_job.add_local_share(tuple) {
					Lookup::Found(
						local_job.job_id,
						local_job.job_difficulty,
						local_job.header_hash.clone(),
					)
				} else {
					Lookup::Duplicate(local_job.job_id, local_job.job_difficulty)
				}
			}
			None => Lookup::NotFound,
		};

		let (job_id, job_difficulty, header) = match lookup {
			Lookup::Found(job_id, job_difficulty, header) => (job_id, job_difficulty, header),
			Lookup::Duplicate(job_id, job_difficulty) => {
				let publish = self.record_invalid_share(now);
				return self.reject_and_publish_eth(
					id,
					StratumStatus::DuplicateShare,
					job_id,
					job_difficulty,
					&job_handle,
					nonce,
					now,
					publish,
				);
			}
			Lookup::NotFound => {
				self.record_invalid_share(now);
				return vec![Self::rpc2_response_error(id, StratumStatus::JobNotFound)];
			}
		};

		// the cross-server duplicate filter, when one is wired in
		if let Some(checker) = self.ctx.dup_share_checker.clone() {
			if !checker.add_share(job_id, nonce) {
				let publish = self.record_invalid_share(now);
				return self.reject_and_publish_eth(
					id,
					StratumStatus::DuplicateShare,
					job_id,
					job_difficulty,
					&job_handle,
					nonce,
					now,
					publish,
				);
			}
		}

		let exjob = match self.ctx.repository.get_job(job_id) {
			Some(e) => e,
			None => {
				self.record_invalid_share(now);
				return vec![Self::rpc2_response_error(id, StratumStatus::JobNotFound)];
			}
		};
		let job = match exjob.job.as_ref() {
			StratumJob::Eth(j) => j,
			_ => return vec![Self::rpc2_response_error(id, StratumStatus::IllegalParams)],
		};

		let check = ShareCheck::Eth {
			job,
			job_is_stale: exjob.is_stale(),
			nonce,
			share_target: eth_diff_to_target(job_difficulty),
		};
		let result = self.ctx.validator.check_share(&check);

		let worker = self.worker.clone().expect("authenticated session has worker");
		let share = ShareEth {
			version: ETH_SHARE_VERSION,
			job_id,
			header_hash_prefix: header_prefix(&header).unwrap_or(0),
			worker_hash_id: worker.worker_hash_id,
			user_id: worker.user_id,
			status: result.status,
			timestamp: now,
			ip: IpAddress::from_ip(self.peer.ip()),
			share_diff: job_difficulty,
			network_diff: job.network_diff(),
			height: job.height as u32,
			nonce,
			session_id: self.extra_nonce1,
		};

		let mut outs = Vec::new();
		let publish;
		if result.status.is_accepted() {
			if result.status.is_solved() {
				// the mix hash is recomputed server side; a correct pow
				// submits cleanly regardless of what the miner claimed
				self.ctx.pipeline.publish_solved_eth(
					&format!("{:016x}", nonce),
					&header,
					result.mix_hash.as_deref().unwrap_or(""),
					job.height,
					job.network_diff(),
					&worker,
				);
			}
			self.diff_controller.add_accepted_share(now);
			publish = true;
			outs.push(Self::rpc2_response_true(id));
		} else {
			publish = self.record_invalid_share(now);
			outs.push(Self::rpc2_response_error(id, result.status));
		}

		self.ctx.pipeline.handle_share(&Share::Eth(share), publish);
		outs
	}

	fn reject_and_publish_eth(
		&mut self,
		id: &Value,
		status: StratumStatus,
		job_id: u64,
		job_difficulty: u64,
		header: &str,
		nonce: u64,
		now: u64,
		publish: bool,
	) -> Vec<StratumOut> {
		if let Some(worker) = self.worker.clone() {
			let share = ShareEth {
				version: ETH_SHARE_VERSION,
				job_id,
				header_hash_prefix: header_prefix(header).unwrap_or(0),
				worker_hash_id: worker.worker_hash_id,
				user_id: worker.user_id,
				status,
				timestamp: now,
				ip: IpAddress::from_ip(self.peer.ip()),
				share_diff: job_difficulty,
				network_diff: 0,
				height: 0,
				nonce,
				session_id: self.extra_nonce1,
			};
			self.ctx.pipeline.handle_share(&Share::Eth(share), publish);
		}
		vec![Self::rpc2_response_error(id, status)]
	}

	/// Build the job push for whichever ethereum dialect the session
	/// speaks. `id` is null for repository fan-out and the request id
	/// for eth_getWork replays.
	pub(crate) fn send_mining_notify_eth(
		&mut self,
		exjob: &std::sync::Arc<StratumJobEx>,
		id: &Value,
	) -> Vec<StratumOut> {
		if self.state < SessionState::Authenticated {
			return Vec::new();
		}
		let job = match exjob.job.as_ref() {
			StratumJob::Eth(j) => j,
			_ => return Vec::new(),
		};

		let now = self.now();
		let difficulty = self.diff_controller.calc_cur_diff(now);
		let (short_job_id, protocol) = match &mut self.chain {
			ChainSession::Eth(data) => (data.alloc_short_job_id(), data.protocol),
			_ => return Vec::new(),
		};

		let header = job.header_hash_plain().to_string();
		let seed = job.seed_hash_plain().to_string();

		let mut local_job =
			crate::mining::LocalJob::new(job.job_id, short_job_id, difficulty, 0);
		local_job.header_hash = header.clone();
		self.local_jobs.push(local_job);

		let share_target = target_to_hex(&eth_diff_to_target(difficulty));
		let id_str = Self::id_str(id);
		let mut outs = Vec::new();

		match protocol {
			EthProtocol::Stratum => {
				outs.push(StratumOut::Line(format!(
					"{{\"id\":{},\"jsonrpc\":\"2.0\",\"method\":\"mining.notify\",\"params\":[\"{}\",\"{}\",\"{}\",\"{}\",{}]}}",
					id_str, header, header, seed, share_target, exjob.is_clean
				)));
			}
			EthProtocol::EthProxy => {
				// Claymore polls with eth_getWork and wants a 58-char
				// target plus the start nonce prefix
				outs.push(StratumOut::Line(format!(
					"{{\"id\":{},\"jsonrpc\":\"2.0\",\"result\":[\"0x{}\",\"0x{}\",\"0x{}\",\"0x{:06x}\"]}}",
					id_str,
					header,
					seed,
					&share_target[6..],
					self.extra_nonce1
				)));
			}
			EthProtocol::NiceHash => {
				// difficulty only when it moved, and always ahead of the
				// notify
				let last_sent = match &self.chain {
					ChainSession::Eth(data) => data.nicehash_last_sent_diff,
					_ => 0,
				};
				if difficulty != last_sent {
					outs.push(StratumOut::Line(format!(
						"{{\"id\":{},\"jsonrpc\":\"2.0\",\"method\":\"mining.set_difficulty\",\"params\":[{}]}}",
						id_str,
						eth_diff_to_nicehash_diff(difficulty)
					)));
					if let ChainSession::Eth(data) = &mut self.chain {
						data.nicehash_last_sent_diff = difficulty;
					}
				}
				outs.push(StratumOut::Line(format!(
					"{{\"id\":{},\"jsonrpc\":\"2.0\",\"method\":\"mining.notify\",\"params\":[\"{}\",\"{}\",\"{}\",{}]}}",
					id_str, header, seed, header, exjob.is_clean
				)));
			}
		}
		outs
	}
}
