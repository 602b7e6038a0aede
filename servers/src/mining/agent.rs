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

//! The agent sub-protocol: one authenticated TCP session multiplexing
//! many downstream miners. Frames are the binary exMessages of the
//! codec; each downstream miner is a 16-bit sub-session with its own
//! worker identity and difficulty controller.

use std::collections::HashMap;

use crate::mining::codec::{ExMessage, StratumOut};
use crate::mining::difficulty::DiffController;
use crate::mining::session::{ChainSession, Session, SessionState};
use crate::mining::validator::ShareCheck;
use crate::mining::{worker_hash_id, LocalShare, WorkerIdentity, DEFAULT_WORKER_NAME};
use orepool_core::consensus::AGENT_MAX_SESSION_ID;
use orepool_core::job::StratumJob;
use orepool_core::share::{IpAddress, ShareBitcoin, BITCOIN_SHARE_VERSION};
use orepool_core::target::diff_to_target;
use orepool_core::Share;

/// Agent registers a downstream miner.
pub const CMD_REGISTER_WORKER: u8 = 0x01;
/// Downstream share submit.
pub const CMD_SUBMIT_SHARE: u8 = 0x02;
/// Downstream share submit with an explicit nTime.
pub const CMD_SUBMIT_SHARE_WITH_TIME: u8 = 0x03;
/// Agent drops a downstream miner.
pub const CMD_UNREGISTER_WORKER: u8 = 0x04;
/// Server pushes difficulty to a set of downstream miners.
pub const CMD_MINING_SET_DIFF: u8 = 0x05;

/// One downstream miner behind an agent.
pub struct AgentWorker {
	/// Identity shares are attributed to.
	pub worker: WorkerIdentity,
	/// Its own difficulty trajectory.
	pub diff_controller: DiffController,
	/// Difficulty last pushed via SET_DIFF; zero before the first push.
	pub last_sent_diff: u64,
}

/// The per-session registry of downstream miners.
#[derive(Default)]
pub struct AgentDispatcher {
	workers: HashMap<u16, AgentWorker>,
}

impl AgentDispatcher {
	/// Empty dispatcher.
	pub fn new() -> AgentDispatcher {
		AgentDispatcher::default()
	}

	/// Number of registered downstream miners.
	pub fn len(&self) -> usize {
		self.workers.len()
	}

	/// Whether no downstream miner is registered.
	pub fn is_empty(&self) -> bool {
		self.workers.is_empty()
	}
}

/// Little-endian cursor over an exMessage body.
struct BodyReader<'a> {
	body: &'a [u8],
	pos: usize,
}

impl<'a> BodyReader<'a> {
	fn new(body: &'a [u8]) -> BodyReader<'a> {
		BodyReader { body, pos: 0 }
	}

	fn read_u8(&mut self) -> Option<u8> {
		let b = *self.body.get(self.pos)?;
		self.pos += 1;
		Some(b)
	}

	fn read_u16(&mut self) -> Option<u16> {
		let b = self.body.get(self.pos..self.pos + 2)?;
		self.pos += 2;
		Some(u16::from_le_bytes([b[0], b[1]]))
	}

	fn read_u32(&mut self) -> Option<u32> {
		let b = self.body.get(self.pos..self.pos + 4)?;
		self.pos += 4;
		Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
	}

	fn read_cstr(&mut self) -> Option<String> {
		let rest = self.body.get(self.pos..)?;
		let nul = rest.iter().position(|b| *b == 0)?;
		let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
		self.pos += nul + 1;
		Some(s)
	}
}

impl Session {
	/// Dispatch one agent frame. Agents must authenticate their own
	/// session first; frames before that are dropped.
	pub(crate) fn handle_agent_message(&mut self, msg: ExMessage) -> Vec<StratumOut> {
		if self.state != SessionState::Authenticated {
			debug!(
				"session {:08x} agent frame before authorize, dropping",
				self.extra_nonce1
			);
			return Vec::new();
		}

		let mut agent = match &mut self.chain {
			ChainSession::Bitcoin(data) => data.agent.take().unwrap_or_default(),
			_ => return Vec::new(),
		};

		let outs = match msg.command {
			CMD_REGISTER_WORKER => {
				self.agent_register_worker(&mut agent, &msg.body);
				Vec::new()
			}
			CMD_UNREGISTER_WORKER => {
				let mut reader = BodyReader::new(&msg.body);
				if let Some(session_id) = reader.read_u16() {
					agent.workers.remove(&session_id);
				}
				Vec::new()
			}
			CMD_SUBMIT_SHARE => self.agent_submit(&mut agent, &msg.body, false),
			CMD_SUBMIT_SHARE_WITH_TIME => self.agent_submit(&mut agent, &msg.body, true),
			other => {
				debug!("unknown agent command: {:#04x}", other);
				Vec::new()
			}
		};

		if let ChainSession::Bitcoin(data) = &mut self.chain {
			data.agent = Some(agent);
		}
		outs
	}

	fn agent_register_worker(&mut self, agent: &mut AgentDispatcher, body: &[u8]) {
		let mut reader = BodyReader::new(body);
		let session_id = match reader.read_u16() {
			Some(id) if id <= AGENT_MAX_SESSION_ID => id,
			Some(id) => {
				warn!("agent session id {} over limit, ignoring register", id);
				return;
			}
			None => return,
		};
		let _client_agent = reader.read_cstr().unwrap_or_default();
		let worker_name = match reader.read_cstr() {
			Some(name) if !name.is_empty() => name,
			_ => DEFAULT_WORKER_NAME.to_string(),
		};

		let session_worker = self.worker.clone().expect("authenticated session has worker");
		let full_name = format!("{}.{}", session_worker.user_name, worker_name);
		let worker = WorkerIdentity {
			user_id: session_worker.user_id,
			worker_hash_id: worker_hash_id(&worker_name),
			user_name: session_worker.user_name,
			worker_name,
			full_name,
		};
		debug!(
			"agent registered worker, subSession: {}, worker: {}",
			session_id, worker.full_name
		);
		agent.workers.insert(
			session_id,
			AgentWorker {
				worker,
				diff_controller: DiffController::new(&self.ctx.config),
				last_sent_diff: 0,
			},
		);
	}

	fn agent_submit(
		&mut self,
		agent: &mut AgentDispatcher,
		body: &[u8],
		with_time: bool,
	) -> Vec<StratumOut> {
		let mut reader = BodyReader::new(body);
		let parsed = (|| {
			let job_id = reader.read_u8()?;
			let session_id = reader.read_u16()?;
			let extra_nonce2 = reader.read_u32()?;
			let nonce = reader.read_u32()?;
			let n_time = if with_time { reader.read_u32()? } else { 0 };
			Some((job_id, session_id, extra_nonce2, nonce, n_time))
		})();
		let (short_job_id, session_id, extra_nonce2, nonce, n_time) = match parsed {
			Some(p) => p,
			None => {
				debug!("malformed agent submit, dropping");
				return Vec::new();
			}
		};

		let now = self.now();
		let agent_worker = match agent.workers.get_mut(&session_id) {
			Some(w) => w,
			None => {
				debug!("agent submit for unknown subSession {}", session_id);
				self.invalid_shares.insert(now, 1);
				return Vec::new();
			}
		};

		// the downstream extra nonce widens to the full 8 bytes with the
		// sub-session id in the upper half
		let full_extra_nonce2 = ((session_id as u64) << 32) | extra_nonce2 as u64;

		enum Lookup {
			Found(u64, u64),
			Duplicate,
			NotFound,
		}
		let lookup = match self.local_jobs.find_by_short_id(short_job_id) {
			Some(local_job) => {
				let tuple = LocalShare {
					extra_nonce2: full_extra_nonce2,
					n_time,
					version_mask: 0,
				};
				if local_job.add_local_share(tuple) {
					Lookup::Found(local_job.job_id, local_job.job_difficulty)
				} else {
					Lookup::Duplicate
				}
			}
			None => Lookup::NotFound,
		};
		let (job_id, session_difficulty) = match lookup {
			Lookup::Found(job_id, diff) => (job_id, diff),
			Lookup::Duplicate | Lookup::NotFound => {
				self.invalid_shares.insert(now, 1);
				return Vec::new();
			}
		};

		let exjob = match self.ctx.repository.get_job(job_id) {
			Some(e) => e,
			None => {
				self.invalid_shares.insert(now, 1);
				return Vec::new();
			}
		};
		let job = match exjob.job.as_ref() {
			StratumJob::Bitcoin(j) => j,
			_ => return Vec::new(),
		};

		// the difficulty in force for this downstream miner is whatever
		// SET_DIFF last delivered, the session difficulty before that
		let share_difficulty = if agent_worker.last_sent_diff != 0 {
			agent_worker.last_sent_diff
		} else {
			session_difficulty
		};
		let n_time = if n_time != 0 { n_time } else { job.n_time };

		let check = ShareCheck::Bitcoin {
			job,
			job_is_stale: exjob.is_stale(),
			extra_nonce1: self.extra_nonce1,
			extra_nonce2: full_extra_nonce2,
			n_time,
			nonce,
			version_bits: 0,
			share_target: diff_to_target(share_difficulty),
			now,
		};
		let result = self.ctx.validator.check_share(&check);

		let share = ShareBitcoin {
			version: BITCOIN_SHARE_VERSION,
			job_id,
			worker_hash_id: agent_worker.worker.worker_hash_id,
			user_id: agent_worker.worker.user_id,
			status: result.status,
			timestamp: now,
			ip: IpAddress::from_ip(self.peer.ip()),
			share_diff: share_difficulty,
			blk_bits: job.n_bits,
			height: job.height as u32,
			nonce,
			session_id: self.extra_nonce1,
			extra_nonce2: full_extra_nonce2,
			n_time,
			version_mask: 0,
		};

		let publish;
		if result.status.is_accepted() {
			if result.status.is_solved() {
				self.ctx.pipeline.publish_solved_bitcoin(
					job_id,
					job.height,
					result.header_hex.as_deref().unwrap_or(""),
					result.coinbase_hex.as_deref().unwrap_or(""),
					&agent_worker.worker,
				);
			}
			agent_worker.diff_controller.add_accepted_share(now);
			publish = true;
		} else {
			self.invalid_shares.insert(now, 1);
			publish = self.invalid_shares.sum(now)
				< orepool_core::consensus::INVALID_SHARE_SLIDING_WINDOWS_MAX_LIMIT;
		}
		self.ctx.pipeline.handle_share(&Share::Bitcoin(share), publish);

		// the agent protocol carries no per-share replies; errors only
		// show up in the share log
		Vec::new()
	}

	/// SET_DIFF frames for downstream miners whose controller moved,
	/// grouped by new difficulty. Called right after a notify is built.
	pub(crate) fn agent_set_diff_frames(&mut self, now: u64) -> Vec<StratumOut> {
		let mut agent = match &mut self.chain {
			ChainSession::Bitcoin(data) => match data.agent.take() {
				Some(a) => a,
				None => return Vec::new(),
			},
			_ => return Vec::new(),
		};

		let mut groups: HashMap<u64, Vec<u16>> = HashMap::new();
		for (session_id, worker) in agent.workers.iter_mut() {
			let diff = worker.diff_controller.calc_cur_diff(now);
			if diff != worker.last_sent_diff {
				worker.last_sent_diff = diff;
				groups.entry(diff).or_insert_with(Vec::new).push(*session_id);
			}
		}

		let mut outs = Vec::new();
		for (diff, session_ids) in groups {
			// difficulties are powers of two, sent as the exponent
			let exponent = 63 - diff.max(1).leading_zeros() as u8;
			let mut body = Vec::with_capacity(3 + session_ids.len() * 2);
			body.push(exponent);
			body.extend_from_slice(&(session_ids.len() as u16).to_le_bytes());
			for session_id in session_ids {
				body.extend_from_slice(&session_id.to_le_bytes());
			}
			outs.push(StratumOut::Raw(
				ExMessage {
					command: CMD_MINING_SET_DIFF,
					body,
				}
				.to_frame(),
			));
		}

		if let ChainSession::Bitcoin(data) = &mut self.chain {
			data.agent = Some(agent);
		}
		outs
	}
}
