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

//! One task per miner connection. The task owns the socket, so every
//! write - replies, difficulty pushes, job notifies - is serialized by
//! construction; a set_difficulty queued before a notify can never be
//! reordered past it. Job announcements arrive over the repository's
//! broadcast channel; a session that lags simply fetches the latest job,
//! which is exactly the notify coalescing the backpressure rules call
//! for.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::codec::Framed;

use crate::common::stats::StatsWindow;
use crate::common::types::ChainType;
use crate::common::unix_now;
use crate::mining::agent::AgentDispatcher;
use crate::mining::codec::{ExMessage, StratumCodec, StratumFrame, StratumOut};
use crate::mining::difficulty::DiffController;
use crate::mining::repository::StratumJobEx;
use crate::mining::server::PoolContext;
use crate::mining::{LocalJobs, WorkerIdentity};
use orepool_core::consensus::{
	INVALID_SHARE_SLIDING_WINDOWS_MAX_LIMIT, INVALID_SHARE_SLIDING_WINDOWS_SIZE,
};
use orepool_core::StratumStatus;

/// Maximum client agent string length kept for logs and share records.
const MAX_CLIENT_AGENT_LEN: usize = 30;

/// Session protocol state. Transitions are monotonic; nothing ever moves
/// a session backwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
	/// TCP accepted, nothing spoken yet.
	Connected,
	/// Subscribe exchanged.
	Subscribed,
	/// Worker authorized; the session receives jobs.
	Authenticated,
}

/// Ethereum protocol flavor, sniffed at subscribe/login time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EthProtocol {
	/// Claymore-style eth_submitLogin / eth_getWork / eth_submitWork.
	EthProxy,
	/// Generic stratum with mining.notify.
	Stratum,
	/// EthereumStratum/1.0.0.
	NiceHash,
}

impl EthProtocol {
	/// Protocol name for logs.
	pub fn name(self) -> &'static str {
		match self {
			EthProtocol::EthProxy => "ETHPROXY",
			EthProtocol::Stratum => "STRATUM",
			EthProtocol::NiceHash => "NICEHASH_STRATUM",
		}
	}
}

/// Bitcoin-dialect session state.
pub struct BitcoinSessionData {
	/// rotating short job id
	pub short_job_id_idx: u8,
	/// version bits the miner asked to roll, already intersected with
	/// the pool mask
	pub version_mask: u32,
	/// NiceHash clients need globally unique job ids
	pub is_nicehash: bool,
	/// agent sub-protocol dispatcher, created on first agent frame
	pub agent: Option<AgentDispatcher>,
}

impl BitcoinSessionData {
	fn new() -> BitcoinSessionData {
		BitcoinSessionData {
			short_job_id_idx: 0,
			version_mask: 0,
			is_nicehash: false,
			agent: None,
		}
	}

	/// Next short job id, cycling through [0, 10).
	pub fn alloc_short_job_id(&mut self) -> u8 {
		if self.short_job_id_idx >= 10 {
			self.short_job_id_idx = 0;
		}
		let id = self.short_job_id_idx;
		self.short_job_id_idx += 1;
		id
	}
}

/// Ethereum-dialect session state.
pub struct EthSessionData {
	/// sniffed protocol; ETHPROXY until a subscribe says otherwise
	pub protocol: EthProtocol,
	/// difficulty last pushed to a NiceHash client, resent only on
	/// change
	pub nicehash_last_sent_diff: u64,
	/// rotating short job id
	pub short_job_id_idx: u8,
}

impl EthSessionData {
	fn new() -> EthSessionData {
		EthSessionData {
			protocol: EthProtocol::EthProxy,
			nicehash_last_sent_diff: 0,
			short_job_id_idx: 0,
		}
	}

	/// Next short job id, cycling through [0, 10).
	pub fn alloc_short_job_id(&mut self) -> u8 {
		if self.short_job_id_idx >= 10 {
			self.short_job_id_idx = 0;
		}
		let id = self.short_job_id_idx;
		self.short_job_id_idx += 1;
		id
	}
}

/// Per-dialect state, selected by the chain the server serves.
pub enum ChainSession {
	/// SHA256 generic stratum plus the agent sub-protocol.
	Bitcoin(BitcoinSessionData),
	/// The three ethereum flavors.
	Eth(EthSessionData),
}

/// A miner connection.
pub struct Session {
	pub(crate) ctx: Arc<PoolContext>,
	pub(crate) peer: SocketAddr,
	pub(crate) extra_nonce1: u32,
	pub(crate) state: SessionState,
	pub(crate) client_agent: String,
	pub(crate) worker: Option<WorkerIdentity>,
	pub(crate) diff_controller: DiffController,
	pub(crate) local_jobs: LocalJobs,
	pub(crate) invalid_shares: StatsWindow,
	pub(crate) last_sent_diff: u64,
	pub(crate) chain: ChainSession,
}

impl Session {
	fn new(ctx: Arc<PoolContext>, peer: SocketAddr, extra_nonce1: u32) -> Session {
		let chain = match ctx.config.chain {
			ChainType::Bitcoin => ChainSession::Bitcoin(BitcoinSessionData::new()),
			ChainType::Eth => ChainSession::Eth(EthSessionData::new()),
		};
		let diff_controller = DiffController::new(&ctx.config);
		let local_jobs = LocalJobs::new(ctx.config.local_job_window);
		Session {
			ctx,
			peer,
			extra_nonce1,
			state: SessionState::Connected,
			client_agent: String::new(),
			worker: None,
			diff_controller,
			local_jobs,
			invalid_shares: StatsWindow::new(INVALID_SHARE_SLIDING_WINDOWS_SIZE as usize, 1),
			last_sent_diff: 0,
			chain,
		}
	}

	/// Drive one connection to completion.
	pub async fn run(
		ctx: Arc<PoolContext>,
		stream: TcpStream,
		peer: SocketAddr,
		extra_nonce1: u32,
	) {
		let mut framed = Framed::new(stream, StratumCodec::default());
		let mut job_rx = ctx.repository.subscribe();
		let idle_timeout = Duration::from_secs(ctx.config.idle_timeout_secs.max(1));
		let mut session = Session::new(ctx, peer, extra_nonce1);
		let mut last_activity = Instant::now();

		loop {
			if session.ctx.stop_state.is_stopped() {
				break;
			}
			let idle_deadline = last_activity + idle_timeout;
			let outs = tokio::select! {
				frame = framed.next() => match frame {
					Some(Ok(StratumFrame::Line(line))) => {
						last_activity = Instant::now();
						match session.handle_line(&line).await {
							Ok(outs) => outs,
							Err(e) => {
								warn!(
									"session {:08x} protocol error: {}, closing",
									extra_nonce1, e
								);
								break;
							}
						}
					}
					Some(Ok(StratumFrame::Ex(msg))) => {
						last_activity = Instant::now();
						session.handle_ex_message(msg)
					}
					Some(Err(e)) => {
						warn!("session {:08x} read error: {}", extra_nonce1, e);
						break;
					}
					None => break,
				},
				job = job_rx.recv() => match job {
					Ok(exjob) => session.handle_new_job(&exjob, false),
					Err(RecvError::Lagged(skipped)) => {
						debug!(
							"session {:08x} lagged {} jobs, coalescing to latest",
							extra_nonce1, skipped
						);
						match session.ctx.repository.latest_job() {
							Some(latest) => session.handle_new_job(&latest, false),
							None => Vec::new(),
						}
					}
					Err(RecvError::Closed) => break,
				},
				_ = tokio::time::sleep_until(idle_deadline) => {
					info!("session {:08x} idle timeout, closing", extra_nonce1);
					break;
				}
			};

			let mut write_failed = false;
			for out in outs {
				if let Err(e) = framed.send(out).await {
					debug!("session {:08x} write error: {}", extra_nonce1, e);
					write_failed = true;
					break;
				}
			}
			if write_failed {
				break;
			}
		}

		// best-effort drain of anything buffered, bounded by a linger
		let _ = tokio::time::timeout(Duration::from_secs(1), framed.flush()).await;
		if session.state == SessionState::Authenticated {
			let mut stats = session.ctx.state.stratum_stats.write();
			stats.num_authenticated = stats.num_authenticated.saturating_sub(1);
		}
		debug!("session {:08x} closed", extra_nonce1);
	}

	/// Handle one JSON-RPC line. An unparseable line is a protocol error
	/// that closes the connection; an unknown method is silently
	/// ignored.
	pub(crate) async fn handle_line(&mut self, line: &str) -> Result<Vec<StratumOut>, String> {
		if line.trim().is_empty() {
			return Ok(Vec::new());
		}
		let root: Value =
			serde_json::from_str(line).map_err(|e| format!("invalid json: {}", e))?;
		let id = root.get("id").cloned().unwrap_or(Value::Null);
		let method = root
			.get("method")
			.and_then(|m| m.as_str())
			.unwrap_or("")
			.to_string();
		let params = root.get("params").cloned().unwrap_or(Value::Null);

		debug!(
			"session {:08x} request, method: {}, state: {:?}",
			self.extra_nonce1, method, self.state
		);

		let is_bitcoin = matches!(self.chain, ChainSession::Bitcoin(_));
		if is_bitcoin {
			self.handle_bitcoin_request(&id, &method, &params).await
		} else {
			self.handle_eth_request(&id, &method, &params, &root).await
		}
	}

	/// Handle one binary agent frame. Only meaningful on SHA256 sessions.
	pub(crate) fn handle_ex_message(&mut self, msg: ExMessage) -> Vec<StratumOut> {
		if matches!(self.chain, ChainSession::Bitcoin(_)) {
			self.handle_agent_message(msg)
		} else {
			debug!(
				"session {:08x} sent agent frame on eth chain, ignoring",
				self.extra_nonce1
			);
			Vec::new()
		}
	}

	/// React to a new job announcement.
	pub(crate) fn handle_new_job(
		&mut self,
		exjob: &Arc<StratumJobEx>,
		is_first_job: bool,
	) -> Vec<StratumOut> {
		if self.state < SessionState::Authenticated {
			return Vec::new();
		}
		if matches!(self.chain, ChainSession::Bitcoin(_)) {
			self.send_mining_notify_bitcoin(exjob, is_first_job)
		} else {
			self.send_mining_notify_eth(exjob, &Value::Null)
		}
	}

	// ------------------------------------------------------------------
	// shared helpers used by both dialects

	pub(crate) fn set_client_agent(&mut self, agent: &str) {
		self.client_agent = agent.chars().take(MAX_CLIENT_AGENT_LEN).collect();
	}

	/// Serialize a request id for hand-formatted replies.
	pub(crate) fn id_str(id: &Value) -> String {
		serde_json::to_string(id).unwrap_or_else(|_| "null".to_string())
	}

	/// Generic stratum success reply.
	pub(crate) fn response_true(id: &Value) -> StratumOut {
		StratumOut::Line(format!(
			"{{\"id\":{},\"result\":true,\"error\":null}}",
			Self::id_str(id)
		))
	}

	/// Generic stratum error reply.
	pub(crate) fn response_error(id: &Value, status: StratumStatus) -> StratumOut {
		StratumOut::Line(format!(
			"{{\"id\":{},\"result\":null,\"error\":[{},\"{}\",null]}}",
			Self::id_str(id),
			status.code(),
			status.message()
		))
	}

	/// JSON-RPC 2.0 success reply (ethereum dialects).
	pub(crate) fn rpc2_response_true(id: &Value) -> StratumOut {
		StratumOut::Line(format!(
			"{{\"id\":{},\"jsonrpc\":\"2.0\",\"result\":true}}",
			Self::id_str(id)
		))
	}

	/// JSON-RPC 2.0 error reply (ethereum dialects).
	pub(crate) fn rpc2_response_error(id: &Value, status: StratumStatus) -> StratumOut {
		StratumOut::Line(format!(
			"{{\"id\":{},\"jsonrpc\":\"2.0\",\"result\":null,\"error\":[{},\"{}\",null]}}",
			Self::id_str(id),
			status.code(),
			status.message()
		))
	}

	/// The reconnect push sent when a miner submits without authorizing;
	/// something is wrong enough on its side that a fresh connection is
	/// the best fix.
	pub(crate) fn client_reconnect() -> StratumOut {
		StratumOut::Line(
			"{\"id\":null,\"method\":\"client.reconnect\",\"params\":[]}".to_string(),
		)
	}

	/// Record an invalid share and say whether publication is still
	/// allowed under the spam limit.
	pub(crate) fn record_invalid_share(&mut self, now: u64) -> bool {
		self.invalid_shares.insert(now, 1);
		let invalid_num = self.invalid_shares.sum(now);
		if invalid_num >= INVALID_SHARE_SLIDING_WINDOWS_MAX_LIMIT {
			warn!(
				"session {:08x} invalid share spamming: {} in window",
				self.extra_nonce1, invalid_num
			);
			false
		} else {
			true
		}
	}

	/// Shared post-authorize steps: promote the state, record the
	/// worker, log, and push the first difficulty + job.
	pub(crate) fn finish_authorize(&mut self, worker: WorkerIdentity) -> Vec<StratumOut> {
		info!(
			"authorize success, userId: {}, workerHashId: {}, workerName: {}, clientAgent: {}, clientIp: {}",
			worker.user_id, worker.worker_hash_id, worker.full_name, self.client_agent, self.peer
		);
		self.worker = Some(worker);
		self.state = SessionState::Authenticated;
		{
			let mut stats = self.ctx.state.stratum_stats.write();
			stats.num_authenticated += 1;
		}
		match self.ctx.repository.latest_job() {
			Some(latest) => self.handle_new_job(&latest, true),
			None => Vec::new(),
		}
	}

	/// Current unix time; separated for the sake of test clocks.
	pub(crate) fn now(&self) -> u64 {
		unix_now()
	}
}
