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

//! The acceptor: owns the listening socket, allocates session ids
//! (extraNonce1) and spawns one task per connection. Everything a
//! session needs reaches it through the explicit `PoolContext`; there
//! are no hidden globals.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::common::stats::ServerStateInfo;
use crate::common::types::StratumConfig;
use crate::mining::pipeline::SharePipeline;
use crate::mining::repository::JobRepository;
use crate::mining::session::Session;
use crate::mining::validator::ShareValidator;
use crate::mining::{DuplicateShareChecker, UserAuthenticator};
use orepool_util::{Mutex, StopState};

/// Allocator for the 24-bit session ids embedded in coinbase work. No
/// two live sessions may hold the same id.
pub struct SessionIdRegistry {
	inner: Mutex<SessionIdInner>,
	capacity: usize,
}

struct SessionIdInner {
	next: u32,
	used: HashSet<u32>,
}

/// The id space is 24 bits.
const SESSION_ID_MASK: u32 = 0x00ff_ffff;

impl SessionIdRegistry {
	/// Registry bounded to `capacity` live sessions.
	pub fn new(capacity: usize) -> SessionIdRegistry {
		SessionIdRegistry {
			inner: Mutex::new(SessionIdInner {
				next: 0,
				used: HashSet::new(),
			}),
			capacity: capacity.min(SESSION_ID_MASK as usize),
		}
	}

	/// Claim a free id, None when the server is full.
	pub fn alloc(&self) -> Option<u32> {
		let mut inner = self.inner.lock();
		if inner.used.len() >= self.capacity {
			return None;
		}
		// linear probe from the rolling cursor; the id space is far
		// larger than the session cap so this terminates quickly
		loop {
			let id = inner.next & SESSION_ID_MASK;
			inner.next = inner.next.wrapping_add(1);
			if inner.used.insert(id) {
				return Some(id);
			}
		}
	}

	/// Release an id on session teardown.
	pub fn free(&self, id: u32) {
		self.inner.lock().used.remove(&id);
	}

	/// Number of live sessions.
	pub fn len(&self) -> usize {
		self.inner.lock().used.len()
	}

	/// Whether no session is connected.
	pub fn is_empty(&self) -> bool {
		self.inner.lock().used.is_empty()
	}
}

/// Shared context handed to every session. Owns nothing session-local;
/// sessions never outlive it.
pub struct PoolContext {
	/// Session engine configuration.
	pub config: StratumConfig,
	/// Live job index.
	pub repository: Arc<JobRepository>,
	/// Share fan-out.
	pub pipeline: Arc<SharePipeline>,
	/// Proof-of-work checker.
	pub validator: Arc<dyn ShareValidator>,
	/// Account system.
	pub authenticator: Arc<dyn UserAuthenticator>,
	/// Cross-session duplicate filter, when the deployment runs one.
	pub dup_share_checker: Option<Arc<dyn DuplicateShareChecker>>,
	/// Server-wide stats.
	pub state: ServerStateInfo,
	/// Cooperative shutdown flag.
	pub stop_state: Arc<StopState>,
	/// extraNonce1 allocator.
	pub session_ids: Arc<SessionIdRegistry>,
}

/// The stratum acceptor.
pub struct StratumServer {
	ctx: Arc<PoolContext>,
}

impl StratumServer {
	/// Assemble the server from its collaborators.
	pub fn new(
		config: StratumConfig,
		repository: Arc<JobRepository>,
		pipeline: Arc<SharePipeline>,
		validator: Arc<dyn ShareValidator>,
		authenticator: Arc<dyn UserAuthenticator>,
		state: ServerStateInfo,
		stop_state: Arc<StopState>,
	) -> StratumServer {
		let session_ids = Arc::new(SessionIdRegistry::new(config.max_sessions));
		StratumServer {
			ctx: Arc::new(PoolContext {
				config,
				repository,
				pipeline,
				validator,
				authenticator,
				dup_share_checker: None,
				state,
				stop_state,
				session_ids,
			}),
		}
	}

	/// Attach a cross-session duplicate share filter. Must be called
	/// before `run`.
	pub fn set_duplicate_share_checker(&mut self, checker: Arc<dyn DuplicateShareChecker>) {
		let ctx = Arc::get_mut(&mut self.ctx)
			.expect("set_duplicate_share_checker must precede session spawn");
		ctx.dup_share_checker = Some(checker);
	}

	/// The shared context, for tests that drive sessions directly.
	pub fn context(&self) -> Arc<PoolContext> {
		self.ctx.clone()
	}

	/// Bind and accept until the stop state flips. Each connection runs
	/// as its own task; a connection that cannot get a session id is
	/// dropped on the floor.
	pub async fn run(&self) -> Result<(), std::io::Error> {
		let listener = TcpListener::bind(&self.ctx.config.listen_addr).await?;
		warn!("stratum server started on {}", self.ctx.config.listen_addr);
		{
			let mut stats = self.ctx.state.stratum_stats.write();
			stats.is_running = true;
		}

		loop {
			if self.ctx.stop_state.is_stopped() {
				break;
			}
			let (stream, peer) = tokio::select! {
				accepted = listener.accept() => match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!("error accepting connection: {}", e);
						continue;
					}
				},
				_ = tokio::time::sleep(std::time::Duration::from_millis(250)) => continue,
			};

			let extra_nonce1 = match self.ctx.session_ids.alloc() {
				Some(id) => id,
				None => {
					warn!("server full, dropping connection from {}", peer);
					continue;
				}
			};

			debug!("new connection: {}, sessionId: {:08x}", peer, extra_nonce1);
			let ctx = self.ctx.clone();
			tokio::spawn(async move {
				Session::run(ctx.clone(), stream, peer, extra_nonce1).await;
				ctx.session_ids.free(extra_nonce1);
				let mut stats = ctx.state.stratum_stats.write();
				stats.num_sessions = ctx.session_ids.len();
			});

			let mut stats = self.ctx.state.stratum_stats.write();
			stats.num_sessions = self.ctx.session_ids.len();
		}

		warn!("stratum server stopped");
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn session_ids_are_unique_and_reusable() {
		let reg = SessionIdRegistry::new(4);
		let a = reg.alloc().unwrap();
		let b = reg.alloc().unwrap();
		let c = reg.alloc().unwrap();
		let d = reg.alloc().unwrap();
		assert_eq!(reg.alloc(), None);
		let ids: HashSet<u32> = [a, b, c, d].iter().cloned().collect();
		assert_eq!(ids.len(), 4);

		reg.free(b);
		let e = reg.alloc().unwrap();
		assert!(!reg.is_empty());
		assert_eq!(reg.len(), 4);
		// the freed id is the only one that can come back
		assert!(e == b || !ids.contains(&e));
	}

	#[test]
	fn ids_stay_in_24_bits() {
		let reg = SessionIdRegistry::new(100);
		for _ in 0..100 {
			assert!(reg.alloc().unwrap() <= SESSION_ID_MASK);
		}
	}
}
