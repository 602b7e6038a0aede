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

//! The downstream half of share handling: worker statistics, the share
//! topic and the solved-block topic. Sessions classify; the pipeline
//! records and publishes.

use std::sync::Arc;

use serde_json::json;

use crate::common::stats::ServerStateInfo;
use crate::common::topics::TopicPublisher;
use crate::mining::WorkerIdentity;
use orepool_core::Share;

/// Share fan-out shared by every session of a server instance.
pub struct SharePipeline {
	share_topic: Arc<dyn TopicPublisher>,
	solved_topic: Arc<dyn TopicPublisher>,
	state: ServerStateInfo,
}

impl SharePipeline {
	/// Wire the pipeline to its topics.
	pub fn new(
		share_topic: Arc<dyn TopicPublisher>,
		solved_topic: Arc<dyn TopicPublisher>,
		state: ServerStateInfo,
	) -> Arc<SharePipeline> {
		Arc::new(SharePipeline {
			share_topic,
			solved_topic,
			state,
		})
	}

	/// Fold the share into the worker counters and, unless suppressed by
	/// the invalid-share limiter, publish its binary record.
	pub fn handle_share(&self, share: &Share, publish: bool) {
		self.state.process_share(share);
		if publish {
			self.share_topic.publish(share.to_record());
		}
	}

	/// Publish a solved bitcoin block: enough for the block submitter to
	/// assemble and broadcast it.
	pub fn publish_solved_bitcoin(
		&self,
		job_id: u64,
		height: i32,
		header_hex: &str,
		coinbase_hex: &str,
		worker: &WorkerIdentity,
	) {
		let msg = json!({
			"createdAt": chrono::Utc::now().format("%F %T").to_string(),
			"jobId": job_id,
			"height": height,
			"headerHex": header_hex,
			"coinbaseTx": coinbase_hex,
			"userId": worker.user_id,
			"workerId": worker.worker_hash_id,
			"workerFullName": worker.full_name,
		});
		self.solved_topic.publish(msg.to_string().into_bytes());
		warn!(
			"solved share found!! height: {}, worker: {}",
			height, worker.full_name
		);
	}

	/// Publish a solved ethereum block.
	pub fn publish_solved_eth(
		&self,
		nonce_hex: &str,
		header_hex: &str,
		mix_hex: &str,
		height: u64,
		network_diff: u64,
		worker: &WorkerIdentity,
	) {
		let msg = json!({
			"createdAt": chrono::Utc::now().format("%F %T").to_string(),
			"nonce": nonce_hex,
			"header": header_hex,
			"mix": mix_hex,
			"height": height,
			"networkDiff": network_diff,
			"userId": worker.user_id,
			"workerId": worker.worker_hash_id,
			"workerFullName": worker.full_name,
		});
		self.solved_topic.publish(msg.to_string().into_bytes());
		warn!(
			"solved share found!! height: {}, worker: {}",
			height, worker.full_name
		);
	}
}
