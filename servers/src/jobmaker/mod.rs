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

//! The job maker: drains the upstream gateway streams, keeps the
//! freshest viable template, and publishes stratum jobs to the job topic
//! on the publication rules of its chain handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::common::topics::TopicPublisher;
use crate::common::unix_now;
use orepool_util::StopState;

pub mod bitcoin;
pub mod eth;

pub use self::bitcoin::JobMakerHandlerBitcoin;
pub use self::eth::JobMakerHandlerEth;

/// Chain-specific half of the job maker. Handlers are driven from a
/// single task, so they keep plain mutable state; the framework provides
/// the streams, the timer and the topic.
pub trait JobMakerHandler: Send {
	/// Digest one raw template message. Returns true when publication
	/// triggers should be evaluated right away.
	fn process_raw_template(&mut self, msg: &str, now: u64) -> bool;

	/// Digest one aux-pow gateway message. Returns true when the update
	/// warrants an immediate job.
	fn process_aux_work(&mut self, _msg: &str, _now: u64) -> bool {
		false
	}

	/// Digest one sidechain work message. Returns true when the update
	/// warrants an immediate job.
	fn process_sidechain_work(&mut self, _msg: &str, _now: u64) -> bool {
		false
	}

	/// Evaluate the publication rules and, when a job is due, build the
	/// serialized job message.
	fn make_stratum_job_msg(&mut self, now: u64) -> Option<String>;
}

/// Upstream message streams feeding a job maker. Streams the deployment
/// doesn't have simply never produce.
pub struct JobMakerStreams {
	/// Primary chain block templates.
	pub raw_template: mpsc::UnboundedReceiver<String>,
	/// Aux-pow (merge mining) work.
	pub aux_work: mpsc::UnboundedReceiver<String>,
	/// Sidechain (RSK style) work.
	pub sidechain_work: mpsc::UnboundedReceiver<String>,
}

/// The job maker service. One per chain per deployment; every sserver's
/// job repository consumes the topic it publishes into.
pub struct JobMaker<H: JobMakerHandler> {
	handler: H,
	streams: JobMakerStreams,
	job_topic: Arc<dyn TopicPublisher>,
	stop_state: Arc<StopState>,
}

impl<H: JobMakerHandler> JobMaker<H> {
	/// Wire a job maker out of its handler, streams and output topic.
	pub fn new(
		handler: H,
		streams: JobMakerStreams,
		job_topic: Arc<dyn TopicPublisher>,
		stop_state: Arc<StopState>,
	) -> JobMaker<H> {
		JobMaker {
			handler,
			streams,
			job_topic,
			stop_state,
		}
	}

	fn try_publish(&mut self, now: u64) {
		if let Some(msg) = self.handler.make_stratum_job_msg(now) {
			self.job_topic.publish(msg.into_bytes());
		}
	}

	/// Drive the job maker until the stop state flips. Malformed
	/// messages are logged and dropped; loss of a stream leaves the
	/// timer-driven publication running.
	pub async fn run(mut self) {
		info!("jobmaker started");
		// short tick so both the publication interval and the stop flag
		// are honored promptly
		let mut ticker = tokio::time::interval(Duration::from_secs(1));
		loop {
			if self.stop_state.is_stopped() {
				break;
			}
			tokio::select! {
				Some(msg) = self.streams.raw_template.recv() => {
					let now = unix_now();
					if self.handler.process_raw_template(&msg, now) {
						self.try_publish(now);
					}
				}
				Some(msg) = self.streams.aux_work.recv() => {
					let now = unix_now();
					if self.handler.process_aux_work(&msg, now) {
						self.try_publish(now);
					}
				}
				Some(msg) = self.streams.sidechain_work.recv() => {
					let now = unix_now();
					if self.handler.process_sidechain_work(&msg, now) {
						self.try_publish(now);
					}
				}
				_ = ticker.tick() => {
					self.try_publish(unix_now());
				}
			}
		}
		info!("jobmaker stopped");
	}
}
