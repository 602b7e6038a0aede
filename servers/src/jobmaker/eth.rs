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

//! The ethereum job maker handler. The gateway hands over finished
//! header work, so this handler only tracks the freshest work unit and
//! decides when a new job is worth publishing: on new work, or when the
//! job interval lapses.

use crate::common::types::JobMakerConfig;
use crate::jobmaker::JobMakerHandler;
use orepool_core::job::{StratumJob, StratumJobEth};

/// Ethereum half of the job maker.
pub struct JobMakerHandlerEth {
	config: JobMakerConfig,
	/// freshest getwork message, verbatim
	latest_gw: Option<String>,
	/// header of the last published job, to skip republishing identical
	/// work
	last_header: String,
	last_height: u64,
	last_job_send_time: u64,
}

impl JobMakerHandlerEth {
	/// Build the handler.
	pub fn new(config: JobMakerConfig) -> JobMakerHandlerEth {
		JobMakerHandlerEth {
			config,
			latest_gw: None,
			last_header: String::new(),
			last_height: 0,
			last_job_send_time: 0,
		}
	}
}

impl JobMakerHandler for JobMakerHandlerEth {
	fn process_raw_template(&mut self, msg: &str, now: u64) -> bool {
		// validate before keeping; a bad message must not evict good work
		let job = match StratumJobEth::init_from_gw(msg, self.config.server_id, now) {
			Ok(j) => j,
			Err(e) => {
				error!("parse eth getwork fail: {}", e);
				return false;
			}
		};
		self.latest_gw = Some(msg.to_string());
		// new height or a different header at the same height both mean
		// fresh work
		job.height > self.last_height || job.header_hash != self.last_header
	}

	fn make_stratum_job_msg(&mut self, now: u64) -> Option<String> {
		let gw = self.latest_gw.as_ref()?;
		let job = match StratumJobEth::init_from_gw(gw, self.config.server_id, now) {
			Ok(j) => j,
			Err(e) => {
				error!("init eth stratum job fail: {}", e);
				return None;
			}
		};

		let fresh_work = job.height > self.last_height || job.header_hash != self.last_header;
		let timeout = self.last_job_send_time + self.config.job_interval_secs <= now;
		if !fresh_work && !timeout {
			return None;
		}

		self.last_header = job.header_hash.clone();
		self.last_height = job.height;
		self.last_job_send_time = now;

		info!(
			"--------produce eth stratum job, jobId: {}, height: {}--------",
			job.job_id, job.height
		);
		Some(StratumJob::Eth(job).serialize_to_json())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn gw(height: u64, header_byte: u8) -> String {
		format!(
			"{{\"height\":{},\"header\":\"0x{}\",\"seed\":\"0x{}\",\
			 \"target\":\"0x0000000112e0be826d694b2e62d01511f12a6061fbaec8bc02357593e70e52ba\"}}",
			height,
			orepool_util::to_hex(&[header_byte; 32]),
			orepool_util::to_hex(&[0x22u8; 32]),
		)
	}

	#[test]
	fn publishes_on_new_work_and_interval() {
		let mut h = JobMakerHandlerEth::new(JobMakerConfig::default());
		assert!(h.make_stratum_job_msg(1000).is_none());

		assert!(h.process_raw_template(&gw(100, 1), 1000));
		assert!(h.make_stratum_job_msg(1000).is_some());

		// identical work inside the interval: nothing
		assert!(!h.process_raw_template(&gw(100, 1), 1001));
		assert!(h.make_stratum_job_msg(1001).is_none());

		// new header at same height is fresh work
		assert!(h.process_raw_template(&gw(100, 2), 1002));
		assert!(h.make_stratum_job_msg(1002).is_some());

		// and the interval alone republishes
		assert!(h.make_stratum_job_msg(1002 + 30).is_some());
	}

	#[test]
	fn malformed_getwork_keeps_previous_work() {
		let mut h = JobMakerHandlerEth::new(JobMakerConfig::default());
		assert!(h.process_raw_template(&gw(100, 1), 1000));
		assert!(!h.process_raw_template("garbage", 1001));
		assert!(h.make_stratum_job_msg(1000).is_some());
	}
}
