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

//! Per-miner adaptive difficulty. The controller watches the observed
//! share rate through an exponentially weighted average and steers the
//! session difficulty so the rate converges on the configured seconds
//! per share. Changes are applied when the session asks for the current
//! difficulty ahead of a notify, never mid-job.

use orepool_core::target::format_difficulty;

use crate::common::types::StratumConfig;

/// How many share-interval lengths the rate must be integrated over
/// before the controller moves the difficulty again.
const ADJUST_HOLDOFF_FACTOR: u64 = 4;

/// Per-session (or per agent sub-session) difficulty controller.
#[derive(Debug, Clone)]
pub struct DiffController {
	min_diff: u64,
	max_diff: u64,
	cur_diff: u64,
	/// floor suggested via mining.configure, 0 when unset
	suggested_min_diff: u64,
	/// target seconds between shares
	share_avg_seconds: f64,
	/// EWMA of shares per second
	rate: f64,
	/// EWMA time constant, seconds
	tau: f64,
	last_rate_update: u64,
	last_adjust_time: u64,
	started: bool,
}

impl DiffController {
	/// Controller with the pool's clamps and the session default.
	pub fn new(config: &StratumConfig) -> DiffController {
		let share_avg = config.share_avg_seconds.max(1) as f64;
		DiffController {
			min_diff: format_difficulty(config.min_difficulty),
			max_diff: format_difficulty(config.max_difficulty),
			cur_diff: format_difficulty(config.default_difficulty),
			suggested_min_diff: 0,
			share_avg_seconds: share_avg,
			rate: 0.0,
			tau: share_avg * ADJUST_HOLDOFF_FACTOR as f64,
			last_rate_update: 0,
			last_adjust_time: 0,
			started: false,
		}
	}

	fn decay_rate(&mut self, now: u64) {
		if !self.started {
			return;
		}
		let dt = now.saturating_sub(self.last_rate_update) as f64;
		if dt > 0.0 {
			self.rate *= (-dt / self.tau).exp();
			self.last_rate_update = now;
		}
	}

	/// Record an accepted share at `now`.
	pub fn add_accepted_share(&mut self, now: u64) {
		if !self.started {
			self.started = true;
			self.last_rate_update = now;
			self.last_adjust_time = now;
		}
		self.decay_rate(now);
		// one share contributes 1/tau so a steady rate integrates to
		// shares-per-second
		self.rate += 1.0 / self.tau;
	}

	fn floor(&self) -> u64 {
		self.min_diff.max(self.suggested_min_diff)
	}

	/// Current difficulty, moving it first when the observed rate has
	/// strayed past double or half the target over a full holdoff
	/// window. Sessions call this right before building a notify.
	pub fn calc_cur_diff(&mut self, now: u64) -> u64 {
		self.decay_rate(now);
		let target_rate = 1.0 / self.share_avg_seconds;
		let holdoff = self.share_avg_seconds as u64 * ADJUST_HOLDOFF_FACTOR;

		if self.started && now.saturating_sub(self.last_adjust_time) >= holdoff {
			if self.rate > target_rate * 2.0 && self.cur_diff < self.max_diff {
				self.cur_diff = (self.cur_diff.saturating_mul(2)).min(self.max_diff);
				self.last_adjust_time = now;
			} else if self.rate < target_rate / 2.0 && self.cur_diff > self.floor() {
				self.cur_diff = (self.cur_diff / 2).max(self.floor());
				self.last_adjust_time = now;
			}
		}

		self.cur_diff = self.cur_diff.max(self.floor()).min(self.max_diff);
		self.cur_diff
	}

	/// Honor a minimum-difficulty request from mining.configure. The
	/// suggestion only ever raises the floor, never past the pool cap.
	pub fn set_min_diff(&mut self, diff: u64) {
		self.suggested_min_diff = format_difficulty(diff).min(self.max_diff);
	}

	/// Honor mining.suggest_difficulty: jump straight to the suggested
	/// value, clamped.
	pub fn set_cur_diff(&mut self, diff: u64) {
		self.cur_diff = format_difficulty(diff).max(self.floor()).min(self.max_diff);
	}

	/// Difficulty currently assigned, without adjusting.
	pub fn cur_diff(&self) -> u64 {
		self.cur_diff
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn config() -> StratumConfig {
		let mut cfg = StratumConfig::default();
		cfg.share_avg_seconds = 10;
		cfg.default_difficulty = 16384;
		cfg.min_difficulty = 64;
		cfg.max_difficulty = 1 << 40;
		cfg
	}

	#[test]
	fn starts_at_default() {
		let mut dc = DiffController::new(&config());
		assert_eq!(dc.calc_cur_diff(0), 16384);
	}

	#[test]
	fn doubles_when_shares_flood_in() {
		let mut dc = DiffController::new(&config());
		// a share every second against a 10s target
		let mut now = 1000;
		for _ in 0..200 {
			dc.add_accepted_share(now);
			now += 1;
		}
		let diff = dc.calc_cur_diff(now);
		assert_eq!(diff, 32768);
		// and no second jump before the holdoff passes
		assert_eq!(dc.calc_cur_diff(now + 1), 32768);
		// but it keeps climbing while the flood continues
		for _ in 0..100 {
			dc.add_accepted_share(now);
			now += 1;
		}
		assert_eq!(dc.calc_cur_diff(now), 65536);
	}

	#[test]
	fn halves_when_shares_dry_up() {
		let mut dc = DiffController::new(&config());
		dc.add_accepted_share(1000);
		// nothing for a long while: rate decays towards zero
		let diff = dc.calc_cur_diff(1000 + 600);
		assert_eq!(diff, 8192);
	}

	#[test]
	fn clamps_to_floor_and_cap() {
		let mut dc = DiffController::new(&config());
		dc.add_accepted_share(0);
		// decay to nothing over and over: never below min_diff
		let mut now = 0;
		for _ in 0..100 {
			now += 1000;
			dc.calc_cur_diff(now);
		}
		assert_eq!(dc.cur_diff(), 64);
	}

	#[test]
	fn suggested_minimum_is_honored() {
		let mut dc = DiffController::new(&config());
		dc.set_min_diff(1 << 20);
		assert_eq!(dc.calc_cur_diff(0), 1 << 20);
		// and the rate can't pull it below the suggestion
		dc.add_accepted_share(0);
		assert_eq!(dc.calc_cur_diff(100_000), 1 << 20);
	}

	#[test]
	fn suggest_difficulty_jumps_directly() {
		let mut dc = DiffController::new(&config());
		dc.set_cur_diff(5000);
		// rounded up to a power of two
		assert_eq!(dc.cur_diff(), 8192);
	}
}
