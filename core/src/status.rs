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

//! The closed taxonomy of share and request outcomes. Every submit ends
//! in exactly one of these, and the numeric codes go out on the wire in
//! JSON-RPC error tuples, so the values are part of the protocol.

use std::fmt;

/// Outcome of a share submission or, for the error variants, of any
/// stratum request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StratumStatus {
	/// Share met the session target.
	Accept,
	/// Share met the session target against a stale job.
	AcceptStale,
	/// Share met the network target: a valid block.
	Solved,
	/// Share met the network target against a stale job.
	SolvedStale,
	/// Rejected without a more specific reason.
	RejectNoReason,
	/// Referenced job is unknown or rotated out (= stale).
	JobNotFound,
	/// Same nonce tuple seen before within the job.
	DuplicateShare,
	/// Proof of work below the session target.
	LowDifficulty,
	/// Submit before successful authorize.
	Unauthorized,
	/// Request that requires a subscription arrived before subscribe.
	NotSubscribed,
	/// Request parameters are malformed.
	IllegalParams,
	/// Worker name failed validation or authentication.
	InvalidUsername,
	/// Session time out of the acceptable range.
	TimeTooOld,
	/// Session time in the future.
	TimeTooNew,
	/// Version rolling mask outside the allowed bits.
	IllegalVerMask,
	/// Subscribe did not carry the session id a switcher must provide.
	ClientIsNotSwitcher,
	/// Anything else.
	Unknown,
}

impl StratumStatus {
	/// Numeric code sent inside JSON-RPC error tuples.
	pub fn code(self) -> i32 {
		match self {
			StratumStatus::Accept => 1,
			StratumStatus::AcceptStale => 2,
			StratumStatus::Solved => 3,
			StratumStatus::SolvedStale => 4,
			StratumStatus::RejectNoReason => 20,
			StratumStatus::JobNotFound => 21,
			StratumStatus::DuplicateShare => 22,
			StratumStatus::LowDifficulty => 23,
			StratumStatus::Unauthorized => 24,
			StratumStatus::NotSubscribed => 25,
			StratumStatus::IllegalParams => 27,
			StratumStatus::InvalidUsername => 29,
			StratumStatus::TimeTooOld => 31,
			StratumStatus::TimeTooNew => 32,
			StratumStatus::IllegalVerMask => 33,
			StratumStatus::ClientIsNotSwitcher => 400,
			StratumStatus::Unknown => 2_147_483_647,
		}
	}

	/// Reverse of `code`, for records read back from the share topic.
	pub fn from_code(code: i32) -> StratumStatus {
		match code {
			1 => StratumStatus::Accept,
			2 => StratumStatus::AcceptStale,
			3 => StratumStatus::Solved,
			4 => StratumStatus::SolvedStale,
			20 => StratumStatus::RejectNoReason,
			21 => StratumStatus::JobNotFound,
			22 => StratumStatus::DuplicateShare,
			23 => StratumStatus::LowDifficulty,
			24 => StratumStatus::Unauthorized,
			25 => StratumStatus::NotSubscribed,
			27 => StratumStatus::IllegalParams,
			29 => StratumStatus::InvalidUsername,
			31 => StratumStatus::TimeTooOld,
			32 => StratumStatus::TimeTooNew,
			33 => StratumStatus::IllegalVerMask,
			400 => StratumStatus::ClientIsNotSwitcher,
			_ => StratumStatus::Unknown,
		}
	}

	/// Whether the share counts towards the worker's accepted work.
	pub fn is_accepted(self) -> bool {
		match self {
			StratumStatus::Accept
			| StratumStatus::AcceptStale
			| StratumStatus::Solved
			| StratumStatus::SolvedStale => true,
			_ => false,
		}
	}

	/// Whether the share is also a valid block.
	pub fn is_solved(self) -> bool {
		match self {
			StratumStatus::Solved | StratumStatus::SolvedStale => true,
			_ => false,
		}
	}

	/// Whether the share was validated against a job that is no longer
	/// the latest.
	pub fn is_stale(self) -> bool {
		match self {
			StratumStatus::AcceptStale | StratumStatus::SolvedStale => true,
			_ => false,
		}
	}

	/// Human readable message placed next to the code in error tuples.
	pub fn message(self) -> &'static str {
		match self {
			StratumStatus::Accept => "Share accepted",
			StratumStatus::AcceptStale => "Share accepted (stale)",
			StratumStatus::Solved => "Share accepted and solved",
			StratumStatus::SolvedStale => "Share accepted and solved (stale)",
			StratumStatus::RejectNoReason => "Share rejected",
			StratumStatus::JobNotFound => "Job not found (=stale)",
			StratumStatus::DuplicateShare => "Duplicate share",
			StratumStatus::LowDifficulty => "Low difficulty",
			StratumStatus::Unauthorized => "Unauthorized worker",
			StratumStatus::NotSubscribed => "Not subscribed",
			StratumStatus::IllegalParams => "Illegal params",
			StratumStatus::InvalidUsername => "Invalid username",
			StratumStatus::TimeTooOld => "Time too old",
			StratumStatus::TimeTooNew => "Time too new",
			StratumStatus::IllegalVerMask => "Invalid version mask",
			StratumStatus::ClientIsNotSwitcher => "Client is not a stratum switcher",
			StratumStatus::Unknown => "Unknown",
		}
	}
}

impl fmt::Display for StratumStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.message())
	}
}
