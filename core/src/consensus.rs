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

//! Pool-wide constants. Values that several components must agree on live
//! here rather than in any single component's config.

/// Number of extra nonce bytes reserved for the pool in the coinbase
/// scriptSig. The session id (extraNonce1) is written into these.
pub const EXTRA_NONCE1_SIZE: usize = 4;

/// Number of extra nonce bytes the miner enumerates freely.
pub const EXTRA_NONCE2_SIZE: usize = 8;

/// Byte value of the extra nonce placeholder inside the coinbase
/// transaction template. coinbase1/coinbase2 are split around a run of
/// these bytes.
pub const EXTRA_NONCE_PLACEHOLDER_BYTE: u8 = 0xEE;

/// Hard cap on the serialized coinbase transaction. Exceeding it is a
/// structural failure of the pool configuration, not a recoverable error.
pub const COINBASE_TX_MAX_SIZE: usize = 1024;

/// Coinbase scriptSig must stay in (2, 100) bytes or bitcoind rejects the
/// block with bad-cb-length.
pub const COINBASE_SCRIPT_SIG_MAX_SIZE: usize = 100;

/// Merged mining magic placed in the coinbase scriptSig before the aux
/// block hash: 0xfa 0xbe 'm' 'm'.
pub const MERGED_MINING_MAGIC: [u8; 4] = [0xfa, 0xbe, 0x6d, 0x6d];

/// Tag prefixing the RSK block hash in its coinbase output: "RSKBLOCK:".
pub const RSK_BLOCK_TAG: &[u8] = b"RSKBLOCK:";

/// The job maker refuses templates whose creation time deviates from
/// wall clock by this many seconds or more.
pub const GBT_MAX_TIME_DEVIATION: i64 = 60;

/// Aux-pow gateway messages older than this many seconds are stale.
pub const AUX_POW_MAX_AGE: u64 = 60;

/// Sidechain (RSK) work expires out of its slot after this many seconds.
pub const SIDECHAIN_WORK_MAX_AGE: u64 = 120;

/// Size of the recent-gbt-hash dedup deque in the job maker.
pub const GBT_HASH_DEDUP_WINDOW: usize = 20;

/// Size in seconds of the invalid share sliding window kept per session.
pub const INVALID_SHARE_SLIDING_WINDOWS_SIZE: u64 = 60;

/// Once the invalid share window sums past this limit, invalid shares are
/// no longer published to the share topic (the miner still gets replies).
pub const INVALID_SHARE_SLIDING_WINDOWS_MAX_LIMIT: u64 = 20;

/// Largest downstream session id the agent sub-protocol may register.
pub const AGENT_MAX_SESSION_ID: u16 = 0xFFFE;

/// Block heights must stay below this so they pack into the 31 height
/// bits of a template cache key.
pub const MAX_TEMPLATE_HEIGHT: u32 = 0x7FFF_FFFF;
