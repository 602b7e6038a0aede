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

//! 256-bit target arithmetic: compact bits decoding, the bitcoin
//! difficulty-1 reference target, and the ethereum target/difficulty
//! conversions with their NiceHash scaling.

use uint::construct_uint;

construct_uint! {
	/// 256-bit unsigned integer for network and share targets.
	pub struct U256(4);
}

lazy_static! {
	/// The bitcoin difficulty-1 target:
	/// 0x00000000ffff0000000000000000000000000000000000000000000000000000
	pub static ref DIFF1_TARGET: U256 = {
		let mut bytes = [0u8; 32];
		bytes[4] = 0xff;
		bytes[5] = 0xff;
		U256::from_big_endian(&bytes)
	};
}

/// Decode the compact "bits" representation into a full 256-bit target.
/// Overflowing or negative encodings yield zero, matching bitcoind's
/// SetCompact with fNegative/fOverflow treated as invalid.
pub fn bits_to_target(bits: u32) -> U256 {
	let size = (bits >> 24) as usize;
	let mut word = bits & 0x007f_ffff;
	if bits & 0x0080_0000 != 0 {
		// sign bit set, invalid for targets
		return U256::zero();
	}
	if size <= 3 {
		word >>= 8 * (3 - size);
		U256::from(word)
	} else {
		if size > 32 + 3 {
			return U256::zero();
		}
		U256::from(word) << (8 * (size - 3))
	}
}

/// Bitcoin difficulty corresponding to a full target, as the usual
/// truncating ratio against the difficulty-1 target.
pub fn target_to_diff(target: &U256) -> u64 {
	if target.is_zero() {
		return 0;
	}
	(*DIFF1_TARGET / *target).low_u64()
}

/// Share target for a given bitcoin difficulty.
pub fn diff_to_target(diff: u64) -> U256 {
	if diff == 0 {
		return U256::max_value();
	}
	*DIFF1_TARGET / U256::from(diff)
}

/// Ethereum share target for a difficulty: 2^256-1 divided by the
/// difficulty.
pub fn eth_diff_to_target(diff: u64) -> U256 {
	if diff == 0 {
		return U256::max_value();
	}
	U256::max_value() / U256::from(diff)
}

/// Inverse of `eth_diff_to_target`.
pub fn eth_target_to_diff(target: &U256) -> u64 {
	if target.is_zero() {
		return 0;
	}
	(U256::max_value() / *target).low_u64()
}

/// NiceHash publishes ethereum difficulty scaled down by 2^32 and as a
/// float.
pub fn eth_diff_to_nicehash_diff(diff: u64) -> f64 {
	diff as f64 / 4_294_967_296.0
}

/// Fixed-width 64 hex char rendering used in mining.notify targets.
pub fn target_to_hex(target: &U256) -> String {
	let mut bytes = [0u8; 32];
	target.to_big_endian(&mut bytes);
	orepool_util::to_hex(&bytes)
}

/// Parse a 256-bit target from big-endian hex, with or without the "0x"
/// prefix.
pub fn target_from_hex(hex: &str) -> Result<U256, String> {
	let bytes = orepool_util::from_hex(hex)?;
	if bytes.len() > 32 {
		return Err(format!("target too wide: {} bytes", bytes.len()));
	}
	let mut buf = [0u8; 32];
	buf[32 - bytes.len()..].copy_from_slice(&bytes);
	Ok(U256::from_big_endian(&buf))
}

/// Round a difficulty up to the nearest power of two, the only values the
/// difficulty controller deals in.
pub fn format_difficulty(diff: u64) -> u64 {
	if diff <= 1 {
		return 1;
	}
	let shift = 64 - (diff - 1).leading_zeros();
	if shift >= 64 {
		// 2^63 is the largest representable power of two
		1u64 << 63
	} else {
		1u64 << shift
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn diff1_bits_round_trip() {
		// mainnet genesis bits
		let target = bits_to_target(0x1d00ffff);
		assert_eq!(target, *DIFF1_TARGET);
		assert_eq!(target_to_diff(&target), 1);
	}

	#[test]
	fn bits_to_target_small_sizes() {
		assert_eq!(bits_to_target(0x0100_0012), U256::zero());
		assert_eq!(bits_to_target(0x0200_1234), U256::from(0x12u64));
		assert_eq!(bits_to_target(0x0300_1234), U256::from(0x1234u64));
		assert_eq!(bits_to_target(0x0400_1234), U256::from(0x123400u64));
		// sign bit makes the encoding invalid
		assert_eq!(bits_to_target(0x0480_1234), U256::zero());
	}

	#[test]
	fn bitcoin_diff_scaling() {
		let t = diff_to_target(16384);
		assert_eq!(target_to_diff(&t), 16384);
		// higher difficulty means lower target
		assert!(diff_to_target(32768) < t);
	}

	#[test]
	fn eth_difficulty_round_trip() {
		for diff in &[1u64, 2, 1000, 4_000_000_000, 1 << 40] {
			let target = eth_diff_to_target(*diff);
			assert_eq!(eth_target_to_diff(&target), *diff);
		}
	}

	#[test]
	fn nicehash_scaling() {
		assert_eq!(eth_diff_to_nicehash_diff(4_294_967_296), 1.0);
		assert_eq!(eth_diff_to_nicehash_diff(2_147_483_648), 0.5);
	}

	#[test]
	fn format_difficulty_rounds_up() {
		assert_eq!(format_difficulty(0), 1);
		assert_eq!(format_difficulty(1), 1);
		assert_eq!(format_difficulty(2), 2);
		assert_eq!(format_difficulty(3), 4);
		assert_eq!(format_difficulty(16384), 16384);
		assert_eq!(format_difficulty(16385), 32768);
	}

	#[test]
	fn target_hex_is_fixed_width() {
		let hex = target_to_hex(&eth_diff_to_target(4_000_000_000));
		assert_eq!(hex.len(), 64);
		let parsed = target_from_hex(&hex).unwrap();
		assert_eq!(parsed, eth_diff_to_target(4_000_000_000));
	}
}
