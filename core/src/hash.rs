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

//! 256-bit hash wrapper used for block hashes, txids and merkle nodes.
//!
//! Bytes are stored in digest order (little-endian, as bitcoind keeps its
//! uint256), while the hex form is the familiar reversed display order.

use std::fmt;
use std::str::FromStr;

use bitcoin_hashes::{sha256d, Hash as BitcoinHashesHash};
use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 256-bit hash in digest (little-endian) byte order.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Eq, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

/// The all-zero hash.
pub const ZERO_HASH: Hash = Hash([0; 32]);

impl Hash {
	/// Builds a hash from digest-order bytes.
	pub fn from_bytes(b: [u8; 32]) -> Hash {
		Hash(b)
	}

	/// Digest-order bytes.
	pub fn to_bytes(&self) -> [u8; 32] {
		self.0
	}

	/// Digest-order byte slice.
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}

	/// Parse from display-order hex (the way bitcoind prints hashes).
	pub fn from_hex(hex: &str) -> Result<Hash, String> {
		let bytes = orepool_util::from_hex(hex)?;
		if bytes.len() != 32 {
			return Err(format!("hash must be 32 bytes, got {}", bytes.len()));
		}
		let mut buf = [0u8; 32];
		for (i, b) in bytes.iter().rev().enumerate() {
			buf[i] = *b;
		}
		Ok(Hash(buf))
	}

	/// Display-order hex string.
	pub fn to_hex(&self) -> String {
		let mut rev = self.0;
		rev.reverse();
		orepool_util::to_hex(&rev)
	}

	/// The first 4 digest-order bytes as a little-endian u32. Used when a
	/// compact fingerprint of the hash is folded into a job id.
	pub fn low_u32(&self) -> u32 {
		u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
	}

	/// Whether this is the all-zero hash.
	pub fn is_zero(&self) -> bool {
		self.0.iter().all(|b| *b == 0)
	}
}

impl fmt::Display for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl FromStr for Hash {
	type Err = String;

	fn from_str(s: &str) -> Result<Hash, String> {
		Hash::from_hex(s)
	}
}

impl Serialize for Hash {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for Hash {
	fn deserialize<D>(deserializer: D) -> Result<Hash, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Hash::from_hex(&s).map_err(D::Error::custom)
	}
}

/// Double SHA256 of the provided bytes, in digest order.
pub fn sha256d(data: &[u8]) -> Hash {
	let digest = sha256d::Hash::hash(data);
	Hash(digest.into_inner())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn hex_round_trip() {
		let hex = "00000000000000000328e9fea9914ad83b7404a838aa66aefb970e5689c2f63d";
		let h = Hash::from_hex(hex).unwrap();
		assert_eq!(h.to_hex(), hex);
		// display order ends with the first digest byte
		assert_eq!(h.0[0], 0x3d);
		assert_eq!(h.0[31], 0x00);
	}

	#[test]
	fn sha256d_known_vector() {
		// double sha256 of the empty string
		let h = sha256d(b"");
		assert_eq!(
			h.to_hex(),
			"56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
		);
	}

	#[test]
	fn rejects_bad_length() {
		assert!(Hash::from_hex("abcd").is_err());
	}
}
