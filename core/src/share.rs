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

//! Fixed-layout binary share records as they travel over the share topic.
//! Records are value types: once constructed they are immutable and are
//! copied, never aliased, onto the publish queue. Every record ends in a
//! checksum that consumers must verify.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::ser::{self, Error, Readable, Reader, Writeable, Writer};
use crate::status::StratumStatus;
use crate::target::{bits_to_target, target_to_diff};

/// Layout version of bitcoin share records produced by this build.
pub const BITCOIN_SHARE_VERSION: u32 = 0x0001_0003;

/// Layout version of ethereum share records produced by this build.
pub const ETH_SHARE_VERSION: u32 = 0x0002_0002;

/// Unique identity of a worker across machines. Miners running the same
/// user and worker name on several rigs fold into one key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerKey {
	/// Pool account id.
	pub user_id: i32,
	/// Hash of the worker name, stable across reconnects.
	pub worker_hash_id: i64,
}

/// Source address of a share, stored v4-mapped so the record layout is
/// the same for both families.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct IpAddress(pub [u8; 16]);

impl IpAddress {
	/// Map a std IpAddr into the fixed 16-byte form.
	pub fn from_ip(ip: IpAddr) -> IpAddress {
		match ip {
			IpAddr::V4(v4) => {
				let mut buf = [0u8; 16];
				buf[10] = 0xff;
				buf[11] = 0xff;
				buf[12..].copy_from_slice(&v4.octets());
				IpAddress(buf)
			}
			IpAddr::V6(v6) => IpAddress(v6.octets()),
		}
	}

	/// Back to a std IpAddr, un-mapping v4 where applicable.
	pub fn to_ip(&self) -> IpAddr {
		let b = &self.0;
		let is_v4_mapped =
			b[..10].iter().all(|x| *x == 0) && b[10] == 0xff && b[11] == 0xff;
		if is_v4_mapped {
			IpAddr::V4(Ipv4Addr::new(b[12], b[13], b[14], b[15]))
		} else {
			IpAddr::V6(Ipv6Addr::from(*b))
		}
	}
}

impl fmt::Display for IpAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_ip())
	}
}

fn checksum_fold(sum: u64) -> u32 {
	((sum >> 32) as u32).wrapping_add(sum as u32)
}

/// One submitted bitcoin share, accepted or not.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ShareBitcoin {
	/// Record layout version, always `BITCOIN_SHARE_VERSION` when produced
	/// here.
	pub version: u32,
	/// Pool-wide job id the share was submitted against.
	pub job_id: u64,
	/// Worker identity.
	pub worker_hash_id: i64,
	/// Pool account id.
	pub user_id: i32,
	/// Validation outcome.
	pub status: StratumStatus,
	/// Unix seconds at submission.
	pub timestamp: u64,
	/// Source address.
	pub ip: IpAddress,
	/// Miner-facing difficulty at submission time.
	pub share_diff: u64,
	/// Network bits of the job's tip.
	pub blk_bits: u32,
	/// Height of the job's tip.
	pub height: u32,
	/// Raw header nonce.
	pub nonce: u32,
	/// Session id, i.e. the session's extraNonce1.
	pub session_id: u32,
	/// Miner-enumerated extra nonce.
	pub extra_nonce2: u64,
	/// Header time the miner used.
	pub n_time: u32,
	/// BIP310 version mask applied by the miner, zero when unused.
	pub version_mask: u32,
}

impl ShareBitcoin {
	/// Network difficulty implied by the record's bits.
	pub fn network_diff(&self) -> u64 {
		target_to_diff(&bits_to_target(self.blk_bits))
	}

	/// Checksum over every field of the record.
	pub fn checksum(&self) -> u32 {
		let mut c: u64 = 0;
		c = c.wrapping_add(self.version as u64);
		c = c.wrapping_add(self.job_id);
		c = c.wrapping_add(self.worker_hash_id as u64);
		c = c.wrapping_add(self.user_id as u64);
		c = c.wrapping_add(self.status.code() as u64);
		c = c.wrapping_add(self.timestamp);
		for chunk in self.ip.0.chunks(8) {
			let mut b = [0u8; 8];
			b.copy_from_slice(chunk);
			c = c.wrapping_add(u64::from_le_bytes(b));
		}
		c = c.wrapping_add(self.share_diff);
		c = c.wrapping_add(self.blk_bits as u64);
		c = c.wrapping_add(self.height as u64);
		c = c.wrapping_add(self.nonce as u64);
		c = c.wrapping_add(self.session_id as u64);
		c = c.wrapping_add(self.extra_nonce2);
		c = c.wrapping_add(self.n_time as u64);
		c = c.wrapping_add(self.version_mask as u64);
		checksum_fold(c)
	}

	/// Serialize for the share topic, checksum included.
	pub fn to_record(&self) -> Vec<u8> {
		ser::ser_vec(self).expect("in-memory serialization")
	}

	/// Parse a record from the share topic, rejecting version or checksum
	/// mismatches.
	pub fn from_record(bytes: &[u8]) -> Result<ShareBitcoin, Error> {
		ser::deserialize(&mut &bytes[..])
	}
}

impl Writeable for ShareBitcoin {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_u32(self.version)?;
		writer.write_u64(self.job_id)?;
		writer.write_i64(self.worker_hash_id)?;
		writer.write_i32(self.user_id)?;
		writer.write_i32(self.status.code())?;
		writer.write_u64(self.timestamp)?;
		writer.write_fixed_bytes(&self.ip.0)?;
		writer.write_u64(self.share_diff)?;
		writer.write_u32(self.blk_bits)?;
		writer.write_u32(self.height)?;
		writer.write_u32(self.nonce)?;
		writer.write_u32(self.session_id)?;
		writer.write_u64(self.extra_nonce2)?;
		writer.write_u32(self.n_time)?;
		writer.write_u32(self.version_mask)?;
		writer.write_u32(self.checksum())
	}
}

impl Readable for ShareBitcoin {
	fn read<R: Reader>(reader: &mut R) -> Result<ShareBitcoin, Error> {
		let version = reader.read_u32()?;
		if version != BITCOIN_SHARE_VERSION {
			return Err(Error::UnsupportedVersion {
				expected: BITCOIN_SHARE_VERSION,
				received: version,
			});
		}
		let job_id = reader.read_u64()?;
		let worker_hash_id = reader.read_i64()?;
		let user_id = reader.read_i32()?;
		let status = StratumStatus::from_code(reader.read_i32()?);
		let timestamp = reader.read_u64()?;
		let ip_bytes = reader.read_fixed_bytes(16)?;
		let mut ip = IpAddress::default();
		ip.0.copy_from_slice(&ip_bytes);
		let share = ShareBitcoin {
			version,
			job_id,
			worker_hash_id,
			user_id,
			status,
			timestamp,
			ip,
			share_diff: reader.read_u64()?,
			blk_bits: reader.read_u32()?,
			height: reader.read_u32()?,
			nonce: reader.read_u32()?,
			session_id: reader.read_u32()?,
			extra_nonce2: reader.read_u64()?,
			n_time: reader.read_u32()?,
			version_mask: reader.read_u32()?,
		};
		let checksum = reader.read_u32()?;
		if checksum != share.checksum() {
			return Err(Error::ChecksumMismatch);
		}
		Ok(share)
	}
}

/// One submitted ethereum share, accepted or not.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ShareEth {
	/// Record layout version, always `ETH_SHARE_VERSION` when produced
	/// here.
	pub version: u32,
	/// Pool-wide job id the share was submitted against.
	pub job_id: u64,
	/// First 8 bytes of the header hash, enough to disambiguate work.
	pub header_hash_prefix: u64,
	/// Worker identity.
	pub worker_hash_id: i64,
	/// Pool account id.
	pub user_id: i32,
	/// Validation outcome.
	pub status: StratumStatus,
	/// Unix seconds at submission.
	pub timestamp: u64,
	/// Source address.
	pub ip: IpAddress,
	/// Miner-facing difficulty at submission time.
	pub share_diff: u64,
	/// Network difficulty of the job's tip.
	pub network_diff: u64,
	/// Height of the job's tip.
	pub height: u32,
	/// Full 64-bit nonce, session prefix included.
	pub nonce: u64,
	/// Session id, i.e. the session's extraNonce1.
	pub session_id: u32,
}

impl ShareEth {
	/// Checksum over every field of the record.
	pub fn checksum(&self) -> u32 {
		let mut c: u64 = 0;
		c = c.wrapping_add(self.version as u64);
		c = c.wrapping_add(self.job_id);
		c = c.wrapping_add(self.header_hash_prefix);
		c = c.wrapping_add(self.worker_hash_id as u64);
		c = c.wrapping_add(self.user_id as u64);
		c = c.wrapping_add(self.status.code() as u64);
		c = c.wrapping_add(self.timestamp);
		for chunk in self.ip.0.chunks(8) {
			let mut b = [0u8; 8];
			b.copy_from_slice(chunk);
			c = c.wrapping_add(u64::from_le_bytes(b));
		}
		c = c.wrapping_add(self.share_diff);
		c = c.wrapping_add(self.network_diff);
		c = c.wrapping_add(self.height as u64);
		c = c.wrapping_add(self.nonce);
		c = c.wrapping_add(self.session_id as u64);
		checksum_fold(c)
	}

	/// Serialize for the share topic, checksum included.
	pub fn to_record(&self) -> Vec<u8> {
		ser::ser_vec(self).expect("in-memory serialization")
	}

	/// Parse a record from the share topic, rejecting version or checksum
	/// mismatches.
	pub fn from_record(bytes: &[u8]) -> Result<ShareEth, Error> {
		ser::deserialize(&mut &bytes[..])
	}
}

impl Writeable for ShareEth {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_u32(self.version)?;
		writer.write_u64(self.job_id)?;
		writer.write_u64(self.header_hash_prefix)?;
		writer.write_i64(self.worker_hash_id)?;
		writer.write_i32(self.user_id)?;
		writer.write_i32(self.status.code())?;
		writer.write_u64(self.timestamp)?;
		writer.write_fixed_bytes(&self.ip.0)?;
		writer.write_u64(self.share_diff)?;
		writer.write_u64(self.network_diff)?;
		writer.write_u32(self.height)?;
		writer.write_u64(self.nonce)?;
		writer.write_u32(self.session_id)?;
		writer.write_u32(self.checksum())
	}
}

impl Readable for ShareEth {
	fn read<R: Reader>(reader: &mut R) -> Result<ShareEth, Error> {
		let version = reader.read_u32()?;
		if version != ETH_SHARE_VERSION {
			return Err(Error::UnsupportedVersion {
				expected: ETH_SHARE_VERSION,
				received: version,
			});
		}
		let job_id = reader.read_u64()?;
		let header_hash_prefix = reader.read_u64()?;
		let worker_hash_id = reader.read_i64()?;
		let user_id = reader.read_i32()?;
		let status = StratumStatus::from_code(reader.read_i32()?);
		let timestamp = reader.read_u64()?;
		let ip_bytes = reader.read_fixed_bytes(16)?;
		let mut ip = IpAddress::default();
		ip.0.copy_from_slice(&ip_bytes);
		let share = ShareEth {
			version,
			job_id,
			header_hash_prefix,
			worker_hash_id,
			user_id,
			status,
			timestamp,
			ip,
			share_diff: reader.read_u64()?,
			network_diff: reader.read_u64()?,
			height: reader.read_u32()?,
			nonce: reader.read_u64()?,
			session_id: reader.read_u32()?,
		};
		let checksum = reader.read_u32()?;
		if checksum != share.checksum() {
			return Err(Error::ChecksumMismatch);
		}
		Ok(share)
	}
}

/// A share of whichever chain, as handed to the publication pipeline and
/// the per-worker statistics.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Share {
	/// A bitcoin share record.
	Bitcoin(ShareBitcoin),
	/// An ethereum share record.
	Eth(ShareEth),
}

impl Share {
	/// Worker identity of the submitter.
	pub fn worker_key(&self) -> WorkerKey {
		match self {
			Share::Bitcoin(s) => WorkerKey {
				user_id: s.user_id,
				worker_hash_id: s.worker_hash_id,
			},
			Share::Eth(s) => WorkerKey {
				user_id: s.user_id,
				worker_hash_id: s.worker_hash_id,
			},
		}
	}

	/// Validation outcome.
	pub fn status(&self) -> StratumStatus {
		match self {
			Share::Bitcoin(s) => s.status,
			Share::Eth(s) => s.status,
		}
	}

	/// Miner-facing difficulty at submission time.
	pub fn share_diff(&self) -> u64 {
		match self {
			Share::Bitcoin(s) => s.share_diff,
			Share::Eth(s) => s.share_diff,
		}
	}

	/// Submission time, unix seconds.
	pub fn timestamp(&self) -> u64 {
		match self {
			Share::Bitcoin(s) => s.timestamp,
			Share::Eth(s) => s.timestamp,
		}
	}

	/// Source address.
	pub fn ip(&self) -> IpAddress {
		match self {
			Share::Bitcoin(s) => s.ip,
			Share::Eth(s) => s.ip,
		}
	}

	/// Serialized record, checksum included.
	pub fn to_record(&self) -> Vec<u8> {
		match self {
			Share::Bitcoin(s) => s.to_record(),
			Share::Eth(s) => s.to_record(),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample_bitcoin() -> ShareBitcoin {
		ShareBitcoin {
			version: BITCOIN_SHARE_VERSION,
			job_id: 0x60d4e2ab_112233_05,
			worker_hash_id: -193760579,
			user_id: 1024,
			status: StratumStatus::Accept,
			timestamp: 1_620_000_000,
			ip: IpAddress::from_ip("203.0.113.7".parse().unwrap()),
			share_diff: 16384,
			blk_bits: 0x1d00ffff,
			height: 680_000,
			nonce: 0x9a_bc_de_f0,
			session_id: 0x01ad557d,
			extra_nonce2: 0x1122_3344_5566_7788,
			n_time: 1_620_000_100,
			version_mask: 0x1fffe000,
		}
	}

	#[test]
	fn bitcoin_record_round_trip() {
		let share = sample_bitcoin();
		let bytes = share.to_record();
		let parsed = ShareBitcoin::from_record(&bytes).unwrap();
		assert_eq!(parsed, share);
	}

	#[test]
	fn corrupt_record_rejected() {
		let mut bytes = sample_bitcoin().to_record();
		let mid = bytes.len() / 2;
		bytes[mid] ^= 0xff;
		match ShareBitcoin::from_record(&bytes) {
			Err(Error::ChecksumMismatch) => (),
			other => panic!("expected checksum mismatch, got {:?}", other),
		}
	}

	#[test]
	fn wrong_version_rejected() {
		let mut share = sample_bitcoin();
		share.version = 0x0001_0001;
		let bytes = ser::ser_vec(&share).unwrap();
		match ShareBitcoin::from_record(&bytes) {
			Err(Error::UnsupportedVersion { .. }) => (),
			other => panic!("expected version error, got {:?}", other),
		}
	}

	#[test]
	fn eth_record_round_trip() {
		let share = ShareEth {
			version: ETH_SHARE_VERSION,
			job_id: 42,
			header_hash_prefix: 0xae77_8d30_4393_d441,
			worker_hash_id: 99,
			user_id: 7,
			status: StratumStatus::Solved,
			timestamp: 1_620_000_000,
			ip: IpAddress::from_ip("2001:db8::1".parse().unwrap()),
			share_diff: 4_000_000_000,
			network_diff: 7_000_000_000_000,
			height: 12_000_000,
			nonce: 0x4cc7_c01b_fbe5_1c67,
			session_id: 0x080c,
		};
		let bytes = share.to_record();
		assert_eq!(ShareEth::from_record(&bytes).unwrap(), share);
	}

	#[test]
	fn ipv4_mapping_round_trip() {
		let ip: IpAddr = "10.1.2.3".parse().unwrap();
		assert_eq!(IpAddress::from_ip(ip).to_ip(), ip);
		assert_eq!(IpAddress::from_ip(ip).to_string(), "10.1.2.3");
	}
}
