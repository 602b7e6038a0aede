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

//! Merkle branch construction for stratum jobs. The miner recomputes the
//! root from the coinbase txid and this branch, so the branch deliberately
//! excludes the coinbase position.

use crate::hash::{sha256d, Hash};

/// Double SHA256 over the concatenation of two nodes.
fn combine(left: &Hash, right: &Hash) -> Hash {
	let mut buf = [0u8; 64];
	buf[..32].copy_from_slice(left.as_slice());
	buf[32..].copy_from_slice(right.as_slice());
	sha256d(&buf)
}

/// Build the merkle branch for the coinbase position from the txids of
/// all non-coinbase transactions, in block order. Empty input (an empty
/// block) yields an empty branch.
pub fn make_merkle_branch(txids: &[Hash]) -> Vec<Hash> {
	let mut steps = Vec::new();
	if txids.is_empty() {
		return steps;
	}
	let mut hashes: Vec<Hash> = txids.to_vec();
	while hashes.len() > 1 {
		// the first element pairs with the (absent) coinbase, so it goes
		// to the branch as-is
		steps.push(hashes[0]);
		if hashes.len() % 2 == 0 {
			// odd number of pairable elements: duplicate the last
			let last = *hashes.last().unwrap();
			hashes.push(last);
		}
		for i in 0..(hashes.len() - 1) / 2 {
			hashes[i] = combine(&hashes[i * 2 + 1], &hashes[i * 2 + 2]);
		}
		let next_len = (hashes.len() - 1) / 2;
		hashes.truncate(next_len);
	}
	steps.push(hashes[0]);
	steps
}

/// Fold a coinbase txid through a merkle branch to recover the root.
pub fn branch_root(coinbase_txid: &Hash, branch: &[Hash]) -> Hash {
	let mut root = *coinbase_txid;
	for step in branch {
		root = combine(&root, step);
	}
	root
}
