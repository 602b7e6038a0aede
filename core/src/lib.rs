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

//! The pool-wide data model: stratum jobs for every supported chain,
//! fixed-layout binary share records, the share status taxonomy, 256-bit
//! target arithmetic and the bitcoin coinbase transaction assembly used
//! by the job maker.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod consensus;
pub mod hash;
pub mod job;
pub mod merkle;
pub mod ser;
pub mod share;
pub mod status;
pub mod target;
pub mod transaction;

pub use crate::hash::Hash;
pub use crate::share::{Share, ShareBitcoin, ShareEth, WorkerKey};
pub use crate::status::StratumStatus;
pub use crate::target::U256;
