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

//! The pool server proper: the job maker that turns block templates into
//! stratum jobs, the per-server job repository, the session engine that
//! owns every miner connection, and the share pipeline in between.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod common;
pub mod jobmaker;
pub mod mining;

pub use crate::common::types::{Error, JobMakerConfig, PoolConfig, StratumConfig};
pub use crate::mining::server::StratumServer;
