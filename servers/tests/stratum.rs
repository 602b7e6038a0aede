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

//! End-to-end session engine tests: a real server on a real socket,
//! driven by a plain blocking TCP client the way actual miners connect.

use std::io::{BufRead, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use std::{thread, time};

use bufstream::BufStream;
use rand::Rng;
use serde_json::{json, Value};

use orepool_core::job::{StratumJob, StratumJobEth};
use orepool_core::target::{eth_diff_to_target, target_to_hex};
use orepool_core::StratumStatus;
use orepool_servers::common::stats::ServerStateInfo;
use orepool_servers::common::topics::ChannelTopic;
use orepool_servers::common::types::{ChainType, StratumConfig};
use orepool_servers::mining::pipeline::SharePipeline;
use orepool_servers::mining::repository::JobRepository;
use orepool_servers::mining::validator::{
	CheckResult, EthShareValidator, EthashProvider, ShareCheck, ShareValidator,
};
use orepool_servers::mining::{AuthResult, UserAuthenticator};
use orepool_servers::StratumServer;
use orepool_util::{Mutex, StopState};

/// A validator that accepts everything, for driving the happy path
/// without doing proof-of-work.
struct AcceptAllValidator;

impl ShareValidator for AcceptAllValidator {
	fn check_share(&self, _check: &ShareCheck<'_>) -> CheckResult {
		CheckResult {
			status: StratumStatus::Accept,
			mix_hash: None,
			header_hex: None,
			coinbase_hex: None,
		}
	}
}

/// Records every name the session engine hands to the account system.
#[derive(Default)]
struct RecordingAuthenticator {
	names: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl UserAuthenticator for RecordingAuthenticator {
	async fn authorize(&self, full_name: &str, _password: &str) -> AuthResult {
		self.names.lock().push(full_name.to_string());
		Ok((42, 4242))
	}
}

struct FixedEthash;

impl EthashProvider for FixedEthash {
	fn compute(&self, _height: u64, _header_hash: &str, _nonce: u64) -> (String, orepool_core::U256) {
		// a minimal pow value: every share passes, blocks included
		("00".repeat(32), orepool_core::U256::from(1u64))
	}
}

struct TestServer {
	addr: String,
	repository: Arc<JobRepository>,
	authenticator: Arc<RecordingAuthenticator>,
	stop_state: Arc<StopState>,
	_runtime: tokio::runtime::Runtime,
}

fn start_server(port: u16, chain: ChainType, accept_all: bool) -> TestServer {
	orepool_util::init_test_logger();

	let mut config = StratumConfig::default();
	config.listen_addr = format!("127.0.0.1:{}", port);
	config.chain = chain;

	let state = ServerStateInfo::default();
	let (share_topic, _share_rx) = ChannelTopic::new("shares");
	let (solved_topic, _solved_rx) = ChannelTopic::new("solved");
	let repository = JobRepository::new(config.job_expiry_secs, state.clone());
	let pipeline = SharePipeline::new(share_topic, solved_topic, state.clone());
	let authenticator = Arc::new(RecordingAuthenticator::default());
	let stop_state = Arc::new(StopState::new());

	let validator: Arc<dyn ShareValidator> = if accept_all {
		Arc::new(AcceptAllValidator)
	} else {
		Arc::new(EthShareValidator::new(FixedEthash))
	};

	let server = StratumServer::new(
		config.clone(),
		repository.clone(),
		pipeline,
		validator,
		authenticator.clone(),
		state,
		stop_state.clone(),
	);

	let runtime = tokio::runtime::Runtime::new().unwrap();
	runtime.spawn(async move {
		let _ = server.run().await;
	});

	// wait for the acceptor to come up
	loop {
		if TcpStream::connect(&config.listen_addr).is_ok() {
			break;
		}
		thread::sleep(time::Duration::from_millis(50));
	}

	TestServer {
		addr: config.listen_addr,
		repository,
		authenticator,
		stop_state,
		_runtime: runtime,
	}
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.stop_state.stop();
	}
}

fn connect(server: &TestServer) -> BufStream<TcpStream> {
	let stream = TcpStream::connect(&server.addr).unwrap();
	stream
		.set_read_timeout(Some(Duration::from_secs(5)))
		.unwrap();
	BufStream::new(stream)
}

fn send_line(stream: &mut BufStream<TcpStream>, line: &str) {
	stream.write_all(line.as_bytes()).unwrap();
	stream.write_all(b"\n").unwrap();
	stream.flush().unwrap();
}

fn read_json(stream: &mut BufStream<TcpStream>) -> Value {
	let mut line = String::new();
	stream.read_line(&mut line).unwrap();
	assert!(!line.is_empty(), "connection closed unexpectedly");
	serde_json::from_str(&line).unwrap_or_else(|e| panic!("bad json {:?}: {}", line, e))
}

/// Read lines until one carries the given method.
fn read_until_method(stream: &mut BufStream<TcpStream>, method: &str) -> Value {
	for _ in 0..10 {
		let msg = read_json(stream);
		if msg.get("method").and_then(|m| m.as_str()) == Some(method) {
			return msg;
		}
	}
	panic!("never saw method {}", method);
}

fn sample_eth_job(ts: u64, height: u64) -> StratumJob {
	StratumJob::Eth(StratumJobEth {
		job_id: ts << 32 | 0x0101,
		chain: "ETH".to_string(),
		height,
		header_hash: format!("0x{:064x}", height + 0xabc),
		seed_hash: format!("0x{:064x}", 0x22u64),
		network_target: target_to_hex(&eth_diff_to_target(1 << 40)),
	})
}

fn unix_now() -> u64 {
	use std::time::{SystemTime, UNIX_EPOCH};
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

// ----------------------------------------------------------------------
// SHA256 generic stratum

#[test]
fn bitcoin_subscribe_shape() {
	let server = start_server(18331, ChainType::Bitcoin, true);
	let mut miner = connect(&server);

	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"cgminer/1.0\"]}",
	);
	let resp = read_json(&mut miner);
	assert_eq!(resp["id"], json!(1));
	assert_eq!(resp["error"], Value::Null);

	let result = resp["result"].as_array().expect("result array");
	assert_eq!(result.len(), 3);
	// result[1] is the session's extraNonce1 as 8 hex chars
	let en1 = result[1].as_str().unwrap();
	assert_eq!(en1.len(), 8);
	// result[2] is the extraNonce2 size
	assert_eq!(result[2], json!(8));
	// result[0] carries both subscriptions, keyed by the same extraNonce1
	assert_eq!(result[0][0][0], json!("mining.set_difficulty"));
	assert_eq!(result[0][0][1], json!(en1));
	assert_eq!(result[0][1][0], json!("mining.notify"));
	assert_eq!(result[0][1][1], json!(en1));
}

#[test]
fn bitcoin_second_subscribe_is_rejected() {
	let server = start_server(18332, ChainType::Bitcoin, true);
	let mut miner = connect(&server);

	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"cgminer/1.0\"]}",
	);
	read_json(&mut miner);
	send_line(
		&mut miner,
		"{\"id\":2,\"method\":\"mining.subscribe\",\"params\":[\"cgminer/1.0\"]}",
	);
	let resp = read_json(&mut miner);
	assert_eq!(resp["error"][0], json!(StratumStatus::Unknown.code()));
}

#[test]
fn bitcoin_authorize_before_subscribe_fails() {
	let server = start_server(18333, ChainType::Bitcoin, true);
	let mut miner = connect(&server);

	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"mining.authorize\",\"params\":[\"u.w\",\"x\"]}",
	);
	let resp = read_json(&mut miner);
	assert_eq!(resp["error"][0], json!(StratumStatus::NotSubscribed.code()));
}

#[test]
fn bitcoin_version_rolling_configure() {
	let server = start_server(18334, ChainType::Bitcoin, true);
	let mut miner = connect(&server);

	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"mining.configure\",\"params\":[[\"minimum-difficulty\",\"version-rolling\"],{\"minimum-difficulty.value\":2048,\"version-rolling.mask\":\"1fffe000\",\"version-rolling.min-bit-count\":2}]}",
	);
	let resp = read_json(&mut miner);
	assert_eq!(resp["result"]["version-rolling"], json!(true));
	assert_eq!(resp["result"]["version-rolling.mask"], json!("1fffe000"));
	assert_eq!(resp["result"]["minimum-difficulty"], json!(true));

	// followed by the set_version_mask push
	let push = read_json(&mut miner);
	assert_eq!(push["method"], json!("mining.set_version_mask"));
	assert_eq!(push["params"][0], json!("1fffe000"));
}

#[test]
fn bitcoin_submit_and_duplicate_rejection() {
	let server = start_server(18335, ChainType::Bitcoin, true);
	let mut miner = connect(&server);

	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"cgminer/1.0\"]}",
	);
	read_json(&mut miner);
	send_line(
		&mut miner,
		"{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"alice.rig1\",\"x\"]}",
	);
	let auth = read_json(&mut miner);
	assert_eq!(auth["result"], json!(true));

	// hand the repository a bitcoin job; the session must push
	// set_difficulty then notify
	let gbt = format!(
		"{{\"result\":{{\"previousblockhash\":\
		 \"00000000000000000328e9fea9914ad83b7404a838aa66aefb970e5689c2f63d\",\
		 \"height\":680000,\"version\":536870912,\"bits\":\"1d00ffff\",\
		 \"curtime\":{},\"mintime\":0,\"coinbasevalue\":625000000,\
		 \"transactions\":[]}}}}",
		unix_now()
	);
	let job = orepool_core::job::StratumJobBitcoin::init_from_gbt(
		&gbt,
		"/orepool/",
		&[0x51],
		0,
		None,
		None,
		1,
		false,
		unix_now(),
	)
	.unwrap();
	server
		.repository
		.accept_job(StratumJob::Bitcoin(job), unix_now());

	let diff_push = read_until_method(&mut miner, "mining.set_difficulty");
	assert!(diff_push["params"][0].as_u64().unwrap() > 0);
	let notify = read_until_method(&mut miner, "mining.notify");
	let short_job_id = notify["params"][0].as_str().unwrap().to_string();
	// first job is always clean
	assert_eq!(notify["params"][8], json!(true));

	// nonce material is arbitrary miner output; generate it the way a
	// miner would
	let mut rng = rand::thread_rng();
	let extra_nonce2: u64 = rng.gen();
	let nonce: u32 = rng.gen();

	// first submit accepted
	let submit = format!(
		"{{\"id\":4,\"method\":\"mining.submit\",\"params\":[\"alice.rig1\",\"{}\",\"{:016x}\",\"60b0d000\",\"{:08x}\"]}}",
		short_job_id, extra_nonce2, nonce
	);
	send_line(&mut miner, &submit);
	let first = read_json(&mut miner);
	assert_eq!(first["result"], json!(true), "first submit: {:?}", first);

	// identical submit is a duplicate
	send_line(&mut miner, &submit);
	let second = read_json(&mut miner);
	assert_eq!(second["result"], Value::Null);
	assert_eq!(
		second["error"][0],
		json!(StratumStatus::DuplicateShare.code())
	);

	// a different extraNonce2 goes through again
	let submit3 = format!(
		"{{\"id\":5,\"method\":\"mining.submit\",\"params\":[\"alice.rig1\",\"{}\",\"{:016x}\",\"60b0d000\",\"{:08x}\"]}}",
		short_job_id,
		extra_nonce2.wrapping_add(1),
		nonce
	);
	send_line(&mut miner, &submit3);
	let third = read_json(&mut miner);
	assert_eq!(third["result"], json!(true));
}

#[test]
fn bitcoin_submit_unauthorized_gets_reconnect() {
	let server = start_server(18336, ChainType::Bitcoin, true);
	let mut miner = connect(&server);

	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"mining.submit\",\"params\":[\"a.b\",\"0\",\"0000000000000001\",\"60b0d000\",\"12345678\"]}",
	);
	let resp = read_json(&mut miner);
	assert_eq!(resp["error"][0], json!(StratumStatus::Unauthorized.code()));
	let push = read_json(&mut miner);
	assert_eq!(push["method"], json!("client.reconnect"));
}

#[test]
fn bitcoin_submit_unknown_job() {
	let server = start_server(18337, ChainType::Bitcoin, true);
	let mut miner = connect(&server);

	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"cgminer/1.0\"]}",
	);
	read_json(&mut miner);
	send_line(
		&mut miner,
		"{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"alice.rig1\",\"x\"]}",
	);
	read_json(&mut miner);

	send_line(
		&mut miner,
		"{\"id\":3,\"method\":\"mining.submit\",\"params\":[\"alice.rig1\",\"7\",\"0000000000000001\",\"60b0d000\",\"12345678\"]}",
	);
	let resp = read_json(&mut miner);
	assert_eq!(resp["error"][0], json!(StratumStatus::JobNotFound.code()));
}

// ----------------------------------------------------------------------
// Ethereum dialects

#[test]
fn eth_nicehash_subscribe_shape() {
	let server = start_server(18338, ChainType::Eth, false);
	let mut miner = connect(&server);

	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"x\",\"EthereumStratum/1.0.0\"]}",
	);
	let resp = read_json(&mut miner);
	assert_eq!(resp["error"], Value::Null);
	let result = resp["result"].as_array().expect("result array");
	assert_eq!(result.len(), 2);
	let en1 = result[1].as_str().unwrap();
	// the NiceHash extra nonce is exactly 3 bytes
	assert_eq!(en1.len(), 6);
	assert_eq!(result[0][0], json!("mining.notify"));
	assert_eq!(result[0][1], json!(en1));
	assert_eq!(result[0][2], json!("EthereumStratum/1.0.0"));
}

#[test]
fn eth_address_stripping_on_login() {
	let server = start_server(18339, ChainType::Eth, false);

	// a 42-char 0x address before the first dot is stripped
	let mut miner = connect(&server);
	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"eth_submitLogin\",\"params\":[\"0x00d8c82Eb65124Ea3452CaC59B64aCC230AA3482.test.aaa\"]}",
	);
	let resp = read_json(&mut miner);
	assert_eq!(resp["result"], json!(true));

	// a plain name passes through unchanged
	let mut miner2 = connect(&server);
	send_line(
		&mut miner2,
		"{\"id\":1,\"method\":\"eth_submitLogin\",\"params\":[\"test.aaa\"]}",
	);
	read_json(&mut miner2);

	// an invalid address prefix passes through whole
	let mut miner3 = connect(&server);
	send_line(
		&mut miner3,
		"{\"id\":1,\"method\":\"eth_submitLogin\",\"params\":[\"0xZZZ.worker\"]}",
	);
	read_json(&mut miner3);

	let names = server.authenticator.names.lock().clone();
	assert_eq!(
		names,
		vec![
			"test.aaa".to_string(),
			"test.aaa".to_string(),
			"0xZZZ.worker".to_string()
		]
	);
}

#[test]
fn eth_nicehash_submit_with_short_nonce() {
	let server = start_server(18340, ChainType::Eth, false);
	let mut miner = connect(&server);

	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"x\",\"EthereumStratum/1.0.0\"]}",
	);
	read_json(&mut miner);
	send_line(
		&mut miner,
		"{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"test.aaa\",\"x\"]}",
	);
	let auth = read_json(&mut miner);
	assert_eq!(auth["result"], json!(true));

	server
		.repository
		.accept_job(sample_eth_job(unix_now(), 12_000_000), unix_now());

	// NiceHash flavor sends set_difficulty then notify
	let diff_push = read_until_method(&mut miner, "mining.set_difficulty");
	assert!(diff_push["params"][0].as_f64().unwrap() > 0.0);
	let notify = read_until_method(&mut miner, "mining.notify");
	let header = notify["params"][0].as_str().unwrap().to_string();
	assert_eq!(header.len(), 64);

	// a 5-byte miner nonce, to be prefixed with the 3-byte extra nonce
	let miner_nonce: u64 = rand::thread_rng().gen::<u64>() & 0xff_ffff_ffff;
	let submit = format!(
		"{{\"id\":3,\"method\":\"mining.submit\",\"params\":[\"test.aaa\",\"{}\",\"{:010x}\"]}}",
		header, miner_nonce
	);
	send_line(&mut miner, &submit);
	let resp = read_json(&mut miner);
	assert_eq!(resp["result"], json!(true), "submit reply: {:?}", resp);
}

#[test]
fn eth_getwork_replays_latest_job() {
	let server = start_server(18341, ChainType::Eth, false);
	let mut miner = connect(&server);

	// ETHPROXY: login without subscribe
	send_line(
		&mut miner,
		"{\"id\":1,\"method\":\"eth_submitLogin\",\"params\":[\"test.aaa\"]}",
	);
	read_json(&mut miner);

	server
		.repository
		.accept_job(sample_eth_job(unix_now(), 12_000_001), unix_now());
	// the push arrives on its own; then getWork replays it with our id
	let push = read_json(&mut miner);
	assert!(push["result"].is_array());

	send_line(&mut miner, "{\"id\":5,\"method\":\"eth_getWork\",\"params\":[]}");
	let reply = read_json(&mut miner);
	assert_eq!(reply["id"], json!(5));
	let result = reply["result"].as_array().unwrap();
	assert_eq!(result.len(), 4);
	// header, seed, 58-char target, start nonce prefix
	assert!(result[0].as_str().unwrap().starts_with("0x"));
	assert_eq!(result[2].as_str().unwrap().len(), 60);
}
