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

//! Message topics the core publishes into and consumes from. The durable
//! transport behind a topic is an external concern; components only see
//! these seams. The in-process channel implementation backs tests and
//! single-binary deployments.

use std::sync::Arc;

use tokio::sync::mpsc;

/// Something that accepts messages for a topic. Publishing never blocks
/// the hot path; implementations buffer or drop on overload.
pub trait TopicPublisher: Send + Sync {
	/// Queue one message. Failures are logged, never surfaced: losing a
	/// record must not take a session down.
	fn publish(&self, payload: Vec<u8>);
}

/// In-process topic backed by an unbounded channel.
pub struct ChannelTopic {
	name: &'static str,
	tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTopic {
	/// Create the topic, handing back the consumer end.
	pub fn new(name: &'static str) -> (Arc<ChannelTopic>, mpsc::UnboundedReceiver<Vec<u8>>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Arc::new(ChannelTopic { name, tx }), rx)
	}
}

impl TopicPublisher for ChannelTopic {
	fn publish(&self, payload: Vec<u8>) {
		if self.tx.send(payload).is_err() {
			warn!("topic {}: consumer gone, dropping message", self.name);
		}
	}
}

/// A sink that drops everything, for components wired without a
/// downstream consumer.
pub struct NullTopic;

impl TopicPublisher for NullTopic {
	fn publish(&self, _payload: Vec<u8>) {}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn channel_topic_delivers_in_order() {
		let (topic, mut rx) = ChannelTopic::new("test");
		topic.publish(b"one".to_vec());
		topic.publish(b"two".to_vec());
		assert_eq!(rx.recv().await.unwrap(), b"one");
		assert_eq!(rx.recv().await.unwrap(), b"two");
	}

	#[tokio::test]
	async fn publish_after_consumer_drop_is_silent() {
		let (topic, rx) = ChannelTopic::new("test");
		drop(rx);
		topic.publish(b"lost".to_vec());
	}
}
