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

//! Wire framing for miner connections. Two frame kinds share one TCP
//! stream: newline-terminated JSON lines, and the binary exMessage
//! frames of the agent sub-protocol, recognized by their magic byte:
//!
//! ```text
//! magic(1) | command(1) | length(2, LE, whole frame) | body
//! ```

use std::io;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Magic byte opening every exMessage frame.
pub const EX_MAGIC: u8 = 0x7f;

/// Longest JSON line a miner may send.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Longest exMessage frame an agent may send.
pub const MAX_EX_LEN: usize = 16 * 1024;

/// exMessage header length: magic, command, u16 length.
pub const EX_HEADER_LEN: usize = 4;

/// One inbound frame.
#[derive(Debug, PartialEq)]
pub enum StratumFrame {
	/// A JSON-RPC line, newline stripped.
	Line(String),
	/// A binary agent frame.
	Ex(ExMessage),
}

/// A decoded exMessage: command plus body (header stripped).
#[derive(Debug, PartialEq)]
pub struct ExMessage {
	/// Command byte.
	pub command: u8,
	/// Frame body after the 4-byte header.
	pub body: Vec<u8>,
}

impl ExMessage {
	/// Serialize with the framing header for the wire.
	pub fn to_frame(&self) -> Vec<u8> {
		let len = EX_HEADER_LEN + self.body.len();
		let mut out = Vec::with_capacity(len);
		out.push(EX_MAGIC);
		out.push(self.command);
		out.extend_from_slice(&(len as u16).to_le_bytes());
		out.extend_from_slice(&self.body);
		out
	}
}

/// One outbound frame.
#[derive(Debug)]
pub enum StratumOut {
	/// A JSON line; the codec appends the newline.
	Line(String),
	/// A pre-framed binary message.
	Raw(Vec<u8>),
}

/// Codec multiplexing lines and exMessages over one stream.
#[derive(Default)]
pub struct StratumCodec;

impl Decoder for StratumCodec {
	type Item = StratumFrame;
	type Error = io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StratumFrame>, io::Error> {
		if src.is_empty() {
			return Ok(None);
		}
		if src[0] == EX_MAGIC {
			if src.len() < EX_HEADER_LEN {
				return Ok(None);
			}
			let len = u16::from_le_bytes([src[2], src[3]]) as usize;
			if len < EX_HEADER_LEN + 1 || len > MAX_EX_LEN {
				return Err(io::Error::new(
					io::ErrorKind::InvalidData,
					format!("invalid exMessage length: {}", len),
				));
			}
			if src.len() < len {
				src.reserve(len - src.len());
				return Ok(None);
			}
			let frame = src.split_to(len);
			return Ok(Some(StratumFrame::Ex(ExMessage {
				command: frame[1],
				body: frame[EX_HEADER_LEN..].to_vec(),
			})));
		}

		match src.iter().position(|b| *b == b'\n') {
			Some(pos) => {
				let line = src.split_to(pos + 1);
				let text = std::str::from_utf8(&line[..pos])
					.map_err(|_| {
						io::Error::new(io::ErrorKind::InvalidData, "line is not utf-8")
					})?
					.trim_end_matches('\r')
					.to_string();
				Ok(Some(StratumFrame::Line(text)))
			}
			None => {
				if src.len() > MAX_LINE_LEN {
					return Err(io::Error::new(
						io::ErrorKind::InvalidData,
						"line too long",
					));
				}
				Ok(None)
			}
		}
	}
}

impl Encoder<StratumOut> for StratumCodec {
	type Error = io::Error;

	fn encode(&mut self, item: StratumOut, dst: &mut BytesMut) -> Result<(), io::Error> {
		match item {
			StratumOut::Line(line) => {
				dst.reserve(line.len() + 1);
				dst.put_slice(line.as_bytes());
				if !line.ends_with('\n') {
					dst.put_u8(b'\n');
				}
			}
			StratumOut::Raw(bytes) => {
				dst.reserve(bytes.len());
				dst.put_slice(&bytes);
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn decode_all(codec: &mut StratumCodec, bytes: &[u8]) -> Vec<StratumFrame> {
		let mut buf = BytesMut::from(bytes);
		let mut frames = Vec::new();
		while let Some(frame) = codec.decode(&mut buf).unwrap() {
			frames.push(frame);
		}
		frames
	}

	#[test]
	fn decodes_lines_and_strips_crlf() {
		let mut codec = StratumCodec::default();
		let frames = decode_all(&mut codec, b"{\"id\":1}\r\n{\"id\":2}\n");
		assert_eq!(
			frames,
			vec![
				StratumFrame::Line("{\"id\":1}".to_string()),
				StratumFrame::Line("{\"id\":2}".to_string()),
			]
		);
	}

	#[test]
	fn holds_partial_line() {
		let mut codec = StratumCodec::default();
		let mut buf = BytesMut::from(&b"{\"id\""[..]);
		assert_eq!(codec.decode(&mut buf).unwrap(), None);
	}

	#[test]
	fn decodes_ex_message() {
		let msg = ExMessage {
			command: 0x02,
			body: vec![1, 2, 3],
		};
		let mut codec = StratumCodec::default();
		let frames = decode_all(&mut codec, &msg.to_frame());
		assert_eq!(frames, vec![StratumFrame::Ex(msg)]);
	}

	#[test]
	fn mixed_stream_decodes_in_order() {
		let ex = ExMessage {
			command: 0x01,
			body: vec![0xaa],
		};
		let mut bytes = b"{\"id\":1}\n".to_vec();
		bytes.extend_from_slice(&ex.to_frame());
		bytes.extend_from_slice(b"{\"id\":2}\n");

		let mut codec = StratumCodec::default();
		let frames = decode_all(&mut codec, &bytes);
		assert_eq!(frames.len(), 3);
		assert_eq!(frames[0], StratumFrame::Line("{\"id\":1}".to_string()));
		assert_eq!(frames[1], StratumFrame::Ex(ex));
		assert_eq!(frames[2], StratumFrame::Line("{\"id\":2}".to_string()));
	}

	#[test]
	fn rejects_bad_ex_length() {
		let mut codec = StratumCodec::default();
		let mut buf = BytesMut::from(&[EX_MAGIC, 0x02, 0x02, 0x00][..]);
		assert!(codec.decode(&mut buf).is_err());
	}

	#[test]
	fn rejects_oversized_line() {
		let mut codec = StratumCodec::default();
		let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_LEN + 1].as_slice());
		assert!(codec.decode(&mut buf).is_err());
	}

	#[test]
	fn encoder_appends_newline() {
		let mut codec = StratumCodec::default();
		let mut buf = BytesMut::new();
		codec
			.encode(StratumOut::Line("{\"id\":1}".to_string()), &mut buf)
			.unwrap();
		assert_eq!(&buf[..], b"{\"id\":1}\n");
	}
}
