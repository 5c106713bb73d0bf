//! Agent 协议：消息信封、各类 payload 与编解码

pub mod codec;
pub mod message;

pub use codec::{decode, encode, negotiate_version, Codec, CodecError};
pub use message::*;
