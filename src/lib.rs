#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod codec;
pub mod error;
pub mod extension;
pub mod fec;
pub mod header;
pub mod packet;
pub mod packetizer;
pub mod receiver;
pub mod sender;
pub mod sequence;

pub use header::Header;
pub use packet::Packet;
