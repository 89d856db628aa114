// src/protocol/mod.rs
// 线协议：帧头、分帧、消息编解码、参数快照
pub mod codec;
pub mod error;
pub mod framing;
pub mod header;
pub mod params;
// 常用类型直接导出
pub use codec::{decode, CellPosition, CommandProbability, Envelope, ServerEvent};
pub use error::{ConfigurationError, ProtocolError};
pub use framing::{encode_frame, FrameDecoder};
pub use header::{ContentEncoding, FrameHeader};
pub use params::{Cell, ColorTable, Matrix, Parameters, RunSetup, Timings};
