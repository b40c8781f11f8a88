// 服务端接收模块
//
// headers → chunk_receiver → assembler，registry 保存进行中的会话，
// sweeper 回收被放弃的会话目录

pub mod assembler;
pub mod chunk_receiver;
pub mod headers;
pub mod registry;
pub mod sweeper;

pub use assembler::assemble;
pub use chunk_receiver::{ChunkReceiver, FinishedUpload, IncomingRequest, ReceiveOutcome};
pub use headers::HeaderValidator;
pub use registry::{SessionMeta, SessionRegistry, SessionSlot};
pub use sweeper::{spawn_sweeper, sweep_once};
