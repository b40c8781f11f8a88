// 上传客户端模块
//
// - chunk: 分片规划
// - transport: 单个分片的 HTTP 发送
// - scheduler: 批次并发、重试、暂停/恢复
// - events: 事件流（替代回调）

pub mod chunk;
pub mod events;
pub mod options;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use chunk::{plan, total_chunks, ChunkDescriptor, DEFAULT_CHUNK_SIZE};
pub use events::{EventEmitter, UploadEvent};
pub use options::UploaderOptions;
pub use scheduler::{UploadOutcome, UploadScheduler};
pub use session::{SessionState, UploadSession};
pub use transport::{ChunkRequest, ChunkTransport, HttpTransport, NormalizedResponse};
