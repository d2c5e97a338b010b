#![deny(unsafe_code)]

//! `spark-pipe` 提供单生产者/单消费者阶段之间的零拷贝无锁管道。
//!
//! # 模块定位（Why）
//! - 流水线各阶段之间需要一种不加锁、不按消息分配内存、容量可预测的传输通道；
//! - 消息按模式切分为定长片段：标量与变长字段描述符写入槽环（slab），变长字段的原始字节写入
//!   字节环（blob），两端只通过四个发布计数器协作。
//!
//! # 设计概要（How）
//! - [`PipeRegistry`] 创建 [`Pipe`]，[`Pipe::init_buffers`] 一次性分配存储，
//!   [`Pipe::split`] 拆分出唯一的 [`PipeWriter`] 与 [`PipeReader`]；
//! - 写端按“开始消息 → 写字段 → 确认 → 发布”推进，读端按“取编号 → 读字段 → 确认 → 释放”推进；
//! - 发布与释放都支持批量，读端支持延迟释放与重放未释放的片段；
//! - 变长字段长度受移动平均上限约束，越界时管道关停并返回 [`PipeError`]，不会静默丢数据。
//!
//! # 并发契约（What）
//! - 写端与读端各自 `Send` 而非 `Sync`，单写单读由类型系统保证；
//! - 计数器以 `Release` 发布、`Acquire` 观察；环形存储单元使用 `Relaxed` 原子，
//!   可见性由发布计数器建立的先行关系保证；
//! - 自旋等待在每次迭代让出线程，并检查关停标记与 [`Cancellation`] 令牌。
//!
//! # 模型测试
//! - 启用 `loom-model` Feature 并设置 `RUSTFLAGS="--cfg loom"` 后，原子类型切换为 Loom 实现，
//!   `tests/loom_pipe.rs` 穷举发布/消费的交错。

extern crate alloc;

mod sync;

mod blob_reader;
mod blob_writer;
mod cache;
mod cancel;
pub mod codec;
mod config;
mod error;
mod padded;
mod pipe;
mod reader;
mod regulator;
mod ring;
mod schema;
mod writer;

pub use blob_reader::BlobReader;
pub use blob_writer::BlobWriter;
pub use cache::{ReadPositionCache, WritePositionCache};
pub use cancel::Cancellation;
pub use config::{BatchingSettings, MAX_BITS, PipeConfig, PipeSettings, SizingSettings};
pub use error::{PipeError, Result};
pub use padded::{PaddedInt, PaddedLong};
pub use pipe::{Pipe, PipeRegistry};
pub use reader::PipeReader;
pub use regulator::RateRegulator;
pub use ring::{BYTES_WRAP_MASK, BlobRing, EOF_SIZE, RELATIVE_POS_MASK, SlabRing};
pub use schema::{FieldKind, FragmentDescriptor, MessageSchema, MessageSchemaBuilder};
pub use writer::PipeWriter;
