//! 管道实例：共享状态、构造与拆分。
//!
//! # 模块定位（Why）
//! - [`PipeShared`] 是写端与读端共同引用的唯一状态块：两块环形存储、四个发布计数器、EOF 位置、
//!   关停标记与取消令牌；除此之外的一切（工作位置、批量计数、重放快照）都归某一端独占；
//! - [`Pipe`] 是构造期与监控期的句柄：分配存储、在拆分前重置位置、拆分出
//!   [`PipeWriter`]/[`PipeReader`]，之后仍可用于观察与关停。
//!
//! # 并发契约（What）
//! - 头计数只由写端发布（`Release`），尾计数只由读端发布；对端通过 `Acquire` 观察；
//! - 工作位置镜像（`working_*`）以 `Relaxed` 写入，仅供诊断输出，不参与同步。

use alloc::string::{String, ToString};
use core::fmt;

use bytes::Bytes;
use spin::Once;
use tracing::{error, info, warn};

use crate::cancel::Cancellation;
use crate::config::PipeConfig;
use crate::error::{PipeError, Result};
use crate::padded::{PaddedInt, PaddedLong};
use crate::reader::PipeReader;
use crate::ring::{BlobRing, SlabRing};
use crate::schema::MessageSchema;
use crate::sync::{self, Arc, AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use crate::writer::PipeWriter;

/// 写端与读端共享的状态块。
pub(crate) struct PipeShared {
    pub(crate) id: u32,
    pub(crate) config: PipeConfig,
    pub(crate) slab: SlabRing,
    pub(crate) blob: BlobRing,
    pub(crate) max_avg_var_len: i32,
    pub(crate) slab_head: PaddedLong,
    pub(crate) slab_tail: PaddedLong,
    pub(crate) blob_head: PaddedInt,
    pub(crate) blob_tail: PaddedInt,
    pub(crate) eof_position: PaddedLong,
    pub(crate) working: WorkingMirror,
    pub(crate) cancellation: Cancellation,
    shutdown: AtomicBool,
    shutdown_cause: Once<String>,
}

/// 两端工作位置的诊断镜像。
pub(crate) struct WorkingMirror {
    pub(crate) slab_head: AtomicI64,
    pub(crate) slab_tail: AtomicI64,
    pub(crate) blob_head: AtomicI32,
    pub(crate) blob_tail: AtomicI32,
}

impl WorkingMirror {
    fn new(slab_pos: i64, blob_pos: i32) -> Self {
        Self {
            slab_head: AtomicI64::new(slab_pos),
            slab_tail: AtomicI64::new(slab_pos),
            blob_head: AtomicI32::new(blob_pos),
            blob_tail: AtomicI32::new(blob_pos),
        }
    }

    pub(crate) fn record_head(&self, slab: i64, blob: i32) {
        self.slab_head.store(slab, Ordering::Relaxed);
        self.blob_head.store(blob, Ordering::Relaxed);
    }

    pub(crate) fn record_tail(&self, slab: i64, blob: i32) {
        self.slab_tail.store(slab, Ordering::Relaxed);
        self.blob_tail.store(blob, Ordering::Relaxed);
    }
}

impl PipeShared {
    pub(crate) fn slab_size(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn blob_size(&self) -> usize {
        self.blob.len()
    }

    /// 字节环下标掩码，用于把位置截断到 `[0, blob_size)`。
    pub(crate) fn blob_mask(&self) -> i32 {
        self.blob.mask() as i32
    }

    pub(crate) fn schema(&self) -> &MessageSchema {
        self.config.schema()
    }

    pub(crate) fn constants(&self) -> &Bytes {
        self.config.constants()
    }

    /// 切换到关停状态，返回是否为首次关停。首次关停的原因会被保留并回放给之后的每个自旋者。
    pub(crate) fn shutdown(&self, cause: &str) -> bool {
        let mut first = false;
        self.shutdown_cause.call_once(|| {
            first = true;
            cause.to_string()
        });
        self.shutdown.store(true, Ordering::Release);
        if first {
            info!(pipe = self.id, cause, "pipe shut down");
        }
        first
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_error(&self) -> PipeError {
        PipeError::Shutdown {
            pipe: self.id,
            cause: self.shutdown_cause.get().cloned().unwrap_or_default(),
        }
    }

    /// 一次自旋迭代：先让出线程，再检查关停与取消。
    pub(crate) fn spin_work(&self) -> Result<()> {
        sync::yield_now();
        if self.is_shutdown() {
            return Err(self.shutdown_error());
        }
        if self.cancellation.is_cancelled() {
            return Err(PipeError::Interrupted { pipe: self.id });
        }
        Ok(())
    }

    /// 已发布但尚未释放的槽位数。先读尾再读头，保证结果不为负。
    pub(crate) fn content_remaining(&self) -> i64 {
        let tail = self.slab_tail.get();
        let head = self.slab_head.get();
        head - tail
    }

    /// 以给定的写端工作头计算字节环中的占用字节数。
    pub(crate) fn bytes_of_content(&self, working_blob_head: i32) -> i32 {
        let mask = self.blob_mask();
        let used = (mask & working_blob_head) - (mask & self.blob_tail.get());
        if used < 0 { used + self.blob_size() as i32 } else { used }
    }

    pub(crate) fn is_end_of_pipe(&self, tail_position: i64) -> bool {
        tail_position >= self.eof_position.get()
    }

    fn reset_positions(&self, slab_pos: i64, blob_pos: i32) {
        self.slab_head.set(slab_pos);
        self.slab_tail.set(slab_pos);
        self.blob_head.set(blob_pos);
        self.blob_tail.set(blob_pos);
        self.eof_position.set(i64::MAX);
        self.working.record_head(slab_pos, blob_pos);
        self.working.record_tail(slab_pos, blob_pos);
    }

    pub(crate) fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remaining = self.content_remaining();
        let tail = self.slab_tail.get();
        write!(
            f,
            "RingId<{}>:{} slabTailPos {} slabWrkTailPos {} slabHeadPos {} slabWrkHeadPos {}  {}/{}  blobTailPos {} blobWrkTailPos {} blobHeadPos {} blobWrkHeadPos {}",
            self.schema().name(),
            self.id,
            tail,
            self.working.slab_tail.load(Ordering::Relaxed),
            self.slab_head.get(),
            self.working.slab_head.load(Ordering::Relaxed),
            remaining,
            self.slab_size(),
            self.blob_tail.get(),
            self.working.blob_tail.load(Ordering::Relaxed),
            self.blob_head.get(),
            self.working.blob_head.load(Ordering::Relaxed),
        )?;
        if self.is_end_of_pipe(tail) {
            write!(f, " Ended at {}", self.eof_position.get())?;
        }
        Ok(())
    }
}

/// 管道编号的分配器。
///
/// # 设计背景（Why）
/// - 管道编号只用于诊断输出与日志关联，使用显式注册表而非全局静态量，
///   测试之间互不干扰，多个嵌入方也可以各自维护独立的编号空间。
pub struct PipeRegistry {
    created: AtomicU32,
}

impl PipeRegistry {
    pub fn new() -> Self {
        Self {
            created: AtomicU32::new(0),
        }
    }

    /// 校验配置并创建一个尚未分配存储的管道。
    pub fn create(&self, config: PipeConfig) -> Result<Pipe> {
        config.validate()?;
        let id = self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Pipe::new(id, config))
    }

    /// 已创建的管道总数。
    pub fn total_pipes(&self) -> u32 {
        self.created.load(Ordering::Relaxed)
    }
}

impl Default for PipeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeRegistry")
            .field("total_pipes", &self.total_pipes())
            .finish()
    }
}

/// 管道句柄。
///
/// # 生命周期（How）
/// 1. 由 [`PipeRegistry::create`] 创建，此时尚未分配存储；
/// 2. [`init_buffers`](Self::init_buffers) 一次性分配槽环与字节环；
/// 3. 可选地 [`reset_to`](Self::reset_to) 把位置移到任意起点（常用于测试回绕）；
/// 4. [`split`](Self::split) 拆分出唯一的写端与读端；
/// 5. 拆分后句柄仍可用于诊断输出、统计与关停。
///
/// # 契约说明（What）
/// - `split` 只能成功一次；拆分后禁止 `reset`；
/// - 分配失败会记录错误日志、把管道标记为关停并返回 [`PipeError::AllocationFailed`]，
///   是否退出进程由嵌入方决定。
pub struct Pipe {
    id: u32,
    config: PipeConfig,
    shared: Option<Arc<PipeShared>>,
    cancellation: Cancellation,
    split: bool,
    allocation_failed: bool,
}

impl Pipe {
    fn new(id: u32, config: PipeConfig) -> Self {
        Self {
            id,
            config,
            shared: None,
            cancellation: Cancellation::new(),
            split: false,
            allocation_failed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    pub fn schema_name(&self) -> &str {
        self.config.schema().name()
    }

    /// 片段尺寸；`-1` 返回 EOF 尺寸，未知编号返回 `None`。
    pub fn size_of(&self, msg_idx: i32) -> Option<usize> {
        self.config.schema().fragment_size(msg_idx)
    }

    /// 自旋等待共享的取消令牌；对其调用 `cancel` 会让两端的阻塞调用返回
    /// [`PipeError::Interrupted`]。
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.child()
    }

    pub fn is_init(&self) -> bool {
        self.shared.is_some()
    }

    pub fn is_split(&self) -> bool {
        self.split
    }

    /// 分配环形存储。重复调用只记录告警，不会重新分配。
    pub fn init_buffers(&mut self) -> Result<()> {
        if self.shared.is_some() {
            warn!(pipe = self.id, "init_buffers called more than once; existing buffers are kept");
            return Ok(());
        }
        let slab_size = self.config.slab_size();
        let blob_size = self.config.blob_size();
        let (Some(slab), Some(blob)) = (
            SlabRing::allocate(self.config.slab_bits()),
            BlobRing::allocate(self.config.blob_bits()),
        ) else {
            error!(
                pipe = self.id,
                slab_size, blob_size, "unable to allocate pipe buffers; pipe is shut down"
            );
            self.allocation_failed = true;
            return Err(PipeError::AllocationFailed {
                slab_size,
                blob_size,
            });
        };
        self.shared = Some(Arc::new(PipeShared {
            id: self.id,
            max_avg_var_len: self.config.max_avg_var_len(),
            config: self.config.clone(),
            slab,
            blob,
            slab_head: PaddedLong::new(0),
            slab_tail: PaddedLong::new(0),
            blob_head: PaddedInt::new(0),
            blob_tail: PaddedInt::new(0),
            eof_position: PaddedLong::new(i64::MAX),
            working: WorkingMirror::new(0, 0),
            cancellation: self.cancellation.child(),
            shutdown: AtomicBool::new(false),
            shutdown_cause: Once::new(),
        }));
        Ok(())
    }

    /// 清空存储并把所有位置归零。
    pub fn reset(&mut self) -> Result<()> {
        let shared = self.unsplit_shared()?;
        shared.slab.clear();
        shared.blob.clear();
        shared.reset_positions(0, 0);
        Ok(())
    }

    /// 把所有头尾位置移到给定起点，用于在测试中制造回绕。
    pub fn reset_to(&mut self, slab_pos: i64, blob_pos: i32) -> Result<()> {
        let shared = self.unsplit_shared()?;
        shared.reset_positions(slab_pos, blob_pos & crate::ring::BYTES_WRAP_MASK);
        Ok(())
    }

    fn unsplit_shared(&self) -> Result<&Arc<PipeShared>> {
        if self.split {
            return Err(PipeError::AlreadySplit { pipe: self.id });
        }
        self.shared
            .as_ref()
            .ok_or(PipeError::NotInitialized { pipe: self.id })
    }

    /// 拆分为唯一的写端与读端。
    pub fn split(&mut self) -> Result<(PipeWriter, PipeReader)> {
        let shared = Arc::clone(self.unsplit_shared()?);
        self.split = true;
        let writer = PipeWriter::new(Arc::clone(&shared));
        let reader = PipeReader::new(shared);
        Ok((writer, reader))
    }

    fn shared(&self) -> Result<&PipeShared> {
        self.shared
            .as_deref()
            .ok_or(PipeError::NotInitialized { pipe: self.id })
    }

    /// 手动关停管道，返回是否为首次关停。未初始化的管道返回 `false`。
    pub fn shutdown(&self, cause: &str) -> bool {
        self.shared
            .as_deref()
            .is_some_and(|shared| shared.shutdown(cause))
    }

    pub fn is_shutdown(&self) -> bool {
        self.allocation_failed
            || self
                .shared
                .as_deref()
                .is_some_and(PipeShared::is_shutdown)
    }

    pub fn content_remaining(&self) -> Result<i64> {
        Ok(self.shared()?.content_remaining())
    }

    /// 字节环占用，写端工作头取自最近一次片段收尾时的镜像。
    pub fn bytes_of_content(&self) -> Result<i32> {
        let shared = self.shared()?;
        Ok(shared.bytes_of_content(shared.working.blob_head.load(Ordering::Relaxed)))
    }

    pub fn is_end_of_pipe(&self, tail_position: i64) -> Result<bool> {
        Ok(self.shared()?.is_end_of_pipe(tail_position))
    }

    pub fn head_position(&self) -> Result<i64> {
        Ok(self.shared()?.slab_head.get())
    }

    pub fn tail_position(&self) -> Result<i64> {
        Ok(self.shared()?.slab_tail.get())
    }

    pub fn blob_head_position(&self) -> Result<i32> {
        Ok(self.shared()?.blob_head.get())
    }

    pub fn blob_tail_position(&self) -> Result<i32> {
        Ok(self.shared()?.blob_tail.get())
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.as_deref() {
            Some(shared) => shared.describe(f),
            None => write!(f, "RingId<{}>:{} uninitialized", self.schema_name(), self.id),
        }
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("config", &self.config.to_string())
            .field("init", &self.is_init())
            .field("split", &self.split)
            .finish()
    }
}
