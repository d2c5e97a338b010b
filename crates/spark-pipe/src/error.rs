//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义管道对外暴露的错误语义，调用方可以据此区分“容量/协议违规”“关停/中断”“配置错误”；
//! - 每个变体都携带足以诊断容量配置问题的上下文（长度、位置、位宽、上限），不存在静默丢数据的路径。
//!
//! ## 设计要求（What）
//! - 所有错误类型通过 `thiserror::Error` 派生，兼容 `std::error::Error`；
//! - [`PipeError::code`] 返回稳定的机器可读错误码，命名遵循 `pipe.<reason>` 约定；
//! - 损坏的 UTF-8 内容不会出现在这里：它在解码处被替换为 U+FFFD 并记录日志。

use alloc::string::String;

use thiserror::Error;

/// 管道错误的统一结果别名。
pub type Result<T, E = PipeError> = core::result::Result<T, E>;

/// 管道核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：容量与协议违规代表调用方破坏了单写单读/有界尺寸的契约，
///   无法安全继续，因此这些错误同时会把管道切换到关停状态；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可以跨线程传播；
/// - **风险 (Trade-offs)**：上下文使用 `String` 保存，换取可读性，仅在错误路径上分配。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipeError {
    /// 管道已关停，自旋等待中的线程被唤醒并终止。
    #[error("pipe {pipe} is shut down: {cause}")]
    Shutdown { pipe: u32, cause: String },

    /// 自旋等待期间观察到取消令牌。
    #[error("pipe {pipe} spin-wait interrupted by cancellation")]
    Interrupted { pipe: u32 },

    /// 变长字段的移动平均超过上限。
    ///
    /// `bits_dif` 给出槽环与字节环位宽之间建议保持的最小差值。
    #[error(
        "can not write variable field of length {length}: moving average {average} exceeds limit {limit}; \
         slab/blob bits {slab_bits}/{blob_bits}, keep their difference at least {bits_dif}"
    )]
    VarLengthExceeded {
        length: i32,
        average: i32,
        limit: i32,
        slab_bits: u8,
        blob_bits: u8,
        bits_dif: u32,
    },

    /// 批量尺寸超过当前环容量所能容纳的上限。
    #[error("batch size {requested} exceeds the maximum {max} for this pipe")]
    BatchSizeTooLarge { requested: u32, max: u32 },

    /// 已有一个打开的字节环写入，禁止重复打开。
    #[error("only one open write against the blob at a time")]
    BlobWriteAlreadyOpen,

    /// 关闭了一个并未打开的字节环写入。
    #[error("no open blob write to close")]
    BlobWriteNotOpen,

    /// 槽环剩余空间不足以容纳请求的片段。
    #[error("insufficient room: need {required} slab slots, {available} free")]
    InsufficientRoom { required: usize, available: i64 },

    /// 消息编号不是模式中登记的消息起点。
    #[error("message index {msg_idx} is not a message start in schema `{schema}`")]
    UnknownMessage { msg_idx: i32, schema: String },

    /// 字符无法以 UTF-8（含 5/6 字节旧式编码）表达。
    #[error("can not encode char with value {value:#x}")]
    UnencodableChar { value: u32 },

    /// 尚未调用 `init_buffers`。
    #[error("pipe {pipe} buffers are not initialized")]
    NotInitialized { pipe: u32 },

    /// 读写句柄已经被拆分出去。
    #[error("pipe {pipe} has already been split into writer and reader")]
    AlreadySplit { pipe: u32 },

    /// 环形存储分配失败。
    #[error("failed to allocate slab of {slab_size} cells and blob of {blob_size} bytes")]
    AllocationFailed { slab_size: usize, blob_size: usize },

    /// 配置不合法。
    #[error("invalid pipe configuration: {reason}")]
    InvalidConfig { reason: String },

    /// 向外部流读写字段失败。
    #[error("field stream I/O failed: {reason}")]
    Io { reason: String },
}

impl PipeError {
    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            PipeError::Shutdown { .. } => "pipe.shutdown",
            PipeError::Interrupted { .. } => "pipe.interrupted",
            PipeError::VarLengthExceeded { .. } => "pipe.var_length_exceeded",
            PipeError::BatchSizeTooLarge { .. } => "pipe.batch_size_too_large",
            PipeError::BlobWriteAlreadyOpen => "pipe.blob_write_already_open",
            PipeError::BlobWriteNotOpen => "pipe.blob_write_not_open",
            PipeError::InsufficientRoom { .. } => "pipe.insufficient_room",
            PipeError::UnknownMessage { .. } => "pipe.unknown_message",
            PipeError::UnencodableChar { .. } => "pipe.unencodable_char",
            PipeError::NotInitialized { .. } => "pipe.not_initialized",
            PipeError::AlreadySplit { .. } => "pipe.already_split",
            PipeError::AllocationFailed { .. } => "pipe.allocation_failed",
            PipeError::InvalidConfig { .. } => "pipe.invalid_config",
            PipeError::Io { .. } => "pipe.io",
        }
    }

    /// 是否为终止性错误：当前调用无法继续，调用方应停止驱动这一端。
    ///
    /// 终止性错误中只有 [`PipeError::Interrupted`] 不关停管道，见
    /// [`shuts_down_pipe`](Self::shuts_down_pipe)。
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipeError::Shutdown { .. }
                | PipeError::Interrupted { .. }
                | PipeError::VarLengthExceeded { .. }
                | PipeError::BlobWriteAlreadyOpen
                | PipeError::BlobWriteNotOpen
                | PipeError::InsufficientRoom { .. }
                | PipeError::AllocationFailed { .. }
        )
    }

    /// 出现该错误时管道是否已切换到关停状态。
    ///
    /// 取消令牌只打断持有它的自旋者，管道本身仍可继续使用，因此 `Interrupted` 返回 `false`。
    pub fn shuts_down_pipe(&self) -> bool {
        self.is_terminal() && !matches!(self, PipeError::Interrupted { .. })
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        PipeError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for PipeError {
    fn from(error: std::io::Error) -> Self {
        PipeError::Io {
            reason: alloc::format!("{error}"),
        }
    }
}
