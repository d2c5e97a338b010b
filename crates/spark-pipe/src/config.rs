//! 管道构造期配置。
//!
//! # 模块定位（Why）
//! - 管道容量在构造时一次性决定，之后不再扩容；所有尺寸相关的推导（位宽、变长平均上限、
//!   批量上限）集中在这里，避免散落在读写热路径上；
//! - 提供两种入口：直接给定位宽，或按“至少容纳多少片段 + 变长字段最大长度”反推位宽；
//!   后者同样可以从 TOML 文本反序列化得到，便于部署时调整。
//!
//! # 契约说明（What）
//! - 位宽上限为 [`MAX_BITS`]，保证字节环位置在 31 位回绕空间内保持无歧义；
//! - 批量尺寸 `0` 与 `1` 等价，均表示每个片段立即发布/释放。

use alloc::{format, string::String, sync::Arc};
use core::fmt;

use bytes::Bytes;
use serde::Deserialize;

use crate::error::{PipeError, Result};
use crate::schema::MessageSchema;

/// 槽环与字节环允许的最大位宽。
pub const MAX_BITS: u8 = 30;

/// 显式设置批量尺寸时要求环中至少能容纳的批次数。
pub(crate) const EXPLICIT_BATCH_MUST_FIT: u32 = 2;
/// `set_max_*_batch_size` 使用的更保守的批次数。
pub(crate) const MAX_BATCH_MUST_FIT: u32 = 3;

/// 管道的运行期配置对象。
///
/// # 教案式说明
/// - **意图 (Why)**：把“容量 + 模式 + 常量区 + 批量策略”打包成一个不可变值，
///   管道构造后只读取它，不再接受外部修改；
/// - **契约 (What)**：`slab_bits`、`blob_bits` 均不超过 [`MAX_BITS`]；
///   批量尺寸不超过 [`max_batch_size`](Self::max_batch_size)`(2)`；
/// - **风险 (Trade-offs)**：常量区使用 [`Bytes`] 共享，克隆配置只增加引用计数。
#[derive(Debug, Clone)]
pub struct PipeConfig {
    schema: Arc<MessageSchema>,
    slab_bits: u8,
    blob_bits: u8,
    constants: Bytes,
    publish_batch_size: u32,
    release_batch_size: u32,
}

impl PipeConfig {
    /// 以显式位宽构造配置。
    pub fn new(schema: Arc<MessageSchema>, slab_bits: u8, blob_bits: u8) -> Result<Self> {
        if slab_bits > MAX_BITS || blob_bits > MAX_BITS {
            return Err(PipeError::invalid_config(format!(
                "slab bits {slab_bits} / blob bits {blob_bits} exceed the maximum of {MAX_BITS}"
            )));
        }
        Ok(Self {
            schema,
            slab_bits,
            blob_bits,
            constants: Bytes::new(),
            publish_batch_size: 0,
            release_batch_size: 0,
        })
    }

    /// 按容量需求推导位宽。
    ///
    /// # 逻辑解析（How）
    /// - 槽环：`min_fragments * 最大片段尺寸` 向上取整到 2 的幂；
    /// - 字节环：同一时刻可能驻留的变长字段数 × `max_var_len`，向上取整到 2 的幂；
    ///   模式中没有变长字段或 `max_var_len == 0` 时字节环位宽为 0。
    pub fn for_capacity(
        schema: Arc<MessageSchema>,
        min_fragments: usize,
        max_var_len: usize,
    ) -> Result<Self> {
        let slab_min = min_fragments.max(1) * schema.max_fragment_size();
        let slab_bits = ceil_log2(slab_min);
        let blob_bits = if max_var_len == 0 || !schema.has_var_fields() {
            0
        } else {
            let fields = schema.max_var_fields_in_window(1usize << slab_bits.min(MAX_BITS));
            ceil_log2(fields.saturating_mul(max_var_len))
        };
        Self::new(schema, slab_bits, blob_bits)
    }

    /// 设置只读常量区，负描述符指向这里。
    pub fn with_constants(mut self, constants: Bytes) -> Self {
        self.constants = constants;
        self
    }

    pub fn with_publish_batch_size(mut self, size: u32) -> Self {
        self.publish_batch_size = size;
        self
    }

    pub fn with_release_batch_size(mut self, size: u32) -> Self {
        self.release_batch_size = size;
        self
    }

    /// 校验批量尺寸是否在容量允许范围内。
    pub fn validate(&self) -> Result<()> {
        let max = self.max_batch_size(EXPLICIT_BATCH_MUST_FIT);
        for (name, size) in [
            ("publish", self.publish_batch_size),
            ("release", self.release_batch_size),
        ] {
            if size > max {
                return Err(PipeError::invalid_config(format!(
                    "{name} batch size {size} exceeds the maximum {max} for slab bits {} / blob bits {}",
                    self.slab_bits, self.blob_bits
                )));
            }
        }
        Ok(())
    }

    pub fn schema(&self) -> &Arc<MessageSchema> {
        &self.schema
    }

    pub fn slab_bits(&self) -> u8 {
        self.slab_bits
    }

    pub fn blob_bits(&self) -> u8 {
        self.blob_bits
    }

    pub fn slab_size(&self) -> usize {
        1usize << self.slab_bits
    }

    pub fn blob_size(&self) -> usize {
        1usize << self.blob_bits
    }

    pub fn constants(&self) -> &Bytes {
        &self.constants
    }

    pub fn publish_batch_size(&self) -> u32 {
        self.publish_batch_size
    }

    pub fn release_batch_size(&self) -> u32 {
        self.release_batch_size
    }

    /// 变长字段移动平均长度的上限。
    ///
    /// 模式没有变长字段或 `slab_bits == 0` 时为 0；否则为
    /// `blob_size / ceil(slab_size * max_var_field_per_unit)`。
    pub fn max_avg_var_len(&self) -> i32 {
        if !self.schema.has_var_fields() || self.slab_bits == 0 {
            return 0;
        }
        let fields = self.schema.max_var_fields_in_window(self.slab_size());
        (self.blob_size() / fields) as i32
    }

    /// 在环中至少容纳 `must_fit` 个批次的前提下，允许的最大批量尺寸。
    pub fn max_batch_size(&self, must_fit: u32) -> u32 {
        let must_fit = must_fit.max(1) as usize;
        let max_avg = self.max_avg_var_len();
        let from_blob = if max_avg == 0 {
            usize::MAX
        } else {
            self.blob_size() / max_avg as usize / must_fit
        };
        let from_slab = self.slab_size() / self.schema.max_fragment_size().max(1) / must_fit;
        from_blob.min(from_slab).min(u32::MAX as usize) as u32
    }
}

impl fmt::Display for PipeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Primary:{} Secondary:{} Schema:{}",
            self.slab_bits,
            self.blob_bits,
            self.schema.name()
        )
    }
}

fn ceil_log2(value: usize) -> u8 {
    (usize::BITS - value.saturating_sub(1).leading_zeros()) as u8
}

/// 可从 TOML 反序列化的配置描述。
///
/// ```toml
/// [sizing]
/// mode = "capacity"
/// min_fragments = 64
/// max_var_len = 256
///
/// [batching]
/// publish = 4
/// release = 4
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PipeSettings {
    pub sizing: SizingSettings,
    #[serde(default)]
    pub batching: BatchingSettings,
}

/// 容量描述的两种形态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingSettings {
    Bits { slab_bits: u8, blob_bits: u8 },
    Capacity { min_fragments: usize, max_var_len: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BatchingSettings {
    #[serde(default)]
    pub publish: u32,
    #[serde(default)]
    pub release: u32,
}

impl PipeSettings {
    /// 解析 TOML 文本。
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| PipeError::invalid_config(String::from(err.message())))
    }

    /// 结合模式与常量区生成运行期配置，并完成批量尺寸校验。
    pub fn into_config(self, schema: Arc<MessageSchema>, constants: Bytes) -> Result<PipeConfig> {
        let config = match self.sizing {
            SizingSettings::Bits {
                slab_bits,
                blob_bits,
            } => PipeConfig::new(schema, slab_bits, blob_bits)?,
            SizingSettings::Capacity {
                min_fragments,
                max_var_len,
            } => PipeConfig::for_capacity(schema, min_fragments, max_var_len)?,
        }
        .with_constants(constants)
        .with_publish_batch_size(self.batching.publish)
        .with_release_batch_size(self.batching.release);
        config.validate()?;
        Ok(config)
    }
}
