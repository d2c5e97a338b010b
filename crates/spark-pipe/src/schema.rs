//! 片段描述表：管道消费的唯一模式信息。
//!
//! # 模块定位（Why）
//! - 模板编译器属于外部协作者，管道只需要知道每种片段占多少槽位、字段类型、
//!   可选字段的“缺失”哨兵值以及哪些编号是合法的消息起点；
//! - 字段类型是一个封闭集合，使用枚举 + 穷尽匹配表达，新增类型时编译器会指出所有需要更新的分支。
//!
//! # 片段尺寸约定（What）
//! - 消息首片段 = 1 个消息编号槽 + 字段槽 + 1 个尾随字节计数槽；
//! - 嵌套片段 = 字段槽 + 1 个尾随字节计数槽；
//! - EOF 哨兵固定占用 [`EOF_SIZE`] 个槽位，编号为 `-1`。

use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use crate::error::{PipeError, Result};
use crate::ring::EOF_SIZE;

/// 字段类型标签。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Int,
    OptionalInt,
    Long,
    OptionalLong,
    Decimal,
    OptionalDecimal,
    Ascii,
    Utf8,
    Bytes,
    /// 序列长度，决定其后嵌套片段的重复次数。
    GroupLength,
}

impl FieldKind {
    /// 字段在槽环中占用的单元数。
    pub const fn slot_width(self) -> usize {
        match self {
            FieldKind::Int | FieldKind::OptionalInt | FieldKind::GroupLength => 1,
            FieldKind::Long | FieldKind::OptionalLong => 2,
            FieldKind::Decimal | FieldKind::OptionalDecimal => 3,
            // 描述符：相对偏移 + 长度。
            FieldKind::Ascii | FieldKind::Utf8 | FieldKind::Bytes => 2,
        }
    }

    /// 是否为落在字节环中的变长字段。
    pub const fn is_var_length(self) -> bool {
        matches!(self, FieldKind::Ascii | FieldKind::Utf8 | FieldKind::Bytes)
    }

    pub const fn is_optional(self) -> bool {
        matches!(
            self,
            FieldKind::OptionalInt | FieldKind::OptionalLong | FieldKind::OptionalDecimal
        )
    }
}

/// 单个片段的布局描述。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentDescriptor {
    name: String,
    fields: Vec<FieldKind>,
    size: usize,
    var_fields: usize,
    message_start: bool,
}

impl FragmentDescriptor {
    fn new(name: String, fields: Vec<FieldKind>, message_start: bool) -> Self {
        let body: usize = fields.iter().map(|kind| kind.slot_width()).sum();
        let var_fields = fields.iter().filter(|kind| kind.is_var_length()).count();
        let size = body + 1 + usize::from(message_start);
        Self {
            name,
            fields,
            size,
            var_fields,
            message_start,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }

    /// 片段在槽环中占用的总单元数（含编号与尾随计数）。
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn var_field_count(&self) -> usize {
        self.var_fields
    }

    pub fn is_message_start(&self) -> bool {
        self.message_start
    }
}

/// 以消息编号为键的片段描述表。
///
/// # 契约说明（What）
/// - 消息编号即片段在表中的下标；
/// - `absent32`/`absent64` 是可选标量的缺失哨兵，读取到该值时返回 `None`；
/// - `max_var_field_per_unit` 为所有片段中“变长字段数 / 片段尺寸”的最大值，
///   用于推导变长平均长度上限与批量尺寸上限。
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSchema {
    name: String,
    fragments: Vec<FragmentDescriptor>,
    absent32: i32,
    absent64: i64,
    max_fragment_size: usize,
    min_fragment_size: usize,
    max_var_field_per_unit: f64,
}

impl MessageSchema {
    /// 缺省的 32 位缺失哨兵。
    pub const DEFAULT_ABSENT_32: i32 = i32::MAX;
    /// 缺省的 64 位缺失哨兵。
    pub const DEFAULT_ABSENT_64: i64 = i64::MAX;

    pub fn builder(name: impl Into<String>) -> MessageSchemaBuilder {
        MessageSchemaBuilder {
            name: name.into(),
            fragments: Vec::new(),
            absent32: Self::DEFAULT_ABSENT_32,
            absent64: Self::DEFAULT_ABSENT_64,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fragments(&self) -> &[FragmentDescriptor] {
        &self.fragments
    }

    pub fn fragment(&self, msg_idx: i32) -> Option<&FragmentDescriptor> {
        usize::try_from(msg_idx)
            .ok()
            .and_then(|idx| self.fragments.get(idx))
    }

    /// 片段尺寸；`-1` 表示 EOF 哨兵。
    pub fn fragment_size(&self, msg_idx: i32) -> Option<usize> {
        if msg_idx == -1 {
            return Some(EOF_SIZE);
        }
        self.fragment(msg_idx).map(FragmentDescriptor::size)
    }

    pub fn is_message_start(&self, msg_idx: i32) -> bool {
        self.fragment(msg_idx)
            .is_some_and(FragmentDescriptor::is_message_start)
    }

    pub fn absent32(&self) -> i32 {
        self.absent32
    }

    pub fn absent64(&self) -> i64 {
        self.absent64
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    pub fn min_fragment_size(&self) -> usize {
        self.min_fragment_size
    }

    pub fn max_var_field_per_unit(&self) -> f64 {
        self.max_var_field_per_unit
    }

    pub fn has_var_fields(&self) -> bool {
        self.max_var_field_per_unit > 0.0
    }

    /// 给定槽环尺寸时，同一时刻可能驻留在环中的变长字段数上限（至少为 1）。
    pub fn max_var_fields_in_window(&self, slab_size: usize) -> usize {
        let count = (slab_size as f64 * self.max_var_field_per_unit).ceil() as usize;
        count.max(1)
    }
}

/// [`MessageSchema`] 的构建器。
#[derive(Debug, Clone)]
pub struct MessageSchemaBuilder {
    name: String,
    fragments: Vec<FragmentDescriptor>,
    absent32: i32,
    absent64: i64,
}

impl MessageSchemaBuilder {
    /// 追加一个消息首片段，编号为当前片段数。
    pub fn message(
        mut self,
        name: impl Into<String>,
        fields: impl IntoIterator<Item = FieldKind>,
    ) -> Self {
        self.fragments.push(FragmentDescriptor::new(
            name.into(),
            fields.into_iter().collect(),
            true,
        ));
        self
    }

    /// 追加一个嵌套片段（序列体），它不是合法的消息起点。
    pub fn nested_fragment(
        mut self,
        name: impl Into<String>,
        fields: impl IntoIterator<Item = FieldKind>,
    ) -> Self {
        self.fragments.push(FragmentDescriptor::new(
            name.into(),
            fields.into_iter().collect(),
            false,
        ));
        self
    }

    pub fn absent_values(mut self, absent32: i32, absent64: i64) -> Self {
        self.absent32 = absent32;
        self.absent64 = absent64;
        self
    }

    pub fn build(self) -> Result<MessageSchema> {
        if self.fragments.is_empty() {
            return Err(PipeError::invalid_config(alloc::format!(
                "schema `{}` declares no fragments",
                self.name
            )));
        }
        if !self.fragments.iter().any(FragmentDescriptor::is_message_start) {
            return Err(PipeError::invalid_config(
                "schema must declare at least one message".to_string(),
            ));
        }
        let max_fragment_size = self
            .fragments
            .iter()
            .map(FragmentDescriptor::size)
            .max()
            .unwrap_or(EOF_SIZE);
        let min_fragment_size = self
            .fragments
            .iter()
            .map(FragmentDescriptor::size)
            .min()
            .unwrap_or(EOF_SIZE);
        let max_var_field_per_unit = self
            .fragments
            .iter()
            .map(|fragment| fragment.var_field_count() as f64 / fragment.size() as f64)
            .fold(0.0_f64, f64::max);
        Ok(MessageSchema {
            name: self.name,
            fragments: self.fragments,
            absent32: self.absent32,
            absent64: self.absent64,
            max_fragment_size,
            min_fragment_size,
            max_var_field_per_unit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MessageSchema {
        MessageSchema::builder("Sample")
            .message("Tick", [FieldKind::Int, FieldKind::Long])
            .message("Text", [FieldKind::Ascii])
            .message("Group", [FieldKind::GroupLength])
            .nested_fragment("Entry", [FieldKind::Decimal, FieldKind::Bytes])
            .build()
            .expect("构建示例模式")
    }

    #[test]
    fn fragment_sizes_include_id_and_trailing_count() {
        let schema = sample();
        assert_eq!(schema.fragment_size(0), Some(1 + 1 + 2 + 1));
        assert_eq!(schema.fragment_size(1), Some(4));
        assert_eq!(schema.fragment_size(3), Some(3 + 2 + 1), "嵌套片段不含消息编号槽");
        assert_eq!(schema.fragment_size(-1), Some(EOF_SIZE));
        assert_eq!(schema.fragment_size(9), None);
    }

    #[test]
    fn message_starts_exclude_nested_fragments() {
        let schema = sample();
        assert!(schema.is_message_start(2));
        assert!(!schema.is_message_start(3));
        assert!(!schema.is_message_start(-1));
    }

    #[test]
    fn var_field_ratio_drives_window_count() {
        let schema = sample();
        assert_eq!(schema.max_var_field_per_unit(), 0.25);
        assert_eq!(schema.max_var_fields_in_window(16), 4);
        assert_eq!(schema.max_fragment_size(), 6);
        assert_eq!(schema.min_fragment_size(), 3);
    }

    #[test]
    fn schema_without_messages_is_rejected() {
        let error = MessageSchema::builder("Empty")
            .nested_fragment("Only", [FieldKind::Int])
            .build()
            .expect_err("缺少消息起点应失败");
        assert_eq!(error.code(), "pipe.invalid_config");
    }
}
