//! 写端句柄：片段写入、字段编码与批量发布。
//!
//! # 协议（How）
//! 1. [`PipeWriter::has_room_for_write`] 或 [`PipeWriter::block_write_message`] 确认槽环空间；
//! 2. [`PipeWriter::add_msg_idx`] 写入消息编号并记录字节环写基址；
//! 3. 依片段布局逐个写入字段；
//! 4. [`PipeWriter::confirm_low_level_write`] 确认片段尺寸，[`PipeWriter::publish_writes`]
//!    写入尾随字节计数并按批量策略发布头位置。
//!
//! # 契约说明（What）
//! - 写端独占所有工作位置，只有发布动作触碰共享计数器；
//! - 变长字段先做移动平均校验再落盘，校验失败会关停管道并返回
//!   [`PipeError::VarLengthExceeded`]，不会写入任何字节。

use alloc::{boxed::Box, format};
use core::{fmt, time::Duration};
use std::io::{self, Read};

use bytes::Buf;
use tracing::{debug, error};

use crate::blob_writer::BlobWriter;
use crate::cache::WritePositionCache;
use crate::codec::{
    encode_single_char, left_convert_int_to_ascii, left_convert_long_to_ascii,
    left_convert_long_with_leading_zeros_to_ascii, pack_ascii, ByteSink,
};
use crate::config::{EXPLICIT_BATCH_MUST_FIT, MAX_BATCH_MUST_FIT};
use crate::error::{PipeError, Result};
use crate::pipe::PipeShared;
use crate::regulator::{RateRegulator, RegulatorSlot};
use crate::ring::{BlobRing, BYTES_WRAP_MASK, EOF_SIZE};
use crate::schema::MessageSchema;
use crate::sync::Arc;

/// 十进制 `i32` 文本的最大宽度（含符号），也是整数转 ASCII 的暂存区跨度。
const INT_ASCII_SPAN: i32 = 12;
/// 十进制 `i64` 文本的最大宽度（含符号）。
const LONG_ASCII_SPAN: i32 = 21;
/// 定点小数允许的最大小数位数，保证 `10^places` 落在 `i64` 内。
const MAX_DECIMAL_PLACES: u32 = 18;

/// 管道的唯一写端。
///
/// # 教案式说明
/// - **意图 (Why)**：单生产者约束由类型系统表达，写端既不可克隆也不实现 `Sync`；
/// - **契约 (What)**：所有写入都发生在工作头之后、已发布头之前的窗口内，
///   消费者在发布之前看不到任何半成品；
/// - **风险 (Trade-offs)**：批量发布降低了计数器写入频率，但会推迟对端可见时间，
///   需要在流结束时调用 [`publish_all_batched_writes`](Self::publish_all_batched_writes)。
pub struct PipeWriter {
    shared: Arc<PipeShared>,
    slab_working_head: i64,
    blob_working_head: i32,
    write_base: i32,
    last_consumed: i32,
    cache: WritePositionCache,
    publish_countdown: i32,
    publish_countdown_init: i32,
    last_published_slab: i64,
    last_published_blob: i32,
    avg_var_len: i32,
    marked_head: (i64, i32),
    blob_write_open: bool,
    last_msg_idx: i32,
    regulator: RegulatorSlot,
    next_delay: Duration,
}

impl PipeWriter {
    pub(crate) fn new(shared: Arc<PipeShared>) -> Self {
        let slab_pos = shared.slab_head.get();
        let blob_pos = shared.blob_head.get();
        let batch = shared.config.publish_batch_size() as i32;
        Self {
            cache: WritePositionCache::new(slab_pos, shared.slab_size()),
            slab_working_head: slab_pos,
            blob_working_head: blob_pos,
            write_base: blob_pos,
            last_consumed: blob_pos,
            publish_countdown: batch,
            publish_countdown_init: batch,
            last_published_slab: slab_pos,
            last_published_blob: blob_pos,
            avg_var_len: 0,
            marked_head: (slab_pos, blob_pos),
            blob_write_open: false,
            last_msg_idx: -1,
            regulator: RegulatorSlot::default(),
            next_delay: Duration::ZERO,
            shared,
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn schema(&self) -> &MessageSchema {
        self.shared.schema()
    }

    /// 片段尺寸；`-1` 返回 EOF 尺寸。
    pub fn size_of(&self, msg_idx: i32) -> Option<usize> {
        self.shared.schema().fragment_size(msg_idx)
    }

    // ---------------------------------------------------------------------
    // 空间检查与片段起止
    // ---------------------------------------------------------------------

    /// 环中是否还有 `size` 个槽位的空间；缓存未命中时重新读取一次已发布尾位置。
    pub fn has_room_for_write(&mut self, size: usize) -> bool {
        let shared = &self.shared;
        self.cache.has_room(size, || shared.slab_tail.get())
    }

    /// 自旋等待直到有 `size` 个槽位的空间。
    pub fn spin_block_for_room(&mut self, size: usize) -> Result<()> {
        while !self.has_room_for_write(size) {
            self.shared.spin_work()?;
        }
        Ok(())
    }

    /// 等待空间后开始一条消息，返回片段尺寸。
    pub fn block_write_message(&mut self, msg_idx: i32) -> Result<usize> {
        let size = self.message_size(msg_idx)?;
        self.spin_block_for_room(size)?;
        self.add_msg_idx(msg_idx)
    }

    /// 非阻塞版本：空间不足时返回 `Ok(None)`。
    pub fn try_write_fragment(&mut self, msg_idx: i32) -> Result<Option<usize>> {
        let size = self.message_size(msg_idx)?;
        if !self.has_room_for_write(size) {
            return Ok(None);
        }
        self.add_msg_idx(msg_idx).map(Some)
    }

    fn message_size(&self, msg_idx: i32) -> Result<usize> {
        let schema = self.shared.schema();
        if !schema.is_message_start(msg_idx) {
            return Err(PipeError::UnknownMessage {
                msg_idx,
                schema: schema.name().into(),
            });
        }
        schema
            .fragment_size(msg_idx)
            .ok_or_else(|| PipeError::UnknownMessage {
                msg_idx,
                schema: schema.name().into(),
            })
    }

    /// 写入消息编号：记录字节环写基址，工作头前移一格，返回片段尺寸。
    ///
    /// 整个片段必须落在 `tail + slab_size` 之内，否则关停管道并返回
    /// [`PipeError::InsufficientRoom`]，不会覆盖读端尚未释放的槽位。
    pub fn add_msg_idx(&mut self, msg_idx: i32) -> Result<usize> {
        let size = self.message_size(msg_idx)?;
        self.ensure_fragment_fits(size)?;
        self.write_base = self.blob_working_head;
        self.shared.slab.set(self.slab_working_head, msg_idx);
        self.slab_working_head += 1;
        self.last_msg_idx = msg_idx;
        Ok(size)
    }

    fn ensure_fragment_fits(&mut self, size: usize) -> Result<()> {
        let slab_size = self.shared.slab_size() as i64;
        let target = self.slab_working_head + size as i64 - slab_size;
        let shared = &self.shared;
        if self.cache.tail_reaches(target, || shared.slab_tail.get()) {
            return Ok(());
        }
        let available = self.cache.tail_cache() + slab_size - self.slab_working_head;
        error!(
            pipe = self.shared.id,
            required = size,
            available,
            "fragment started without reserved room"
        );
        self.shared.shutdown("fragment started without reserved room");
        Err(PipeError::InsufficientRoom {
            required: size,
            available,
        })
    }

    /// 确认写入了 `size` 个槽位，推进“确认空间”的目标位置。
    pub fn confirm_low_level_write(&mut self, size: usize) {
        self.cache.confirm(size);
    }

    /// 收尾当前片段：写入尾随字节计数，按批量策略发布，返回本片段消耗的字节数。
    pub fn publish_writes(&mut self) -> i32 {
        let consumed = self.write_trailing_count_of_bytes_consumed();
        self.write_base = self.blob_working_head;
        self.publish_writes_batched();
        consumed
    }

    fn write_trailing_count_of_bytes_consumed(&mut self) -> i32 {
        let consumed = self.blob_working_head.wrapping_sub(self.last_consumed);
        let stored = if consumed >= 0 { consumed } else { consumed & BYTES_WRAP_MASK };
        self.shared.slab.set(self.slab_working_head, stored);
        self.slab_working_head += 1;
        self.last_consumed = self.blob_working_head;
        stored
    }

    /// 按批量倒计数发布头位置；未到批次边界时只记住待发布的位置。
    pub fn publish_writes_batched(&mut self) {
        self.publish_countdown -= 1;
        if self.publish_countdown <= 0 {
            self.shared.blob_head.set(self.blob_working_head);
            self.shared.slab_head.set(self.slab_working_head);
            self.publish_countdown = self.publish_countdown_init;
            self.next_delay = self.regulator.delay(self.slab_working_head);
        } else {
            self.last_published_blob = self.blob_working_head;
            self.last_published_slab = self.slab_working_head;
        }
        self.shared
            .working
            .record_head(self.slab_working_head, self.blob_working_head);
    }

    /// 强制发布批量中暂存的位置。
    pub fn publish_all_batched_writes(&mut self) {
        if self.last_published_slab > self.shared.slab_head.get_relaxed() {
            self.shared.blob_head.set(self.last_published_blob);
            self.shared.slab_head.set(self.last_published_slab);
        }
        self.publish_countdown = self.publish_countdown_init;
    }

    /// 丢弃所有未发布的写入，工作位置回到已发布位置。
    pub fn abandon_writes(&mut self) {
        let slab = self.shared.slab_head.get_relaxed();
        let blob = self.shared.blob_head.get_relaxed();
        self.slab_working_head = slab;
        self.blob_working_head = blob;
        self.write_base = blob;
        self.last_consumed = blob;
        self.last_published_slab = slab;
        self.last_published_blob = blob;
        self.publish_countdown = self.publish_countdown_init;
        self.cache.rewind_to(slab, self.shared.slab_size());
        self.shared.working.record_head(slab, blob);
    }

    /// 记住当前工作位置，之后可以用 [`reset_head`](Self::reset_head) 放弃片段内的部分写入。
    pub fn mark_head(&mut self) {
        self.marked_head = (self.slab_working_head, self.blob_working_head);
    }

    pub fn reset_head(&mut self) {
        (self.slab_working_head, self.blob_working_head) = self.marked_head;
    }

    /// 写入 EOF 哨兵并立即发布。
    ///
    /// **前置条件**：槽环中至少有 [`EOF_SIZE`] 个空闲槽位，否则关停管道并返回
    /// [`PipeError::InsufficientRoom`]。
    pub fn publish_eof(&mut self) -> Result<()> {
        let available = self.shared.slab_tail.get() + self.shared.slab_size() as i64
            - self.slab_working_head;
        if available < EOF_SIZE as i64 {
            self.shared.shutdown("no room to publish EOF");
            return Err(PipeError::InsufficientRoom {
                required: EOF_SIZE,
                available,
            });
        }
        self.shared.blob_head.set(self.blob_working_head);
        self.shared.eof_position.set(self.slab_working_head);
        self.shared.slab.set(self.slab_working_head, -1);
        self.shared.slab.set(self.slab_working_head + 1, 0);
        self.slab_working_head += EOF_SIZE as i64;
        self.cache.confirm(EOF_SIZE);
        self.shared.slab_head.set(self.slab_working_head);
        self.last_published_slab = self.slab_working_head;
        self.last_published_blob = self.blob_working_head;
        self.publish_countdown = self.publish_countdown_init;
        self.shared
            .working
            .record_head(self.slab_working_head, self.blob_working_head);
        debug!(
            pipe = self.shared.id,
            eof_position = self.slab_working_head - EOF_SIZE as i64,
            "published end of pipe"
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // 标量字段
    // ---------------------------------------------------------------------

    #[inline]
    pub fn add_int_value(&mut self, value: i32) {
        self.shared.slab.set(self.slab_working_head, value);
        self.slab_working_head += 1;
    }

    /// 64 位值按“高位、低位”两个槽位写入。
    #[inline]
    pub fn add_long_value(&mut self, value: i64) {
        self.add_int_value((value >> 32) as i32);
        self.add_int_value(value as i32);
    }

    /// 可选整数，`None` 写入模式的 32 位缺失哨兵。
    pub fn add_optional_int(&mut self, value: Option<i32>) {
        let absent = self.shared.schema().absent32();
        self.add_int_value(value.unwrap_or(absent));
    }

    pub fn add_optional_long(&mut self, value: Option<i64>) {
        let absent = self.shared.schema().absent64();
        self.add_long_value(value.unwrap_or(absent));
    }

    /// 十进制数：指数一格，尾数两格。
    pub fn add_decimal(&mut self, exponent: i32, mantissa: i64) {
        self.add_int_value(exponent);
        self.add_long_value(mantissa);
    }

    pub fn add_optional_decimal(&mut self, value: Option<(i32, i64)>) {
        let schema = self.shared.schema();
        let (exponent, mantissa) = value.unwrap_or((schema.absent32(), schema.absent64()));
        self.add_decimal(exponent, mantissa);
    }

    /// 回填任意槽位，常用于在写完序列后补写序列长度。
    pub fn set_int_value(&mut self, value: i32, position: i64) {
        debug_assert!(
            position < self.slab_working_head && position >= self.shared.slab_tail.get(),
            "back-filled position must lie inside the unpublished window"
        );
        self.shared.slab.set(position, value);
    }

    // ---------------------------------------------------------------------
    // 变长字段
    // ---------------------------------------------------------------------

    /// 校验变长字段长度对移动平均的影响。
    ///
    /// 新平均值 `(len + avg) >> 1` 恰好等于上限时允许；超过上限时关停管道。
    pub fn validate_var_length(&mut self, length: i32) -> Result<()> {
        let average = (length.saturating_add(self.avg_var_len)) >> 1;
        let limit = self.shared.max_avg_var_len;
        if average > limit {
            let unit = self.shared.schema().max_var_field_per_unit();
            let per_field = (f64::from(length) * unit).ceil() as i64;
            let bits_dif = 32 - ((per_field - 1).clamp(0, i64::from(u32::MAX)) as u32).leading_zeros();
            let slab_bits = self.shared.config.slab_bits();
            let blob_bits = self.shared.config.blob_bits();
            error!(
                pipe = self.shared.id,
                length, average, limit, slab_bits, blob_bits, bits_dif,
                "variable length field exceeds the moving average limit"
            );
            self.shared
                .shutdown(&format!("variable length field of {length} bytes exceeds limit {limit}"));
            return Err(PipeError::VarLengthExceeded {
                length,
                average,
                limit,
                slab_bits,
                blob_bits,
                bits_dif,
            });
        }
        self.avg_var_len = average;
        Ok(())
    }

    fn add_byte_pos_and_len(&mut self, position: i32, length: i32) {
        let meta = if position >= 0 {
            position.wrapping_sub(self.write_base) & BYTES_WRAP_MASK
        } else {
            position
        };
        self.shared.slab.set(self.slab_working_head, meta);
        self.shared.slab.set(self.slab_working_head + 1, length);
        self.slab_working_head += 2;
    }

    /// 为 `[start, start + length)` 写入描述符并推进字节环工作头。
    pub(crate) fn commit_blob_field(&mut self, start: i32, length: i32) {
        self.add_byte_pos_and_len(start, length);
        self.blob_working_head = start.wrapping_add(length) & BYTES_WRAP_MASK;
    }

    pub(crate) fn blob_ring(&self) -> &BlobRing {
        &self.shared.blob
    }

    fn field_length(&self, length: usize) -> i32 {
        i32::try_from(length).unwrap_or(i32::MAX)
    }

    /// 复制字节数组。
    pub fn add_byte_array(&mut self, data: &[u8]) -> Result<()> {
        let length = self.field_length(data.len());
        self.validate_var_length(length)?;
        let start = self.blob_working_head;
        self.shared.blob.write_slice(start as u32, data);
        self.commit_blob_field(start, length);
        Ok(())
    }

    /// 写入空字节数组描述符（长度 `-1`）。
    pub fn add_null_byte_array(&mut self) {
        self.add_byte_pos_and_len(self.blob_working_head, -1);
    }

    /// 消费 `source` 中的剩余字节；`None` 或没有剩余字节时写入空描述符。
    pub fn add_byte_buffer<B>(&mut self, source: Option<&mut B>) -> Result<()>
    where
        B: Buf + ?Sized,
    {
        let Some(source) = source.filter(|source| source.has_remaining()) else {
            self.add_null_byte_array();
            return Ok(());
        };
        let length = self.field_length(source.remaining());
        self.validate_var_length(length)?;
        let start = self.blob_working_head;
        let mut position = start as u32;
        while source.has_remaining() {
            let chunk = source.chunk();
            let taken = chunk.len();
            self.shared.blob.write_slice(position, chunk);
            position = position.wrapping_add(taken as u32);
            source.advance(taken);
        }
        self.commit_blob_field(start, length);
        Ok(())
    }

    /// ASCII 文本，每个字符只保留低 8 位；`None` 写入空描述符。
    pub fn add_ascii(&mut self, text: Option<&str>) -> Result<()> {
        let Some(text) = text else {
            self.add_null_byte_array();
            return Ok(());
        };
        let length = self.field_length(text.chars().count());
        self.validate_var_length(length)?;
        let start = self.blob_working_head;
        let mut sink = &self.shared.blob;
        pack_ascii(text, &mut sink, start as u32);
        self.commit_blob_field(start, length);
        Ok(())
    }

    /// UTF-8 文本；`None` 写入空描述符。
    pub fn add_utf8(&mut self, text: Option<&str>) -> Result<()> {
        let Some(text) = text else {
            self.add_null_byte_array();
            return Ok(());
        };
        let length = self.field_length(text.len());
        self.validate_var_length(length)?;
        let start = self.blob_working_head;
        let mut sink = &self.shared.blob;
        let mut position = start as u32;
        for ch in text.chars() {
            position = encode_single_char(ch as u32, &mut sink, position)?;
        }
        self.commit_blob_field(start, length);
        Ok(())
    }

    /// 以十进制文本写入 `i32`。
    pub fn add_int_as_ascii(&mut self, value: i32) -> Result<()> {
        self.validate_var_length(INT_ASCII_SPAN)?;
        let start = self.blob_working_head;
        let head = start as u32;
        let mut target = &self.shared.blob;
        let length = left_convert_int_to_ascii(&mut target, value, head.wrapping_add(INT_ASCII_SPAN as u32), head);
        self.commit_blob_field(start, length as i32);
        Ok(())
    }

    /// 以十进制文本写入 `i64`。
    pub fn add_long_as_ascii(&mut self, value: i64) -> Result<()> {
        self.validate_var_length(LONG_ASCII_SPAN)?;
        let start = self.blob_working_head;
        let head = start as u32;
        let mut target = &self.shared.blob;
        let length = left_convert_long_to_ascii(&mut target, value, head.wrapping_add(LONG_ASCII_SPAN as u32), head);
        self.commit_blob_field(start, length as i32);
        Ok(())
    }

    /// 以定点文本写入 `mantissa × 10^-places`，小数部分按 `places` 位补零。
    ///
    /// 例如 `(2, -5)` 写出 `-0.05`，`(0, 42)` 写出 `42`。
    pub fn add_decimal_as_ascii(&mut self, places: u32, mantissa: i64) -> Result<()> {
        if places > MAX_DECIMAL_PLACES {
            return Err(PipeError::invalid_config(format!(
                "decimal places {places} exceed the maximum of {MAX_DECIMAL_PLACES}"
            )));
        }
        let divisor = 10i64.pow(places);
        let ones = mantissa / divisor;
        let fraction = (mantissa % divisor).unsigned_abs() as i64;
        let bare_sign = mantissa < 0 && ones == 0;
        let ones_len = decimal_digits(ones.unsigned_abs()) + usize::from(ones < 0);
        let total = usize::from(bare_sign)
            + ones_len
            + if places > 0 { 1 + places as usize } else { 0 };
        self.validate_var_length(total as i32)?;

        let start = self.blob_working_head;
        let mut position = start as u32;
        let mut target = &self.shared.blob;
        if bare_sign {
            target.put_byte(position, b'-');
            position = position.wrapping_add(1);
        }
        let written = left_convert_long_to_ascii(
            &mut target,
            ones,
            position.wrapping_add(LONG_ASCII_SPAN as u32),
            position,
        );
        position = position.wrapping_add(written as u32);
        if places > 0 {
            target.put_byte(position, b'.');
            position = position.wrapping_add(1);
            let written = left_convert_long_with_leading_zeros_to_ascii(
                &mut target,
                places,
                fraction,
                position.wrapping_add(LONG_ASCII_SPAN as u32),
                position,
            );
            position = position.wrapping_add(written as u32);
        }
        let length = position.wrapping_sub(start as u32) as i32;
        self.commit_blob_field(start, length);
        Ok(())
    }

    /// 写入指向常量区的描述符，不占用字节环。
    pub fn add_constant_reference(&mut self, offset: i32, length: i32) -> Result<()> {
        let available = self.shared.constants().len();
        let end = i64::from(offset) + i64::from(length.max(0));
        if offset < 0 || end > available as i64 {
            return Err(PipeError::invalid_config(format!(
                "constant reference [{offset}, {end}) is outside the {available} byte constants buffer"
            )));
        }
        self.add_byte_pos_and_len(offset | i32::MIN, length);
        Ok(())
    }

    /// 从输入流读取恰好 `length` 个字节作为一个变长字段。
    pub fn read_field_from<R>(&mut self, source: &mut R, length: usize) -> Result<()>
    where
        R: Read + ?Sized,
    {
        let field_length = self.field_length(length);
        self.validate_var_length(field_length)?;
        let start = self.blob_working_head;
        let mut position = start as u32;
        let mut remaining = length;
        let mut chunk = [0u8; 512];
        while remaining > 0 {
            let want = remaining.min(chunk.len());
            let read = match source.read(&mut chunk[..want]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            self.shared.blob.write_slice(position, &chunk[..read]);
            position = position.wrapping_add(read as u32);
            remaining -= read;
        }
        self.commit_blob_field(start, field_length);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // 流式字节环写入
    // ---------------------------------------------------------------------

    /// 打开字节环写入；同一时刻只允许一个。
    pub fn open_blob_field_write(&mut self) -> Result<()> {
        if self.blob_write_open {
            self.shared.shutdown("blob field write opened twice");
            return Err(PipeError::BlobWriteAlreadyOpen);
        }
        self.blob_write_open = true;
        Ok(())
    }

    pub fn close_blob_field_write(&mut self) -> Result<()> {
        if !self.blob_write_open {
            self.shared.shutdown("blob field write closed without being opened");
            return Err(PipeError::BlobWriteNotOpen);
        }
        self.blob_write_open = false;
        Ok(())
    }

    pub fn is_in_blob_field_write(&self) -> bool {
        self.blob_write_open
    }

    /// 在当前字节环工作头处打开一个流式写入器，关闭时落成一个变长字段。
    pub fn blob_writer(&mut self) -> Result<BlobWriter<'_>> {
        self.open_blob_field_write()?;
        let start = self.blob_working_head;
        Ok(BlobWriter::new(self, start))
    }

    // ---------------------------------------------------------------------
    // 批量与限速
    // ---------------------------------------------------------------------

    pub fn set_publish_batch_size(&mut self, size: u32) -> Result<()> {
        let max = self.shared.config.max_batch_size(EXPLICIT_BATCH_MUST_FIT);
        if size > max {
            return Err(PipeError::BatchSizeTooLarge {
                requested: size,
                max,
            });
        }
        self.apply_publish_batch_size(size);
        Ok(())
    }

    /// 使用环容量允许的最大批量（要求至少容纳 3 个批次）。
    pub fn set_max_publish_batch_size(&mut self) {
        let size = self.shared.config.max_batch_size(MAX_BATCH_MUST_FIT);
        self.apply_publish_batch_size(size);
    }

    fn apply_publish_batch_size(&mut self, size: u32) {
        let size = i32::try_from(size).unwrap_or(i32::MAX);
        self.publish_countdown_init = size;
        self.publish_countdown = size;
        debug!(pipe = self.shared.id, size, "publish batch size changed");
    }

    pub fn publish_batch_size(&self) -> u32 {
        self.publish_countdown_init.max(0) as u32
    }

    /// 挂载生产侧调节器；只允许一次。
    pub fn set_rate_regulator(&mut self, regulator: Box<dyn RateRegulator>) -> Result<()> {
        if !self.regulator.install(regulator) {
            return Err(PipeError::invalid_config("producer regulator must only be set once"));
        }
        Ok(())
    }

    pub fn is_rate_limited(&self) -> bool {
        self.regulator.is_installed()
    }

    /// 最近一次批次发布时调节器给出的等待时长。
    pub fn rate_limit_delay(&self) -> Duration {
        self.next_delay
    }

    // ---------------------------------------------------------------------
    // 观察
    // ---------------------------------------------------------------------

    pub fn working_head_position(&self) -> i64 {
        self.slab_working_head
    }

    pub fn blob_working_head_position(&self) -> i32 {
        self.blob_working_head
    }

    pub fn head_position(&self) -> i64 {
        self.shared.slab_head.get_relaxed()
    }

    pub fn blob_write_base(&self) -> i32 {
        self.write_base
    }

    pub fn content_remaining(&self) -> i64 {
        self.shared.content_remaining()
    }

    /// 字节环中尚未被读端释放的字节数（以写端工作头计算）。
    pub fn bytes_of_content(&self) -> i32 {
        self.shared.bytes_of_content(self.blob_working_head)
    }

    pub fn max_avg_var_len(&self) -> i32 {
        self.shared.max_avg_var_len
    }

    pub fn var_len_moving_average(&self) -> i32 {
        self.avg_var_len
    }

    pub fn last_msg_idx(&self) -> i32 {
        self.last_msg_idx
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    pub fn shutdown(&self, cause: &str) -> bool {
        self.shared.shutdown(cause)
    }
}

fn decimal_digits(value: u64) -> usize {
    value.checked_ilog10().map_or(1, |digits| digits as usize + 1)
}

impl fmt::Display for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shared.describe(f)
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter")
            .field("pipe", &self.shared.id)
            .field("working_head", &self.slab_working_head)
            .field("blob_working_head", &self.blob_working_head)
            .field("regulator", &self.regulator)
            .finish()
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use super::*;
    use crate::config::PipeConfig;
    use crate::pipe::PipeRegistry;
    use crate::reader::PipeReader;
    use crate::schema::FieldKind;
    use alloc::string::String;

    const TEXT: i32 = 0;
    const PAIR: i32 = 1;

    fn split(slab_bits: u8, blob_bits: u8) -> (PipeWriter, PipeReader) {
        let schema = MessageSchema::builder("Writer")
            .message("Text", [FieldKind::Utf8])
            .message("Pair", [FieldKind::Int, FieldKind::Long])
            .build()
            .expect("模式");
        let config = PipeConfig::new(alloc::sync::Arc::new(schema), slab_bits, blob_bits).expect("配置");
        let mut pipe = PipeRegistry::new().create(config).expect("创建");
        pipe.init_buffers().expect("分配");
        pipe.split().expect("拆分")
    }

    fn write_text(writer: &mut PipeWriter, text: &str) -> Result<()> {
        let size = writer.block_write_message(TEXT)?;
        writer.add_utf8(Some(text))?;
        writer.confirm_low_level_write(size);
        writer.publish_writes();
        Ok(())
    }

    fn read_text(reader: &mut PipeReader) -> String {
        assert!(reader.has_content_to_read());
        assert_eq!(reader.take_msg_idx(), TEXT);
        let meta = reader.take_ring_byte_meta_data();
        let len = reader.take_ring_byte_len();
        let mut out = String::new();
        reader.read_utf8(meta, len, &mut out);
        reader.confirm_low_level_read(reader.size_of(TEXT).expect("尺寸"));
        reader.release_read_lock();
        out
    }

    #[test]
    fn trailing_count_reflects_blob_bytes() {
        let (mut writer, _reader) = split(5, 8);
        let size = writer.block_write_message(TEXT).expect("开始消息");
        writer.add_utf8(Some("héllo")).expect("写入");
        writer.confirm_low_level_write(size);
        assert_eq!(writer.publish_writes(), 6, "é 占 2 字节");
        assert_eq!(writer.content_remaining(), size as i64);
        assert_eq!(writer.blob_write_base(), 6, "片段收尾后写基址移动到下一片段起点");
    }

    #[test]
    fn unknown_message_is_rejected() {
        let (mut writer, _reader) = split(5, 8);
        let error = writer.add_msg_idx(7).expect_err("未知编号");
        assert_eq!(error.code(), "pipe.unknown_message");
        assert!(!writer.is_shutdown(), "未知编号不会关停管道");
    }

    #[test]
    fn abandon_rolls_back_to_published() {
        let (mut writer, mut reader) = split(5, 8);
        write_text(&mut writer, "kept").expect("第一条");
        let size = writer.block_write_message(TEXT).expect("第二条");
        writer.add_utf8(Some("dropped")).expect("写入");
        writer.confirm_low_level_write(size);
        writer.abandon_writes();
        assert_eq!(writer.working_head_position(), writer.head_position());
        write_text(&mut writer, "next").expect("第三条");
        assert_eq!(read_text(&mut reader), "kept");
        assert_eq!(read_text(&mut reader), "next");
    }

    #[test]
    fn mark_and_reset_head_discard_partial_fields() {
        let (mut writer, mut reader) = split(5, 8);
        let size = writer.block_write_message(PAIR).expect("开始消息");
        writer.mark_head();
        writer.add_int_value(1);
        writer.reset_head();
        writer.add_int_value(2);
        writer.add_long_value(-3);
        writer.confirm_low_level_write(size);
        writer.publish_writes();
        assert_eq!(reader.take_msg_idx(), PAIR);
        assert_eq!(reader.take_int(), 2);
        assert_eq!(reader.take_long(), -3);
    }

    #[test]
    fn message_start_refuses_to_overwrite_unreleased_slots() {
        let (mut writer, mut reader) = split(3, 8);
        write_text(&mut writer, "a").expect("第一条");
        write_text(&mut writer, "b").expect("第二条");
        assert_eq!(writer.content_remaining(), 8, "8 槽的环已被两条未读消息占满");

        let error = writer.add_msg_idx(TEXT).expect_err("没有预留空间");
        assert!(matches!(error, PipeError::InsufficientRoom { required: 4, available: 0 }));
        assert!(writer.is_shutdown(), "越界写入会关停管道");
        assert_eq!(writer.working_head_position(), 8, "失败时不写入编号");
        assert_eq!(read_text(&mut reader), "a", "未读片段保持原样");
    }

    #[test]
    fn message_start_reloads_released_tail() {
        let (mut writer, mut reader) = split(3, 8);
        write_text(&mut writer, "a").expect("第一条");
        write_text(&mut writer, "b").expect("第二条");
        assert_eq!(read_text(&mut reader), "a");
        let size = writer.add_msg_idx(TEXT).expect("读端释放后重新观察尾位置");
        assert_eq!(size, 4);
        assert!(!writer.is_shutdown());
    }

    #[test]
    fn eof_requires_two_free_slots() {
        let (mut writer, _reader) = split(2, 4);
        // 4 槽的环：PAIR 片段占 5 槽放不下，直接填满整数。
        for value in 0..4 {
            writer.add_int_value(value);
        }
        let error = writer.publish_eof().expect_err("空间不足");
        assert!(matches!(error, PipeError::InsufficientRoom { required: 2, available: 0 }));
        assert!(writer.is_shutdown());
    }

    #[test]
    fn blob_write_guard_rejects_double_open() {
        let (mut writer, _reader) = split(5, 8);
        writer.open_blob_field_write().expect("首次打开");
        assert_eq!(writer.open_blob_field_write(), Err(PipeError::BlobWriteAlreadyOpen));
        assert!(writer.is_shutdown(), "重复打开会关停管道");
    }

    #[test]
    fn decimal_ascii_keeps_sign_and_leading_zeros() {
        let (mut writer, mut reader) = split(5, 8);
        for (places, mantissa, expected) in [(2, 12345, "123.45"), (2, -5, "-0.05"), (0, 42, "42"), (3, -1200, "-1.200")] {
            let size = writer.block_write_message(TEXT).expect("开始消息");
            writer.add_decimal_as_ascii(places, mantissa).expect("写入");
            writer.confirm_low_level_write(size);
            writer.publish_writes();
            assert_eq!(reader.take_msg_idx(), TEXT);
            let meta = reader.take_ring_byte_meta_data();
            let len = reader.take_ring_byte_len();
            let mut out = String::new();
            reader.read_ascii(meta, len, &mut out);
            assert_eq!(out, expected);
            reader.confirm_low_level_read(size);
            reader.release_read_lock();
        }
    }

    #[test]
    fn stream_fields_read_exact_lengths() {
        let (mut writer, _reader) = split(5, 8);
        let mut source: &[u8] = b"abc";
        writer.block_write_message(TEXT).expect("开始消息");
        let error = writer.read_field_from(&mut source, 5).expect_err("流提前结束");
        assert_eq!(error.code(), "pipe.io");
    }

    #[test]
    #[tracing_test::traced_test]
    fn oversize_field_logs_and_shuts_down() {
        let (mut writer, _reader) = split(5, 8);
        writer.block_write_message(TEXT).expect("开始消息");
        let error = writer.add_byte_array(&[b'x'; 80]).expect_err("超过移动平均上限");
        assert_eq!(error.code(), "pipe.var_length_exceeded");
        assert!(writer.is_shutdown());
        assert!(logs_contain("variable length field exceeds the moving average limit"));
        assert!(logs_contain("pipe shut down"));
    }
}
