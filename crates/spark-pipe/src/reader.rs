//! 读端句柄：片段读取、字段解码、批量释放、延迟释放与重放。
//!
//! # 协议（How）
//! 1. [`PipeReader::has_content_to_read`] 确认有已发布内容；
//! 2. [`PipeReader::take_msg_idx`] 取出消息编号，依片段布局逐个读取字段；
//! 3. [`PipeReader::confirm_low_level_read`] 确认片段尺寸；
//! 4. [`PipeReader::release_read_lock`] 读取尾随字节计数、推进字节环读基址并按批量策略释放。
//!
//! # 契约说明（What）
//! - 变长字段描述符 `meta >= 0` 表示相对读基址的字节环偏移，`meta < 0` 表示常量区偏移；
//! - 长度 `-1` 表示空值，可选读取返回 `None`；
//! - 所有读取都不改变共享状态，只有释放动作发布尾位置。

use alloc::{collections::VecDeque, string::String, vec::Vec};
use core::{fmt, time::Duration};
use std::io::Write;

use bytes::BufMut;
use tracing::debug;

use crate::blob_reader::BlobReader;
use crate::cache::ReadPositionCache;
use crate::codec::decode_utf8_into;
use crate::config::{EXPLICIT_BATCH_MUST_FIT, MAX_BATCH_MUST_FIT};
use crate::error::{PipeError, Result};
use crate::pipe::PipeShared;
use crate::regulator::{RateRegulator, RegulatorSlot};
use crate::ring::RELATIVE_POS_MASK;
use crate::schema::MessageSchema;
use crate::sync::Arc;

/// 一次延迟释放记录：读完片段时的槽环尾、字节环尾与片段字节数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRelease {
    slab_tail: i64,
    blob_tail: i32,
    length: i32,
}

/// 重放前保存的读端工作状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReplayHolding {
    slab_working_tail: i64,
    blob_working_tail: i32,
    read_base: i32,
    confirmed: i64,
}

/// 管道的唯一读端。
///
/// # 教案式说明
/// - **意图 (Why)**：读端独占工作尾、读基址、批量倒计数与延迟释放队列，
///   热路径上只在缓存未命中时读取写端发布的头位置；
/// - **契约 (What)**：释放的位置永远不会超过已确认读取的位置；重放只回到已发布的尾位置，
///   因此写端不可能覆盖正在重放的数据；
/// - **风险 (Trade-offs)**：批量释放会推迟写端可见的空闲空间，流结束时需要调用
///   [`release_all_batched_reads`](Self::release_all_batched_reads)。
pub struct PipeReader {
    shared: Arc<PipeShared>,
    slab_working_tail: i64,
    blob_working_tail: i32,
    read_base: i32,
    cache: ReadPositionCache,
    release_countdown: i32,
    release_countdown_init: i32,
    last_released_slab: i64,
    last_released_blob: i32,
    pending: VecDeque<PendingRelease>,
    holding: ReplayHolding,
    last_msg_idx: i32,
    regulator: RegulatorSlot,
    next_delay: Duration,
}

impl PipeReader {
    pub(crate) fn new(shared: Arc<PipeShared>) -> Self {
        let slab_pos = shared.slab_tail.get();
        let blob_pos = shared.blob_tail.get();
        let batch = shared.config.release_batch_size() as i32;
        Self {
            cache: ReadPositionCache::new(slab_pos),
            slab_working_tail: slab_pos,
            blob_working_tail: blob_pos,
            read_base: blob_pos,
            release_countdown: batch,
            release_countdown_init: batch,
            last_released_slab: slab_pos,
            last_released_blob: blob_pos,
            pending: VecDeque::new(),
            holding: ReplayHolding {
                slab_working_tail: slab_pos,
                blob_working_tail: blob_pos,
                read_base: blob_pos,
                confirmed: slab_pos,
            },
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

    pub fn size_of(&self, msg_idx: i32) -> Option<usize> {
        self.shared.schema().fragment_size(msg_idx)
    }

    // ---------------------------------------------------------------------
    // 内容检查
    // ---------------------------------------------------------------------

    /// 是否至少有一个已发布的槽位尚未确认读取。
    pub fn has_content_to_read(&mut self) -> bool {
        let shared = &self.shared;
        self.cache.has_content(|| shared.slab_head.get())
    }

    /// 是否有完整的 `size` 槽位片段可读。
    pub fn has_content_to_read_sized(&mut self, size: usize) -> bool {
        let shared = &self.shared;
        self.cache.has_content_sized(size, || shared.slab_head.get())
    }

    /// 自旋等待直到有内容可读。
    pub fn spin_block_for_content(&mut self) -> Result<()> {
        while !self.has_content_to_read() {
            self.shared.spin_work()?;
        }
        Ok(())
    }

    pub fn confirm_low_level_read(&mut self, size: usize) {
        self.cache.confirm(size);
    }

    // ---------------------------------------------------------------------
    // 槽环字段
    // ---------------------------------------------------------------------

    /// 取出消息编号；EOF 哨兵返回 `-1`。
    pub fn take_msg_idx(&mut self) -> i32 {
        let msg_idx = self.take_int();
        self.last_msg_idx = msg_idx;
        msg_idx
    }

    #[inline]
    pub fn take_int(&mut self) -> i32 {
        let value = self.shared.slab.get(self.slab_working_tail);
        self.slab_working_tail += 1;
        value
    }

    /// 64 位值按“高位、低位”两个槽位读取。
    #[inline]
    pub fn take_long(&mut self) -> i64 {
        let high = i64::from(self.take_int());
        let low = i64::from(self.take_int() as u32);
        (high << 32) | low
    }

    pub fn take_optional_int(&mut self) -> Option<i32> {
        let value = self.take_int();
        (value != self.shared.schema().absent32()).then_some(value)
    }

    pub fn take_optional_long(&mut self) -> Option<i64> {
        let value = self.take_long();
        (value != self.shared.schema().absent64()).then_some(value)
    }

    /// 十进制数 `(exponent, mantissa)`。
    pub fn take_decimal(&mut self) -> (i32, i64) {
        let exponent = self.take_int();
        (exponent, self.take_long())
    }

    /// 指数为缺失哨兵时视为空值。
    pub fn take_optional_decimal(&mut self) -> Option<(i32, i64)> {
        let (exponent, mantissa) = self.take_decimal();
        (exponent != self.shared.schema().absent32()).then_some((exponent, mantissa))
    }

    pub fn take_ring_byte_meta_data(&mut self) -> i32 {
        self.take_int()
    }

    pub fn take_ring_byte_len(&mut self) -> i32 {
        self.take_int()
    }

    /// 不移动工作尾，读取其后第 `offset` 个槽位。
    pub fn peek_int(&self, offset: i64) -> i32 {
        self.shared.slab.get(self.slab_working_tail + offset)
    }

    pub fn peek_long(&self, offset: i64) -> i64 {
        let high = i64::from(self.peek_int(offset));
        let low = i64::from(self.peek_int(offset + 1) as u32);
        (high << 32) | low
    }

    // ---------------------------------------------------------------------
    // 变长字段
    // ---------------------------------------------------------------------

    /// 把描述符还原为字节环绝对位置（未掩码）。
    #[inline]
    pub fn restore_position(&self, meta: i32) -> i32 {
        (meta & RELATIVE_POS_MASK).wrapping_add(self.read_base)
    }

    /// 还原描述符位置，并把字节环工作尾推进到字段末尾。
    pub fn byte_position(&mut self, meta: i32, length: i32) -> i32 {
        let position = self.restore_position(meta);
        if length >= 0 {
            self.blob_working_tail = self.shared.blob_mask() & length.wrapping_add(self.blob_working_tail);
        }
        position
    }

    fn constant_slice(&self, meta: i32, length: i32) -> &[u8] {
        let offset = (meta & RELATIVE_POS_MASK) as usize;
        let constants = self.shared.constants();
        let end = (offset + length.max(0) as usize).min(constants.len());
        constants.get(offset..end).unwrap_or(&[])
    }

    /// 逐字节读取 ASCII 文本（每字节映射为一个 `char`）并追加到 `target`，返回字节数。
    pub fn read_ascii(&mut self, meta: i32, length: i32, target: &mut String) -> usize {
        if length <= 0 {
            return 0;
        }
        if meta < 0 {
            target.extend(self.constant_slice(meta, length).iter().map(|&b| char::from(b)));
        } else {
            let position = self.byte_position(meta, length) as u32;
            let blob = &self.shared.blob;
            target.extend((0..length as u32).map(|i| char::from(blob.get(position.wrapping_add(i)))));
        }
        length as usize
    }

    pub fn read_optional_ascii(&mut self, meta: i32, length: i32) -> Option<String> {
        if length < 0 {
            return None;
        }
        let mut text = String::with_capacity(length as usize);
        self.read_ascii(meta, length, &mut text);
        Some(text)
    }

    /// 解码 UTF-8 文本并追加到 `target`，损坏的序列替换为 U+FFFD。
    pub fn read_utf8(&mut self, meta: i32, length: i32, target: &mut String) -> usize {
        if length <= 0 {
            return 0;
        }
        if meta < 0 {
            decode_utf8_into(self.constant_slice(meta, length), 0, length as usize, target);
        } else {
            let position = self.byte_position(meta, length) as u32;
            decode_utf8_into(&self.shared.blob, position, length as usize, target);
        }
        length as usize
    }

    pub fn read_optional_utf8(&mut self, meta: i32, length: i32) -> Option<String> {
        if length < 0 {
            return None;
        }
        let mut text = String::with_capacity(length as usize);
        self.read_utf8(meta, length, &mut text);
        Some(text)
    }

    /// 把字段字节追加到 `target`，返回字节数。
    pub fn read_bytes<B>(&mut self, meta: i32, length: i32, target: &mut B) -> usize
    where
        B: BufMut + ?Sized,
    {
        if length <= 0 {
            return 0;
        }
        if meta < 0 {
            target.put_slice(self.constant_slice(meta, length));
        } else {
            let position = self.byte_position(meta, length) as u32;
            let mut chunk = [0u8; 256];
            let mut copied = 0u32;
            while copied < length as u32 {
                let run = (length as u32 - copied).min(chunk.len() as u32) as usize;
                self.shared.blob.read_slice(position.wrapping_add(copied), &mut chunk[..run]);
                target.put_slice(&chunk[..run]);
                copied += run as u32;
            }
        }
        length as usize
    }

    pub fn read_optional_bytes(&mut self, meta: i32, length: i32) -> Option<Vec<u8>> {
        if length < 0 {
            return None;
        }
        let mut bytes = Vec::with_capacity(length as usize);
        self.read_bytes(meta, length, &mut bytes);
        Some(bytes)
    }

    /// 字段内容是否与 `expected` 的 ASCII 表示相同；不推进工作尾。
    pub fn is_equal(&self, meta: i32, length: i32, expected: &str) -> bool {
        if length < 0 || expected.chars().count() != length as usize {
            return false;
        }
        let mut chars = expected.chars().map(|ch| ch as u32 as u8);
        if meta < 0 {
            self.constant_slice(meta, length).iter().all(|&b| chars.next() == Some(b))
        } else {
            let position = self.restore_position(meta) as u32;
            (0..length as u32).all(|i| chars.next() == Some(self.shared.blob.get(position.wrapping_add(i))))
        }
    }

    /// 字段内容是否与 `expected` 逐字节相同；不推进工作尾。
    pub fn is_equal_bytes(&self, meta: i32, length: i32, expected: &[u8]) -> bool {
        if length < 0 || expected.len() != length as usize {
            return false;
        }
        if meta < 0 {
            return self.constant_slice(meta, length) == expected;
        }
        let position = self.restore_position(meta) as u32;
        expected
            .iter()
            .enumerate()
            .all(|(i, &b)| self.shared.blob.get(position.wrapping_add(i as u32)) == b)
    }

    /// 取出下一个变长字段并写入 `sink`，返回字段长度（空值为 `-1`）。
    pub fn write_field_to<W>(&mut self, sink: &mut W) -> Result<i32>
    where
        W: Write + ?Sized,
    {
        let meta = self.take_ring_byte_meta_data();
        let length = self.take_ring_byte_len();
        if length <= 0 {
            return Ok(length);
        }
        if meta < 0 {
            sink.write_all(self.constant_slice(meta, length))?;
            return Ok(length);
        }
        let position = self.byte_position(meta, length) as u32;
        let (start, first, second) = self.shared.blob.segments(position, length as usize);
        let mut chunk = [0u8; 512];
        for (segment_start, segment_len) in [(start, first), (0, second)] {
            let mut copied = 0usize;
            while copied < segment_len {
                let run = (segment_len - copied).min(chunk.len());
                self.shared
                    .blob
                    .read_slice((segment_start + copied) as u32, &mut chunk[..run]);
                sink.write_all(&chunk[..run])?;
                copied += run;
            }
        }
        Ok(length)
    }

    /// 创建绑定到本管道的流式字段读取器，随后用
    /// [`BlobReader::open_low_level_field`] 打开字段。
    pub fn blob_reader(&self) -> BlobReader {
        BlobReader::new(Arc::clone(&self.shared))
    }

    // ---------------------------------------------------------------------
    // 释放
    // ---------------------------------------------------------------------

    fn take_trailing_count(&mut self) -> i32 {
        let consumed = self.take_int();
        self.read_base = self.shared.blob_mask() & self.read_base.wrapping_add(consumed);
        self.blob_working_tail = self.read_base;
        consumed
    }

    /// 读取尾随字节计数，推进读基址并按批量策略释放，返回本片段的字节数。
    pub fn release_read_lock(&mut self) -> i32 {
        let consumed = self.take_trailing_count();
        self.release_batched_reads(self.blob_working_tail, self.slab_working_tail);
        consumed
    }

    fn release_batched_reads(&mut self, blob_tail: i32, slab_tail: i64) {
        self.release_countdown -= 1;
        if self.release_countdown <= 0 {
            self.shared.blob_tail.set(blob_tail);
            self.shared.slab_tail.set(slab_tail);
            self.release_countdown = self.release_countdown_init;
            self.next_delay = self.regulator.delay(slab_tail);
        } else {
            self.last_released_blob = blob_tail;
            self.last_released_slab = slab_tail;
        }
        self.shared
            .working
            .record_tail(self.slab_working_tail, self.blob_working_tail);
    }

    /// 强制发布批量中暂存的释放位置。
    pub fn release_all_batched_reads(&mut self) {
        if self.last_released_slab > self.shared.slab_tail.get_relaxed() {
            self.shared.blob_tail.set(self.last_released_blob);
            self.shared.slab_tail.set(self.last_released_slab);
        }
        self.release_countdown = self.release_countdown_init;
    }

    /// 直接把工作尾发布为已释放位置，用于消费者在片段边界主动让出空间。
    pub fn release_batched_reads_up_to_this_position(&mut self) {
        self.shared.blob_tail.set(self.blob_working_tail);
        self.shared.slab_tail.set(self.slab_working_tail);
        self.last_released_blob = self.blob_working_tail;
        self.last_released_slab = self.slab_working_tail;
        self.release_countdown = self.release_countdown_init;
    }

    /// 关闭自动释放，所有释放都积攒到显式的
    /// [`release_all_batched_reads`](Self::release_all_batched_reads)。
    pub fn batch_all_releases(&mut self) {
        self.release_countdown_init = i32::MAX;
        self.release_countdown = i32::MAX;
    }

    // ---------------------------------------------------------------------
    // 延迟释放
    // ---------------------------------------------------------------------

    /// 读完片段但暂不释放，把释放位置排入队列，返回本片段的字节数。
    pub fn read_next_without_releasing_read_lock(&mut self) -> i32 {
        let consumed = self.take_trailing_count();
        self.pending.push_back(PendingRelease {
            slab_tail: self.slab_working_tail,
            blob_tail: self.blob_working_tail,
            length: consumed,
        });
        self.shared
            .working
            .record_tail(self.slab_working_tail, self.blob_working_tail);
        consumed
    }

    pub fn pending_release_count(&self) -> usize {
        self.pending.len()
    }

    /// 释放队首的一个延迟片段。
    pub fn release_pending_read_lock(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(entry) => {
                self.release_batched_reads(entry.blob_tail, entry.slab_tail);
                true
            }
            None => false,
        }
    }

    pub fn release_all_pending_read_lock(&mut self) {
        while self.release_pending_read_lock() {}
    }

    /// 按字节数释放延迟片段。
    ///
    /// 完整覆盖的片段逐个释放；最后一个只被部分消费的片段不释放槽环，
    /// 只把字节环尾推进到已消费的位置，并扣减它剩余的长度。
    /// 批量中暂存的字节环尾同步前移，之后的批量刷新不会把已发布的尾位置拉回。
    pub fn release_pending_as_read_lock(&mut self, consumed: i32) {
        let mut remaining = consumed;
        while remaining > 0 {
            let Some(front) = self.pending.front_mut() else {
                break;
            };
            if remaining >= front.length {
                remaining -= front.length;
                self.release_pending_read_lock();
            } else {
                let unread = front.length - remaining;
                let blob_tail = self.shared.blob_mask() & front.blob_tail.wrapping_sub(unread);
                front.length = unread;
                self.last_released_blob = blob_tail;
                self.shared.blob_tail.set(blob_tail);
                break;
            }
        }
    }

    // ---------------------------------------------------------------------
    // 重放
    // ---------------------------------------------------------------------

    /// 把读端回拨到已发布的尾位置，重新读取所有未释放的片段。
    ///
    /// 首次进入重放时保存当前工作状态；重放中再次调用只重新回拨，不覆盖快照。
    pub fn replay_unreleased(&mut self) {
        if !self.is_replaying() {
            self.holding = ReplayHolding {
                slab_working_tail: self.slab_working_tail,
                blob_working_tail: self.blob_working_tail,
                read_base: self.read_base,
                confirmed: self.cache.confirmed(),
            };
        }
        self.slab_working_tail = self.shared.slab_tail.get();
        self.blob_working_tail = self.shared.blob_tail.get();
        self.read_base = self.shared.blob_mask() & self.blob_working_tail;
        self.cache.rewind_to(self.slab_working_tail);
        self.shared
            .working
            .record_tail(self.slab_working_tail, self.blob_working_tail);
        debug!(
            pipe = self.shared.id,
            from = self.slab_working_tail,
            to = self.holding.slab_working_tail,
            "replaying unreleased fragments"
        );
    }

    pub fn is_replaying(&self) -> bool {
        self.slab_working_tail < self.holding.slab_working_tail
    }

    /// 结束重放，恢复进入重放前的工作状态。
    pub fn cancel_replay(&mut self) {
        self.slab_working_tail = self.holding.slab_working_tail;
        self.blob_working_tail = self.holding.blob_working_tail;
        self.read_base = self.holding.read_base;
        self.cache.rewind_to(self.holding.confirmed);
        self.shared
            .working
            .record_tail(self.slab_working_tail, self.blob_working_tail);
    }

    // ---------------------------------------------------------------------
    // 批量与限速
    // ---------------------------------------------------------------------

    pub fn set_release_batch_size(&mut self, size: u32) -> Result<()> {
        let max = self.shared.config.max_batch_size(EXPLICIT_BATCH_MUST_FIT);
        if size > max {
            return Err(PipeError::BatchSizeTooLarge {
                requested: size,
                max,
            });
        }
        self.apply_release_batch_size(size);
        Ok(())
    }

    pub fn set_max_release_batch_size(&mut self) {
        let size = self.shared.config.max_batch_size(MAX_BATCH_MUST_FIT);
        self.apply_release_batch_size(size);
    }

    fn apply_release_batch_size(&mut self, size: u32) {
        let size = i32::try_from(size).unwrap_or(i32::MAX);
        self.release_countdown_init = size;
        self.release_countdown = size;
        debug!(pipe = self.shared.id, size, "release batch size changed");
    }

    pub fn release_batch_size(&self) -> u32 {
        self.release_countdown_init.max(0) as u32
    }

    /// 挂载消费侧调节器；只允许一次。
    pub fn set_rate_regulator(&mut self, regulator: alloc::boxed::Box<dyn RateRegulator>) -> Result<()> {
        if !self.regulator.install(regulator) {
            return Err(PipeError::invalid_config("consumer regulator must only be set once"));
        }
        Ok(())
    }

    pub fn is_rate_limited(&self) -> bool {
        self.regulator.is_installed()
    }

    pub fn rate_limit_delay(&self) -> Duration {
        self.next_delay
    }

    // ---------------------------------------------------------------------
    // 观察
    // ---------------------------------------------------------------------

    pub fn working_tail_position(&self) -> i64 {
        self.slab_working_tail
    }

    pub fn blob_working_tail_position(&self) -> i32 {
        self.blob_working_tail
    }

    pub fn tail_position(&self) -> i64 {
        self.shared.slab_tail.get_relaxed()
    }

    pub fn bytes_read_base(&self) -> i32 {
        self.read_base
    }

    pub fn content_remaining(&self) -> i64 {
        self.shared.content_remaining()
    }

    pub fn is_end_of_pipe(&self, tail_position: i64) -> bool {
        self.shared.is_end_of_pipe(tail_position)
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

impl fmt::Display for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shared.describe(f)
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader")
            .field("pipe", &self.shared.id)
            .field("working_tail", &self.slab_working_tail)
            .field("blob_working_tail", &self.blob_working_tail)
            .field("read_base", &self.read_base)
            .field("pending", &self.pending.len())
            .field("regulator", &self.regulator)
            .finish()
    }
}
