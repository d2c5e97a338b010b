//! 变长字段的流式小端读取视图。
//!
//! # 设计初衷（Why）
//! - 变长字段里常常嵌着结构化的二进制内容（长度前缀、定长整数、浮点数），逐字节取出再拼装
//!   既啰嗦又容易在回绕处出错；
//! - [`BlobReader`] 把 `[position, position + length)` 视为一段连续字节，所有读取都经由环掩码，
//!   调用方无需关心字段是否跨越环尾。
//!
//! # 契约说明（What）
//! - 背后的存储是字节环、常量区（负描述符）或通过 [`BlobReader::open_raw_read`] 指定的原始窗口；
//! - 定长读取在剩余字节不足时返回 [`io::ErrorKind::UnexpectedEof`]，不会越过字段上限；
//! - [`BlobReader::read_fully`] 例外：它信任调用方给出的长度，直接按需复制。

use alloc::string::String;
use std::io;

use bytes::BufMut;

use crate::codec::{decode_utf8_fast, pack_position_and_char, to_char, unpack_char, unpack_position, ByteSink};
use crate::error::Result;
use crate::pipe::PipeShared;
use crate::reader::PipeReader;
use crate::ring::RELATIVE_POS_MASK;
use crate::sync::Arc;
use crate::writer::PipeWriter;

/// 字段所在的存储。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    Ring,
    Constants,
}

/// 绑定到单个管道的字段读取游标，由 [`PipeReader::blob_reader`] 创建。
///
/// 同一个游标可以反复打开新的字段，打开动作会从读端取出描述符并推进其字节环工作尾。
pub struct BlobReader {
    shared: Arc<PipeShared>,
    backing: Backing,
    position: u32,
    length: i32,
    remaining: u32,
}

impl BlobReader {
    pub(crate) fn new(shared: Arc<PipeShared>) -> Self {
        Self {
            shared,
            backing: Backing::Ring,
            position: 0,
            length: 0,
            remaining: 0,
        }
    }

    #[inline]
    fn byte_at(&self, position: u32) -> u8 {
        match self.backing {
            Backing::Ring => self.shared.blob.get(position),
            Backing::Constants => self
                .shared
                .constants()
                .get(position as usize)
                .copied()
                .unwrap_or(0),
        }
    }

    fn open(&mut self, backing: Backing, position: u32, length: i32) {
        self.backing = backing;
        self.position = position;
        self.length = length;
        self.remaining = length.max(0) as u32;
    }

    /// 从读端取出下一个变长字段的描述符并打开它，返回字段长度（空值为 `-1`）。
    pub fn open_low_level_field(&mut self, reader: &mut PipeReader) -> i32 {
        let meta = reader.take_ring_byte_meta_data();
        let length = reader.take_ring_byte_len();
        if meta < 0 {
            self.open(Backing::Constants, (meta & RELATIVE_POS_MASK) as u32, length);
        } else {
            let position = reader.byte_position(meta, length) as u32;
            self.open(Backing::Ring, position, length);
        }
        length
    }

    /// 直接打开字节环上的任意窗口。
    pub fn open_raw_read(&mut self, position: u32, length: i32) {
        self.open(Backing::Ring, position, length);
    }

    /// 把紧随其后的下一个字段并入当前视图，返回该字段的长度。
    ///
    /// 当前视图为空时等价于 [`open_low_level_field`](Self::open_low_level_field)；
    /// 并入的字段应与当前字段在字节环上首尾相接。
    pub fn accum_low_level_field(&mut self, reader: &mut PipeReader) -> i32 {
        if self.length <= 0 {
            return self.open_low_level_field(reader);
        }
        let meta = reader.take_ring_byte_meta_data();
        let length = reader.take_ring_byte_len();
        if length > 0 {
            reader.byte_position(meta, length);
            self.length += length;
            self.remaining += length as u32;
        }
        length
    }

    /// 当前字段是否为空值。
    pub fn is_null(&self) -> bool {
        self.length < 0
    }

    pub fn length(&self) -> i32 {
        self.length
    }

    /// 剩余可读字节数。
    pub fn available(&self) -> usize {
        self.remaining as usize
    }

    pub fn has_remaining_bytes(&self) -> bool {
        self.remaining > 0
    }

    fn advance(&mut self, count: u32) {
        self.position = self.position.wrapping_add(count);
        self.remaining = self.remaining.saturating_sub(count);
    }

    fn copy_out(&self, target: &mut [u8]) {
        for (offset, slot) in target.iter_mut().enumerate() {
            *slot = self.byte_at(self.position.wrapping_add(offset as u32));
        }
    }

    /// 读取一个字节；到达上限时返回 `-1`。
    pub fn read_next(&mut self) -> i32 {
        if self.remaining == 0 {
            return -1;
        }
        let value = self.byte_at(self.position);
        self.advance(1);
        i32::from(value)
    }

    /// 读取至多 `target.len()` 个字节；到达上限时返回 `-1`。
    pub fn read_into(&mut self, target: &mut [u8]) -> i32 {
        if self.remaining == 0 {
            return -1;
        }
        let count = target.len().min(self.remaining as usize);
        self.copy_out(&mut target[..count]);
        self.advance(count as u32);
        count as i32
    }

    /// 把剩余字节中的至多 `limit` 个追加到 `target`，返回复制的字节数。
    pub fn read_to_buf<B>(&mut self, target: &mut B, limit: usize) -> usize
    where
        B: BufMut + ?Sized,
    {
        let count = limit.min(self.remaining as usize);
        for offset in 0..count as u32 {
            target.put_u8(self.byte_at(self.position.wrapping_add(offset)));
        }
        self.advance(count as u32);
        count
    }

    /// 按 `target.len()` 复制，不检查字段上限。
    pub fn read_fully(&mut self, target: &mut [u8]) {
        self.copy_out(target);
        self.advance(target.len() as u32);
    }

    /// 跳过至多 `count` 个字节，返回实际跳过的数量。
    pub fn skip_bytes(&mut self, count: usize) -> usize {
        let skipped = count.min(self.remaining as usize);
        self.advance(skipped as u32);
        skipped
    }

    fn take_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        if (self.remaining as usize) < N {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        let mut bytes = [0u8; N];
        self.copy_out(&mut bytes);
        self.advance(N as u32);
        Ok(bytes)
    }

    pub fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.read_unsigned_byte()? != 0)
    }

    pub fn read_byte(&mut self) -> io::Result<i8> {
        Ok(self.read_unsigned_byte()? as i8)
    }

    pub fn read_unsigned_byte(&mut self) -> io::Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_short(&mut self) -> io::Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_unsigned_short(&mut self) -> io::Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// 16 位 UTF-16 码元。
    pub fn read_char(&mut self) -> io::Result<u16> {
        self.read_unsigned_short()
    }

    pub fn read_int(&mut self) -> io::Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_long(&mut self) -> io::Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_float(&mut self) -> io::Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_double(&mut self) -> io::Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// 按 16 位码元读取一行：跳过 `\r`，遇到 `\n` 或字段末尾停止，换行符不计入结果。
    pub fn read_line(&mut self) -> String {
        let mut line = String::new();
        while self.remaining >= 2 {
            let Ok(unit) = self.read_unsigned_short() else {
                break;
            };
            match unit {
                0x0A => break,
                0x0D => continue,
                unit => line.push(to_char(u32::from(unit))),
            }
        }
        line
    }

    /// 读取 2 字节小端长度前缀，再解码该长度的 UTF-8 内容。
    pub fn read_utf(&mut self) -> io::Result<String> {
        let length = self.read_unsigned_short()? as usize;
        if length > self.remaining as usize {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        let mut text = String::with_capacity(length);
        self.read_utf_into(&mut text, length);
        Ok(text)
    }

    /// 解码接下来的 `byte_count` 个字节并追加到 `target`，返回解出的字符数。
    pub fn read_utf_into(&mut self, target: &mut String, byte_count: usize) -> usize {
        let byte_count = byte_count.min(self.remaining as usize);
        let start = self.position;
        let mut packed = pack_position_and_char(start, 0);
        let mut chars = 0usize;
        while (unpack_position(packed).wrapping_sub(start) as usize) < byte_count {
            packed = match self.backing {
                Backing::Ring => decode_utf8_fast(&self.shared.blob, packed),
                Backing::Constants => decode_utf8_fast(&self.shared.constants()[..], packed),
            };
            target.push(to_char(unpack_char(packed)));
            chars += 1;
        }
        self.advance(byte_count as u32);
        chars
    }

    /// 不移动游标，读取 `offset` 处的小端 `i32`。
    pub fn peek_int(&self, offset: u32) -> i32 {
        let mut bytes = [0u8; 4];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = self.byte_at(self.position.wrapping_add(offset).wrapping_add(i as u32));
        }
        i32::from_le_bytes(bytes)
    }

    /// 把接下来的至多 `length` 个字节作为一个变长字段写入另一条管道。
    pub fn copy_into_writer(&mut self, writer: &mut PipeWriter, length: usize) -> Result<usize> {
        let length = length.min(self.remaining as usize);
        let field_length = length as i32;
        writer.validate_var_length(field_length)?;
        let start = writer.blob_working_head_position();
        let mut target = writer.blob_ring();
        for offset in 0..length as u32 {
            target.put_byte(
                (start as u32).wrapping_add(offset),
                self.byte_at(self.position.wrapping_add(offset)),
            );
        }
        writer.commit_blob_field(start, field_length);
        self.advance(length as u32);
        Ok(length)
    }
}

impl io::Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf).max(0) as usize)
    }
}

impl core::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlobReader")
            .field("pipe", &self.shared.id)
            .field("backing", &self.backing)
            .field("position", &self.position)
            .field("length", &self.length)
            .field("remaining", &self.remaining)
            .finish()
    }
}
