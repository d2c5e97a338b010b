//! 直接作用在环形存储上的编解码例程。
//!
//! # 模块定位（Why）
//! - 变长字段的编码/解码不经过中间缓冲，直接在字节环上逐字节完成，位置按环掩码回绕；
//! - 常量区（负描述符）同样通过 [`ByteSource`] 暴露，解码逻辑对两类存储一视同仁。
//!
//! # 逻辑解析（How）
//! - [`ByteSource`]/[`ByteSink`] 抽象“按位置取/存一个字节”，掩码由实现者自行处理：
//!   字节环按 `byte_mask` 回绕，切片（常量区或测试缓冲）按下标直达；
//! - UTF-8 解码使用打包值 `(position << 32) | char`，单次调用推进一个字符，
//!   调用方无需额外的游标结构。
//!
//! # 契约说明（What）
//! - 损坏的 UTF-8 永远不会以错误值返回，而是替换为 U+FFFD；最终续字节损坏时额外记录 `error` 日志；
//! - 编码支持 1~6 字节（含旧式 5/6 字节形式），`value >= 0x7FFF_FFFF` 返回
//!   [`PipeError::UnencodableChar`]。

use tracing::error;

use crate::error::{PipeError, Result};
use crate::ring::BlobRing;

/// 解码失败时的替换字符。
pub const REPLACEMENT_CHAR: u32 = 0xFFFD;

/// 可按位置读取单字节的存储。
pub trait ByteSource {
    fn byte_at(&self, position: u32) -> u8;
}

/// 可按位置写入单字节的存储。
pub trait ByteSink {
    fn put_byte(&mut self, position: u32, value: u8);
}

impl ByteSource for [u8] {
    #[inline]
    fn byte_at(&self, position: u32) -> u8 {
        self.get(position as usize).copied().unwrap_or(0)
    }
}

impl ByteSink for [u8] {
    #[inline]
    fn put_byte(&mut self, position: u32, value: u8) {
        if let Some(slot) = self.get_mut(position as usize) {
            *slot = value;
        }
    }
}

impl ByteSource for BlobRing {
    #[inline]
    fn byte_at(&self, position: u32) -> u8 {
        self.get(position)
    }
}

impl ByteSource for &BlobRing {
    #[inline]
    fn byte_at(&self, position: u32) -> u8 {
        self.get(position)
    }
}

impl ByteSink for &BlobRing {
    #[inline]
    fn put_byte(&mut self, position: u32, value: u8) {
        self.set(position, value);
    }
}

/// 将 `(position, char)` 打包为解码游标。
#[inline]
pub const fn pack_position_and_char(position: u32, value: u32) -> u64 {
    ((position as u64) << 32) | value as u64
}

/// 从打包值中取出下一次解码的起始位置。
#[inline]
pub const fn unpack_position(packed: u64) -> u32 {
    (packed >> 32) as u32
}

/// 从打包值中取出本次解码得到的字符值。
#[inline]
pub const fn unpack_char(packed: u64) -> u32 {
    packed as u32
}

/// 把单个码点编码为 UTF-8 写入 `sink`，返回写入后的下一个位置。
///
/// # 契约说明（What）
/// - `<= 0x7F`：1 字节；`<= 0x7FF`：2 字节；`<= 0xFFFF`：3 字节，其中代理区
///   `0xD800..=0xDFFF` 无法单独编码，写出 `?`；
/// - `< 0x1F_FFFF`：4 字节；`< 0x3FF_FFFF`：5 字节；`< 0x7FFF_FFFF`：6 字节；
/// - 其余值返回 [`PipeError::UnencodableChar`]，此时 `sink` 未被修改。
pub fn encode_single_char<S>(value: u32, sink: &mut S, position: u32) -> Result<u32>
where
    S: ByteSink + ?Sized,
{
    let mut encoded = [0u8; 6];
    let len = if value <= 0x7F {
        encoded[0] = value as u8;
        1
    } else if value <= 0x7FF {
        encoded[0] = 0xC0 | ((value >> 6) & 0x1F) as u8;
        encoded[1] = 0x80 | (value & 0x3F) as u8;
        2
    } else if value <= 0xFFFF {
        if (0xD800..=0xDFFF).contains(&value) {
            encoded[0] = b'?';
            1
        } else {
            encoded[0] = 0xE0 | ((value >> 12) & 0x0F) as u8;
            encoded[1] = 0x80 | ((value >> 6) & 0x3F) as u8;
            encoded[2] = 0x80 | (value & 0x3F) as u8;
            3
        }
    } else {
        let lead = if value < 0x1F_FFFF {
            encoded[0] = 0xF0 | ((value >> 18) & 0x07) as u8;
            1
        } else if value < 0x3FF_FFFF {
            encoded[0] = 0xF8 | ((value >> 24) & 0x03) as u8;
            encoded[1] = 0x80 | ((value >> 18) & 0x3F) as u8;
            2
        } else if value < 0x7FFF_FFFF {
            encoded[0] = 0xFC | ((value >> 30) & 0x01) as u8;
            encoded[1] = 0x80 | ((value >> 24) & 0x3F) as u8;
            encoded[2] = 0x80 | ((value >> 18) & 0x3F) as u8;
            3
        } else {
            return Err(PipeError::UnencodableChar { value });
        };
        encoded[lead] = 0x80 | ((value >> 12) & 0x3F) as u8;
        encoded[lead + 1] = 0x80 | ((value >> 6) & 0x3F) as u8;
        encoded[lead + 2] = 0x80 | (value & 0x3F) as u8;
        lead + 3
    };
    for (offset, byte) in encoded[..len].iter().enumerate() {
        sink.put_byte(position.wrapping_add(offset as u32), *byte);
    }
    Ok(position.wrapping_add(len as u32))
}

/// 单码点编码后的字节数，与 [`encode_single_char`] 的分支一一对应。
pub fn encoded_len(value: u32) -> Result<usize> {
    Ok(match value {
        0..=0x7F => 1,
        0x80..=0x7FF => 2,
        0xD800..=0xDFFF => 1,
        0x800..=0xFFFF => 3,
        _ if value < 0x1F_FFFF => 4,
        _ if value < 0x3FF_FFFF => 5,
        _ if value < 0x7FFF_FFFF => 6,
        _ => return Err(PipeError::UnencodableChar { value }),
    })
}

/// 从打包游标处解码一个字符，返回新的打包游标。
///
/// # 逻辑解析（How）
/// - 首字节的前导 1 的个数决定后续续字节数量 `n`（1~5）；
/// - 第 `i` 个续字节（从 0 计）不是 `10xxxxxx` 时，位置再跳过 `n - i` 个字节并返回 U+FFFD；
///   最后一个续字节损坏时额外记录 `error` 日志，便于发现上游的环损坏；
/// - 首字节为 `100xxxxx` 时跳过 2 个字节，为 `1111111x` 时跳过 6 个字节，均返回 U+FFFD。
///
/// # 契约说明（What）
/// - 永不返回错误；调用方按需把字符值转换为 `char`，超出 Unicode 范围时同样替换为 U+FFFD。
pub fn decode_utf8_fast<S>(source: &S, packed: u64) -> u64
where
    S: ByteSource + ?Sized,
{
    let mut pos = unpack_position(packed);
    let lead = source.byte_at(pos);
    pos = pos.wrapping_add(1);
    if lead < 0x80 {
        return pack_position_and_char(pos, u32::from(lead));
    }

    let (mut result, continuations) = if lead & 0x20 == 0 {
        if lead & 0x40 == 0 {
            return pack_position_and_char(pos.wrapping_add(1), REPLACEMENT_CHAR);
        }
        (u32::from(lead & 0x1F), 1u32)
    } else if lead & 0x10 == 0 {
        (u32::from(lead & 0x0F), 2)
    } else if lead & 0x08 == 0 {
        (u32::from(lead & 0x07), 3)
    } else if lead & 0x04 == 0 {
        (u32::from(lead & 0x03), 4)
    } else if lead & 0x02 == 0 {
        (u32::from(lead & 0x01), 5)
    } else {
        return pack_position_and_char(pos.wrapping_add(5), REPLACEMENT_CHAR);
    };

    for index in 0..continuations {
        let next = source.byte_at(pos);
        if next & 0xC0 != 0x80 {
            let remaining = continuations - index;
            if remaining == 1 {
                error!(
                    byte = format_args!("{next:08b}"),
                    position = pos,
                    "invalid utf-8 encoding, low byte must have bits of 10xxxxxx; check for pipe corruption"
                );
            }
            return pack_position_and_char(pos.wrapping_add(remaining), REPLACEMENT_CHAR);
        }
        result = (result << 6) | u32::from(next & 0x3F);
        pos = pos.wrapping_add(1);
    }
    pack_position_and_char(pos, result)
}

/// 把解码得到的字符值转换为 `char`，非法码点替换为 U+FFFD。
#[inline]
pub fn to_char(value: u32) -> char {
    char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// 解码 `[position, position + byte_len)` 内的全部字符并追加到 `target`。
pub fn decode_utf8_into<S>(source: &S, position: u32, byte_len: usize, target: &mut alloc::string::String)
where
    S: ByteSource + ?Sized,
{
    let limit = u64::from(position) + byte_len as u64;
    let mut packed = pack_position_and_char(position, 0);
    let mut consumed = 0u64;
    while u64::from(position) + consumed < limit {
        let before = unpack_position(packed);
        packed = decode_utf8_fast(source, packed);
        consumed += u64::from(unpack_position(packed).wrapping_sub(before));
        target.push(to_char(unpack_char(packed)));
    }
}

/// 以“每字符取低 8 位”的方式写入 ASCII，返回写入的字符数。
pub fn pack_ascii<S>(text: &str, sink: &mut S, position: u32) -> usize
where
    S: ByteSink + ?Sized,
{
    let mut count = 0usize;
    for ch in text.chars() {
        sink.put_byte(position.wrapping_add(count as u32), ch as u32 as u8);
        count += 1;
    }
    count
}

/// 把 `value` 的十进制表示从 `idx` 处自右向左写出，再整体下移到 `head`，返回字符数。
///
/// # 逻辑解析（How）
/// - 先写数字，再无条件在最左位前写一个 `-`，仅当值为负时把它计入长度；
/// - 数字段起点不等于 `head` 时逐字节搬移到 `head`；
/// - `idx` 应为 `head + 12`，为 `i32::MIN` 预留足够空间。
pub fn left_convert_int_to_ascii<T>(target: &mut T, value: i32, idx: u32, head: u32) -> usize
where
    T: ByteSource + ByteSink + ?Sized,
{
    left_convert_digits(target, i64::from(value), 0, idx, head)
}

/// 64 位版本，`idx` 应为 `head + 21`。
pub fn left_convert_long_to_ascii<T>(target: &mut T, value: i64, idx: u32, head: u32) -> usize
where
    T: ByteSource + ByteSink + ?Sized,
{
    left_convert_digits(target, value, 0, idx, head)
}

/// 与 [`left_convert_long_to_ascii`] 相同，但数字不足 `chars` 位时在左侧补 `0`。
pub fn left_convert_long_with_leading_zeros_to_ascii<T>(
    target: &mut T,
    chars: u32,
    value: i64,
    idx: u32,
    head: u32,
) -> usize
where
    T: ByteSource + ByteSink + ?Sized,
{
    left_convert_digits(target, value, chars, idx, head)
}

fn left_convert_digits<T>(target: &mut T, value: i64, min_digits: u32, idx: u32, head: u32) -> usize
where
    T: ByteSource + ByteSink + ?Sized,
{
    let max = idx;
    let mut idx = idx;
    let mut remaining = value.unsigned_abs();
    let mut written = 0u32;
    loop {
        idx = idx.wrapping_sub(1);
        target.put_byte(idx, b'0' + (remaining % 10) as u8);
        remaining /= 10;
        written += 1;
        if remaining == 0 {
            break;
        }
    }
    while written < min_digits {
        idx = idx.wrapping_sub(1);
        target.put_byte(idx, b'0');
        written += 1;
    }
    target.put_byte(idx.wrapping_sub(1), b'-');
    if value < 0 {
        idx = idx.wrapping_sub(1);
    }

    let length = max.wrapping_sub(idx) as usize;
    if idx != head {
        for offset in 0..length as u32 {
            let byte = target.byte_at(idx.wrapping_add(offset));
            target.put_byte(head.wrapping_add(offset), byte);
        }
    }
    length
}

/// 在两块带掩码的存储之间复制 `length` 个字节，源与目标各自独立回绕，返回实际复制的字节数。
///
/// `source_mask`/`target_mask` 为 `u32::MAX` 时表示该侧不回绕（例如常量区）。
/// 掩码后的下标落在存储之外时提前停止，返回值小于 `length`。
pub fn copy_bytes_from_to_ring(
    source: &[u8],
    source_loc: u32,
    source_mask: u32,
    target: &mut [u8],
    target_loc: u32,
    target_mask: u32,
    length: usize,
) -> usize {
    let mut remaining = length;
    let mut src = source_loc;
    let mut dst = target_loc;
    while remaining > 0 {
        let src_idx = (src & source_mask) as usize;
        let dst_idx = (dst & target_mask) as usize;
        let run = remaining
            .min(source.len().saturating_sub(src_idx))
            .min(target.len().saturating_sub(dst_idx));
        if run == 0 {
            break;
        }
        target[dst_idx..dst_idx + run].copy_from_slice(&source[src_idx..src_idx + run]);
        remaining -= run;
        src = src.wrapping_add(run as u32);
        dst = dst.wrapping_add(run as u32);
    }
    length - remaining
}

/// 在任意字节源与字节汇之间逐字节复制，适用于环到环的搬运。
pub fn copy_between<S, T>(source: &S, source_loc: u32, target: &mut T, target_loc: u32, length: usize)
where
    S: ByteSource + ?Sized,
    T: ByteSink + ?Sized,
{
    for offset in 0..length as u32 {
        target.put_byte(
            target_loc.wrapping_add(offset),
            source.byte_at(source_loc.wrapping_add(offset)),
        );
    }
}
