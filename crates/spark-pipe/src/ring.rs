//! 两类环形存储：槽环（32 位单元）与字节环。
//!
//! # 设计初衷（Why）
//! - 生产者与消费者并发访问同一块存储，但依靠头尾计数器的发布/获取关系保证不会同时触碰同一单元；
//! - 使用 `Relaxed` 原子单元承载数据，既不需要 `unsafe`，在主流平台上又与普通读写等价；
//!   跨线程可见性完全由计数器上的 `Release`/`Acquire` 建立。
//!
//! # 寻址约定（What）
//! - 槽环位置为单调递增的 64 位计数，下标 = `position & mask`；
//! - 字节环位置为 31 位回绕计数（[`BYTES_WRAP_MASK`]），下标 = `position & byte_mask`；
//! - 两种环的容量均为 2 的幂，构造时一次性分配，之后不再扩容。

use alloc::{boxed::Box, vec::Vec};

use crate::sync::{AtomicI32, AtomicU8, Ordering};

/// 描述符中相对偏移的有效位。
pub const RELATIVE_POS_MASK: i32 = 0x7FFF_FFFF;
/// 字节环位置的回绕掩码，与环下标掩码相互独立。
pub const BYTES_WRAP_MASK: i32 = 0x7FFF_FFFF;
/// EOF 哨兵片段占用的槽位数：编号 `-1` 与尾随计数 `0`。
pub const EOF_SIZE: usize = 2;

/// 槽环：存放标量字段、变长描述符以及每个片段尾随的字节计数。
pub struct SlabRing {
    cells: Box<[AtomicI32]>,
    mask: usize,
}

impl SlabRing {
    /// 按 `1 << bits` 分配槽环；分配失败返回 `None`，由调用方决定如何降级。
    pub(crate) fn allocate(bits: u8) -> Option<Self> {
        let size = 1usize << bits;
        let mut cells = Vec::new();
        cells.try_reserve_exact(size).ok()?;
        cells.extend((0..size).map(|_| AtomicI32::new(0)));
        Some(Self {
            cells: cells.into_boxed_slice(),
            mask: size - 1,
        })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn mask(&self) -> usize {
        self.mask
    }

    #[inline]
    fn index(&self, position: i64) -> usize {
        (position as u64 as usize) & self.mask
    }

    #[inline]
    pub fn get(&self, position: i64) -> i32 {
        self.cells[self.index(position)].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, position: i64, value: i32) {
        self.cells[self.index(position)].store(value, Ordering::Relaxed);
    }

    pub(crate) fn clear(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Ordering::Relaxed);
        }
    }
}

/// 字节环：存放变长字段的原始字节。
pub struct BlobRing {
    bytes: Box<[AtomicU8]>,
    mask: usize,
}

impl BlobRing {
    /// 按 `1 << bits` 分配字节环；分配失败返回 `None`。
    pub(crate) fn allocate(bits: u8) -> Option<Self> {
        let size = 1usize << bits;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).ok()?;
        bytes.extend((0..size).map(|_| AtomicU8::new(0)));
        Some(Self {
            bytes: bytes.into_boxed_slice(),
            mask: size - 1,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn mask(&self) -> usize {
        self.mask
    }

    #[inline]
    fn index(&self, position: u32) -> usize {
        position as usize & self.mask
    }

    #[inline]
    pub fn get(&self, position: u32) -> u8 {
        self.bytes[self.index(position)].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, position: u32, value: u8) {
        self.bytes[self.index(position)].store(value, Ordering::Relaxed);
    }

    /// 自 `position` 起写入 `data`，越过环尾时回绕到下标 0。
    pub fn write_slice(&self, position: u32, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.set(position.wrapping_add(offset as u32), *byte);
        }
    }

    /// 自 `position` 起读出 `target.len()` 个字节，越过环尾时回绕。
    pub fn read_slice(&self, position: u32, target: &mut [u8]) {
        for (offset, slot) in target.iter_mut().enumerate() {
            *slot = self.get(position.wrapping_add(offset as u32));
        }
    }

    /// 计算 `[position, position + length)` 在底层存储中的连续分段。
    ///
    /// 返回 `(first_start, first_len, second_len)`：第二段总是从下标 0 开始。
    pub fn segments(&self, position: u32, length: usize) -> (usize, usize, usize) {
        let start = self.index(position);
        let first = length.min(self.len() - start);
        (start, first, length - first)
    }

    pub(crate) fn clear(&self) {
        for byte in self.bytes.iter() {
            byte.store(0, Ordering::Relaxed);
        }
    }
}
