use core::fmt;

use crossbeam_utils::CachePadded;

use crate::sync::{AtomicI32, AtomicI64, Ordering};

/// 独占一条缓存行的 64 位发布计数器。
///
/// # 设计初衷（Why）
/// - 槽环的头/尾计数分别由生产者与消费者写入，若二者落在同一缓存行，
///   每次发布都会让对端缓存失效（伪共享），吞吐随核数下降；
/// - 使用 [`CachePadded`] 按目标平台的缓存行宽度对齐，无需手写填充字段。
///
/// # 契约说明（What）
/// - **单写者**：同一时刻只允许一个线程调用 [`set`](Self::set)/[`add`](Self::add)，
///   因此写入无需 CAS；
/// - `set` 使用 `Release`，`get` 使用 `Acquire`，保证写入方在发布前对环形存储的所有写入
///   对观察方可见；
/// - `get_relaxed` 仅供写入方读取自己发布过的值。
pub struct PaddedLong {
    value: CachePadded<AtomicI64>,
}

impl PaddedLong {
    /// 以初始值构造计数器。
    pub fn new(initial: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(initial)),
        }
    }

    /// 读取对端发布的值。
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// 读取本线程自己发布的值，不建立同步关系。
    #[inline]
    pub fn get_relaxed(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// 发布新值。
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// 单写者自增并返回新值。
    #[inline]
    pub fn add(&self, inc: i64) -> i64 {
        let next = self.get_relaxed() + inc;
        self.set(next);
        next
    }
}

impl fmt::Debug for PaddedLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_relaxed())
    }
}

/// 独占一条缓存行的 32 位发布计数器，用于字节环的头/尾。
///
/// 语义与 [`PaddedLong`] 相同，额外提供按回绕掩码累加的 [`masked_add`](Self::masked_add)，
/// 以匹配字节环位置在 31 位处回绕的约定。
pub struct PaddedInt {
    value: CachePadded<AtomicI32>,
}

impl PaddedInt {
    /// 以初始值构造计数器。
    pub fn new(initial: i32) -> Self {
        Self {
            value: CachePadded::new(AtomicI32::new(initial)),
        }
    }

    #[inline]
    pub fn get(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn get_relaxed(&self) -> i32 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, value: i32) {
        self.value.store(value, Ordering::Release);
    }

    /// 单写者累加并按 `wrap_mask` 截断，返回新值。
    #[inline]
    pub fn masked_add(&self, inc: i32, wrap_mask: i32) -> i32 {
        let next = self.get_relaxed().wrapping_add(inc) & wrap_mask;
        self.set(next);
        next
    }
}

impl fmt::Debug for PaddedInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_relaxed())
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use super::*;

    #[test]
    fn padded_cells_occupy_distinct_cache_lines() {
        // 两个相邻计数器的地址差至少为一条缓存行，确保生产者/消费者互不干扰。
        let pair = [PaddedLong::new(0), PaddedLong::new(0)];
        let first = &pair[0] as *const PaddedLong as usize;
        let second = &pair[1] as *const PaddedLong as usize;
        assert!(second - first >= 64, "填充后的计数器必须至少相隔 64 字节");
    }

    #[test]
    fn masked_add_wraps_at_sign_bit() {
        let cell = PaddedInt::new(0x7FFF_FFFE);
        assert_eq!(cell.masked_add(3, 0x7FFF_FFFF), 1, "越过 31 位后应回绕到低位");
        assert_eq!(cell.get(), 1);
    }

    #[test]
    fn add_publishes_new_value() {
        let cell = PaddedLong::new(10);
        assert_eq!(cell.add(5), 15);
        assert_eq!(cell.get(), 15);
        assert_eq!(format!("{cell:?}"), "15");
    }
}
