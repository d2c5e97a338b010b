//! 两端各自持有的位置缓存。
//!
//! # 设计初衷（Why）
//! - 对端发布的计数器位于另一条缓存行，每次判断“是否有空间/内容”都去读取它会产生跨核流量；
//! - 每端只在缓存判断失败时重新加载一次对端计数，命中时完全不触碰共享状态。

/// 写端缓存：最近观察到的已发布尾位置与“确认空间”的目标位置。
///
/// 目标位置从 `position - slab_size` 起步，每次 [`confirm`](Self::confirm) 前移一个片段尺寸，
/// 因此“尾位置 ≥ 目标 + 片段尺寸”恰好等价于“环中剩余空间足以容纳该片段”。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePositionCache {
    tail_cache: i64,
    room_target: i64,
}

impl WritePositionCache {
    pub fn new(position: i64, slab_size: usize) -> Self {
        Self {
            tail_cache: position,
            room_target: position - slab_size as i64,
        }
    }

    /// 判断是否有容纳 `size` 个槽位的空间；未命中时调用 `reload` 读取对端尾位置一次。
    #[inline]
    pub fn has_room(&mut self, size: usize, reload: impl FnOnce() -> i64) -> bool {
        self.tail_reaches(self.room_target + size as i64, reload)
    }

    /// 已发布尾位置是否不小于 `target`；缓存值不足时重新加载一次。
    ///
    /// 尾位置只增不减，缓存值命中即可判定，无需触碰对端缓存行。
    #[inline]
    pub(crate) fn tail_reaches(&mut self, target: i64, reload: impl FnOnce() -> i64) -> bool {
        if self.tail_cache >= target {
            return true;
        }
        self.tail_cache = reload();
        self.tail_cache >= target
    }

    #[inline]
    pub fn confirm(&mut self, size: usize) {
        self.room_target += size as i64;
    }

    /// 放弃未发布写入后，目标位置回到 `position - slab_size`。
    pub(crate) fn rewind_to(&mut self, position: i64, slab_size: usize) {
        self.room_target = position - slab_size as i64;
    }

    pub fn tail_cache(&self) -> i64 {
        self.tail_cache
    }

    pub fn room_target(&self) -> i64 {
        self.room_target
    }
}

/// 读端缓存：最近观察到的已发布头位置与已确认读取的位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPositionCache {
    head_cache: i64,
    confirmed: i64,
}

impl ReadPositionCache {
    pub fn new(position: i64) -> Self {
        Self {
            head_cache: position,
            confirmed: position,
        }
    }

    /// 是否至少有一个槽位可读。
    #[inline]
    pub fn has_content(&mut self, reload: impl FnOnce() -> i64) -> bool {
        if self.head_cache > self.confirmed {
            return true;
        }
        self.head_cache = reload();
        self.head_cache > self.confirmed
    }

    /// 是否有一个完整的 `size` 槽位片段可读。
    #[inline]
    pub fn has_content_sized(&mut self, size: usize, reload: impl FnOnce() -> i64) -> bool {
        let target = self.confirmed + size as i64 - 1;
        if self.head_cache > target {
            return true;
        }
        self.head_cache = reload();
        self.head_cache > target
    }

    #[inline]
    pub fn confirm(&mut self, size: usize) {
        self.confirmed += size as i64;
    }

    pub fn confirmed(&self) -> i64 {
        self.confirmed
    }

    /// 重放时把确认位置回拨到指定尾位置。
    pub(crate) fn rewind_to(&mut self, position: i64) {
        self.confirmed = position;
    }

    pub fn head_cache(&self) -> i64 {
        self.head_cache
    }
}
