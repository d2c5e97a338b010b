//! 并发原语切换层。
//!
//! # 设计初衷（Why）
//! - 管道的正确性完全依赖头尾计数器的发布/获取语义，需要在 Loom 下穷举交错验证；
//! - 生产代码与模型测试共享同一份源码，只在此处按 `cfg(loom)` / `cfg(spark_loom)` 切换实现。
//!
//! # 契约说明（What）
//! - 其余模块只允许通过 `crate::sync` 引用原子类型、`Arc` 与 `yield_now`，禁止直接依赖 `core::sync`；
//! - Loom 模式需要同时开启 `loom-model` Feature 并设置 `RUSTFLAGS="--cfg loom"`。

#[cfg(not(any(loom, spark_loom)))]
pub(crate) use alloc::sync::Arc;
#[cfg(not(any(loom, spark_loom)))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, AtomicU32, Ordering};

#[cfg(any(loom, spark_loom))]
pub(crate) use loom::sync::Arc;
#[cfg(any(loom, spark_loom))]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, AtomicU32, Ordering};

/// 自旋等待时让出当前线程。
#[inline]
pub(crate) fn yield_now() {
    #[cfg(not(any(loom, spark_loom)))]
    std::thread::yield_now();
    #[cfg(any(loom, spark_loom))]
    loom::thread::yield_now();
}
