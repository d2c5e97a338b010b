use crate::sync::{Arc, AtomicBool, Ordering};

/// 自旋等待的取消令牌。
///
/// # 设计背景（Why）
/// - 管道的阻塞写/读是显式的忙等循环，没有超时；调用方需要一种在循环外部打断等待的手段，
///   对应线程被中断的语义；
/// - 与关停标记不同，取消只影响持有同一令牌的自旋者，不会把管道切换到关停状态。
///
/// # 逻辑解析（How）
/// - 内部使用 [`AtomicBool`] 表达取消位，并通过 [`Arc`] 在写端、读端与外部控制者之间共享；
/// - `cancel` 首次成功置位时返回 `true`，重复调用返回 `false`；
/// - `child` 生成共享同一原子位的派生实例。
///
/// # 契约说明（What）
/// - **前置条件**：构造后处于“未取消”状态；
/// - **后置条件**：`cancel` 成功后，之后任何一次自旋检查都会观测到取消位并返回
///   [`PipeError::Interrupted`](crate::PipeError::Interrupted)。
#[derive(Clone, Debug)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消，返回是否为首次触发。
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 派生共享同一原子位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
