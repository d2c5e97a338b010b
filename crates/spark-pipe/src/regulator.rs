use core::time::Duration;

/// 速率调节钩子。
///
/// # 设计背景（Why）
/// - 管道本身只负责无锁传输，限速策略（按消息数/字节数/时间窗）属于调度层；
/// - 写端与读端各自可以挂载一个调节器，调度层在每个批次开始前询问应等待多久。
///
/// # 契约说明（What）
/// - `position` 为调用侧当前的槽环工作位置（写端为工作头，读端为工作尾）；
/// - 返回 [`Duration::ZERO`] 表示无需等待；实现者需自行记录时间基准；
/// - 调节器只会被持有它的那一端调用，因此只要求 `Send`。
pub trait RateRegulator: Send {
    fn rate_limit_delay(&mut self, position: i64) -> Duration;
}

/// 保存至多一个调节器，并把“未挂载”统一折算为零等待。
#[derive(Default)]
pub(crate) struct RegulatorSlot {
    regulator: Option<alloc::boxed::Box<dyn RateRegulator>>,
}

impl RegulatorSlot {
    /// 挂载调节器；已存在时返回 `false` 且保留原实例。
    pub(crate) fn install(&mut self, regulator: alloc::boxed::Box<dyn RateRegulator>) -> bool {
        if self.regulator.is_some() {
            return false;
        }
        self.regulator = Some(regulator);
        true
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.regulator.is_some()
    }

    pub(crate) fn delay(&mut self, position: i64) -> Duration {
        self.regulator
            .as_mut()
            .map_or(Duration::ZERO, |regulator| regulator.rate_limit_delay(position))
    }
}

impl core::fmt::Debug for RegulatorSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegulatorSlot")
            .field("installed", &self.is_installed())
            .finish()
    }
}
