//! 换页策略（时钟算法）
//!
//! 页分配器初始化时先用临时参数建立策略；等第 14 步真实的页计数可用
//! 之后，`uvmpd_tune` 重新计算水位线，策略再据此重新同步。

use super::exp::UvmExp;
use super::page::PageStats;
use super::stage::{Advance, KernelPageable, PdPolicyLive};
use crate::config::{CLOCK_INACTIVEPCT, FREEMIN_MAX_BYTES, FREEMIN_MIN_BYTES};
use log::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdPolicy {
    inactivepct: usize,
    inactarg: usize,
    provisional: bool,
}

pub fn uvmpdpol_init() -> PdPolicy {
    PdPolicy {
        inactivepct: CLOCK_INACTIVEPCT,
        inactarg: 0,
        provisional: true,
    }
}

/// 按物理内存大小重新计算 freemin/freetarg/wiredmax
pub fn uvmpd_tune(exp: &mut UvmExp) {
    let g = match exp.geometry() {
        Some(g) => g,
        None => return,
    };
    exp.freemin = (exp.npages / 20).clamp(g.atop(FREEMIN_MIN_BYTES).max(1), g.atop(FREEMIN_MAX_BYTES).max(1));
    exp.freetarg = (exp.freemin * 4 / 3).max(exp.freemin + 1);
    exp.wiredmax = exp.npages / 3;
}

impl PdPolicy {
    pub fn inactarg(&self) -> usize {
        self.inactarg
    }

    pub fn is_provisional(&self) -> bool {
        self.provisional
    }

    /// 按当前活跃/非活跃页数重新计算非活跃目标
    pub fn reinit(&mut self, exp: &UvmExp, stats: PageStats) {
        self.inactarg = (stats.active + stats.inactive) * self.inactivepct / 100;
        if self.inactarg <= exp.freetarg {
            self.inactarg = exp.freetarg + 1;
        }
        self.provisional = false;
    }

    /// page daemon 是否需要扫描
    pub fn needs_scan(&self, exp: &UvmExp, stats: PageStats) -> bool {
        stats.free < exp.freetarg || stats.inactive < self.inactarg
    }
}

/// 第 14 步
pub fn uvmpdpol_reinit(
    pdpol: &mut PdPolicy,
    exp: &mut UvmExp,
    stats: PageStats,
    t: KernelPageable,
) -> PdPolicyLive {
    exp.free = stats.free;
    exp.active = stats.active;
    exp.inactive = stats.inactive;
    exp.wired = stats.wired;
    uvmpd_tune(exp);
    pdpol.reinit(exp, stats);
    exp.inactarg = pdpol.inactarg();
    info!(
        "[pdpol] freemin {} freetarg {} wiredmax {} inactarg {}",
        exp.freemin,
        exp.freetarg,
        exp.wiredmax,
        pdpol.inactarg()
    );
    t.advance(&*pdpol)
}
