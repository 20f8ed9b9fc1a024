//! 顺序预读
//!
//! 每个打开的文件一个上下文。顺序访问时预读窗口从 `RA_WINSIZE_INIT`
//! 开始逐次翻倍，最大到 `RA_WINSIZE_MAX`；访问跳开时窗口复位且本次不
//! 预读。

use super::address::VirtAddr;
use super::page::PageSys;
use super::stage::AnonUp;
use crate::config::{RA_WINSIZE_INIT, RA_WINSIZE_MAX};
use crate::error::{UvmError, UvmResult};
use crate::kern::pool::{Pool, PoolPageBackend, PoolSys, pool_init};
use crate::pmap::Pmap;
use alloc::collections::BTreeMap;
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Random,
    Sequential,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RaCtxId(pub VirtAddr);

#[derive(Debug, Clone, Copy, Default)]
struct RaCtx {
    valid: bool,
    winsize: usize,
    next: usize,
}

pub struct ReadAhead {
    pool: Pool,
    ctxs: BTreeMap<RaCtxId, RaCtx>,
}

/// 第 16 步，也是最后一步
pub fn uvm_ra_init(pools: &mut PoolSys, pagesize: usize, _: AnonUp) -> UvmResult<ReadAhead> {
    let pool = pool_init(pools, "uvmractx", core::mem::size_of::<RaCtx>(), 0, pagesize)?;
    info!("[ra] window {:#x}..={:#x}", RA_WINSIZE_INIT, RA_WINSIZE_MAX);
    Ok(ReadAhead {
        pool,
        ctxs: BTreeMap::new(),
    })
}

impl ReadAhead {
    pub fn allocctx(&mut self, pages: &PageSys, pmap: &mut dyn Pmap) -> UvmResult<RaCtxId> {
        let id = RaCtxId(self.pool.get(&mut PoolPageBackend { pages, pmap })?);
        self.ctxs.insert(id, RaCtx::default());
        Ok(id)
    }

    pub fn freectx(&mut self, id: RaCtxId) -> UvmResult<()> {
        self.ctxs.remove(&id).ok_or(UvmError::BadFree)?;
        self.pool.put(id.0)
    }

    /// 记录一次 `[off, off + size)` 的读，返回应当预读的区间 `(起点, 长度)`
    pub fn request(&mut self, id: RaCtxId, advice: Advice, off: usize, size: usize) -> Option<(usize, usize)> {
        let ra = self.ctxs.get_mut(&id)?;
        // 请求越过地址空间末尾时不预读
        let end = off.checked_add(size)?;
        match advice {
            Advice::Random => None,
            Advice::Sequential => {
                ra.valid = true;
                ra.winsize = RA_WINSIZE_MAX;
                ra.next = end;
                Some((ra.next, ra.winsize))
            }
            Advice::Normal if !ra.valid => {
                ra.valid = true;
                ra.winsize = RA_WINSIZE_INIT;
                ra.next = end;
                Some((ra.next, ra.winsize))
            }
            Advice::Normal if off == ra.next => {
                ra.winsize = (ra.winsize * 2).min(RA_WINSIZE_MAX);
                ra.next = end;
                Some((ra.next, ra.winsize))
            }
            Advice::Normal => {
                ra.winsize = RA_WINSIZE_INIT;
                ra.next = end;
                None
            }
        }
    }
}
