//! UVM 启动编排
//!
//! [`Uvm::bootstrap`] 按固定顺序执行第 0 到第 16 步。每一步消耗上一步的
//! 阶段令牌并产出下一步的令牌，所以顺序错误在编译期就会暴露；每一步只
//! 写它自己负责的 [`UvmCore`] 字段。
//!
//! 全局入口 [`uvm_init`] 操作进程唯一的 [`UVM`]，任何失败都是致命的。

use super::address::VirtAddr;
use super::anon::{AnonId, AnonSys, uvm_anon_init};
use super::emap::{EmapSys, uvm_emap_sysinit};
use super::exp::UvmExp;
use super::km::{KernelSpace, KmCtx, KmFlags, uvm_km_alloc, uvm_km_free, uvm_km_init};
use super::loan::{LoanSys, uvm_loan_init};
use super::map::{MapSys, VmMap, VmProt, uvm_map_init};
use super::object::{SwHashStorage, UvmObject, swhash_buckets};
use super::page::{PageId, PageOwner, PageStats, PageSys, PgaFlags, PhysMem, uvm_page_init};
use super::pager::{PagerSys, uvm_pager_init};
use super::pdpolicy::{PdPolicy, uvmpdpol_init, uvmpdpol_reinit};
use super::readahead::{Advice, RaCtxId, ReadAhead, uvm_ra_init};
use super::stage;
use super::uarea::{UareaSys, uvm_uarea_init};
use crate::config::MAXCPUS;
use crate::error::{UvmError, UvmResult};
use crate::kern::kmem::{Kmem, kmem_init};
use crate::kern::lockobj::{LockObjCache, LockObjId, mutex_obj_init, rw_obj_init};
use crate::kern::malloc::{MallocSys, kmeminit};
use crate::kern::pool::{PoolSys, pool_subsystem_init};
use crate::pmap::{Pmap, PmapInitCtx};
use crate::sync::UPSafeCell;
use alloc::boxed::Box;
use lazy_static::*;
use log::info;

/// 启动步骤，编号即执行顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootStep {
    CheckPageSize,
    Zero,
    PageInit,
    MapInit,
    KmInit,
    PmapInit,
    Kmeminit,
    PagerInit,
    PoolInit,
    KmemInit,
    LockObjInit,
    LoanInit,
    EmapInit,
    KernelPageable,
    PdPolicyReinit,
    AnonUareaInit,
    ReadAheadInit,
}

impl BootStep {
    pub const ALL: [BootStep; 17] = [
        BootStep::CheckPageSize,
        BootStep::Zero,
        BootStep::PageInit,
        BootStep::MapInit,
        BootStep::KmInit,
        BootStep::PmapInit,
        BootStep::Kmeminit,
        BootStep::PagerInit,
        BootStep::PoolInit,
        BootStep::KmemInit,
        BootStep::LockObjInit,
        BootStep::LoanInit,
        BootStep::EmapInit,
        BootStep::KernelPageable,
        BootStep::PdPolicyReinit,
        BootStep::AnonUareaInit,
        BootStep::ReadAheadInit,
    ];

    pub fn number(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            BootStep::CheckPageSize => "check page size",
            BootStep::Zero => "zero uvm",
            BootStep::PageInit => "uvm_page_init",
            BootStep::MapInit => "uvm_map_init",
            BootStep::KmInit => "uvm_km_init",
            BootStep::PmapInit => "pmap_init",
            BootStep::Kmeminit => "kmeminit",
            BootStep::PagerInit => "uvm_pager_init",
            BootStep::PoolInit => "pool_subsystem_init",
            BootStep::KmemInit => "kmem_init",
            BootStep::LockObjInit => "mutex_obj_init/rw_obj_init",
            BootStep::LoanInit => "uvm_loan_init",
            BootStep::EmapInit => "uvm_emap_sysinit",
            BootStep::KernelPageable => "kernel object pageable",
            BootStep::PdPolicyReinit => "uvmpdpol_reinit",
            BootStep::AnonUareaInit => "uvm_anon_init/uvm_uarea_init",
            BootStep::ReadAheadInit => "uvm_ra_init",
        }
    }
}

/// 观察启动过程，测试用
pub trait BootObserver {
    fn before(&mut self, _step: BootStep, _core: &UvmCore) {}
    fn after(&mut self, _step: BootStep, _core: &UvmCore) {}
}

struct Quiet;

impl BootObserver for Quiet {}

/// 全局 VM 单例：每个字段由唯一的启动步骤写入
#[derive(Default)]
pub struct UvmCore {
    pub(crate) page: Option<PageSys>,
    pub(crate) pdpol: Option<PdPolicy>,
    pub(crate) map: Option<MapSys>,
    pub(crate) kernel: Option<KernelSpace>,
    pub(crate) pmap_initialized: bool,
    pub(crate) malloc: Option<MallocSys>,
    pub(crate) pager: Option<PagerSys>,
    pub(crate) pools: Option<PoolSys>,
    pub(crate) kmem: Option<Kmem>,
    pub(crate) mutex_obj: Option<LockObjCache>,
    pub(crate) rw_obj: Option<LockObjCache>,
    pub(crate) loan: Option<LoanSys>,
    pub(crate) emap: Option<EmapSys>,
    pub(crate) kernel_pageable: bool,
    pub(crate) pdpol_live: bool,
    pub(crate) anon: Option<AnonSys>,
    pub(crate) uarea: Option<UareaSys>,
    pub(crate) ra: Option<ReadAhead>,
}

/// 从 [`UvmCore`] 中同时借出的各个子系统
pub(crate) struct Parts<'a> {
    pub kernel_map: &'a mut VmMap,
    pub ctx: KmCtx<'a>,
    pub malloc: Option<&'a mut MallocSys>,
    pub pager: Option<&'a mut PagerSys>,
    pub kmem: Option<&'a mut Kmem>,
    pub mutex_obj: Option<&'a mut LockObjCache>,
    pub rw_obj: Option<&'a mut LockObjCache>,
    pub loan: Option<&'a mut LoanSys>,
    pub emap: Option<&'a mut EmapSys>,
    pub anon: Option<&'a mut AnonSys>,
    pub uarea: Option<&'a mut UareaSys>,
    pub ra: Option<&'a mut ReadAhead>,
}

fn ready<T>(x: Option<T>, what: &'static str) -> UvmResult<T> {
    x.ok_or(UvmError::NotReady(what))
}

impl UvmCore {
    /// 第 `step` 步负责的字段是否都还是零值
    pub fn pristine_for(&self, step: BootStep) -> bool {
        match step {
            BootStep::CheckPageSize | BootStep::Zero => true,
            BootStep::PageInit => self.page.is_none() && self.pdpol.is_none(),
            BootStep::MapInit => self.map.is_none(),
            BootStep::KmInit => self.kernel.is_none(),
            BootStep::PmapInit => !self.pmap_initialized,
            BootStep::Kmeminit => self.malloc.is_none(),
            BootStep::PagerInit => self.pager.is_none(),
            BootStep::PoolInit => {
                self.pools.is_none() && self.map.as_ref().is_none_or(|m| m.entry_pool().is_none())
            }
            BootStep::KmemInit => self.kmem.is_none(),
            BootStep::LockObjInit => self.mutex_obj.is_none() && self.rw_obj.is_none(),
            BootStep::LoanInit => self.loan.is_none(),
            BootStep::EmapInit => self.emap.is_none(),
            BootStep::KernelPageable => {
                !self.kernel_pageable
                    && self
                        .kernel
                        .as_ref()
                        .is_none_or(|k| k.kernel_object.swhash_nbuckets() == 0)
            }
            BootStep::PdPolicyReinit => {
                !self.pdpol_live && self.pdpol.as_ref().is_none_or(PdPolicy::is_provisional)
            }
            BootStep::AnonUareaInit => self.anon.is_none() && self.uarea.is_none(),
            BootStep::ReadAheadInit => self.ra.is_none(),
        }
    }

    /// 整个单例是否处于清零状态
    pub fn is_zeroed(&self) -> bool {
        BootStep::ALL.iter().all(|&s| self.pristine_for(s))
    }

    pub fn kernel_object(&self) -> Option<&UvmObject> {
        self.kernel.as_ref().map(|k| &k.kernel_object)
    }

    pub fn kernel_map(&self) -> Option<&VmMap> {
        self.kernel.as_ref().map(|k| &k.kernel_map)
    }

    pub fn page_stats(&self) -> Option<PageStats> {
        self.page.as_ref().map(PageSys::stats)
    }

    pub fn pmap_initialized(&self) -> bool {
        self.pmap_initialized
    }

    pub fn kernel_pageable(&self) -> bool {
        self.kernel_pageable
    }

    pub fn kentry_free(&self) -> Option<usize> {
        self.map.as_ref().map(MapSys::kentry_free)
    }

    pub fn ra_initialized(&self) -> bool {
        self.ra.is_some()
    }

    pub fn pools(&self) -> Option<&PoolSys> {
        self.pools.as_ref()
    }

    pub fn pager(&self) -> Option<&PagerSys> {
        self.pager.as_ref()
    }

    pub fn malloc(&self) -> Option<&MallocSys> {
        self.malloc.as_ref()
    }

    pub(crate) fn split<'a>(&'a mut self, pmap: &'a mut dyn Pmap) -> UvmResult<Parts<'a>> {
        let UvmCore {
            page,
            map,
            kernel,
            malloc,
            pager,
            kmem,
            mutex_obj,
            rw_obj,
            loan,
            emap,
            kernel_pageable,
            anon,
            uarea,
            ra,
            ..
        } = self;
        let pages = ready(page.as_ref(), "page allocator")?;
        let mapsys = ready(map.as_mut(), "map entries")?;
        let KernelSpace {
            kernel_map,
            kernel_object,
        } = ready(kernel.as_mut(), "kernel map")?;
        Ok(Parts {
            kernel_map,
            ctx: KmCtx {
                pages,
                pmap,
                mapsys,
                kobj: kernel_object,
                kernel_pageable: *kernel_pageable,
            },
            malloc: malloc.as_mut(),
            pager: pager.as_mut(),
            kmem: kmem.as_mut(),
            mutex_obj: mutex_obj.as_mut(),
            rw_obj: rw_obj.as_mut(),
            loan: loan.as_mut(),
            emap: emap.as_mut(),
            anon: anon.as_mut(),
            uarea: uarea.as_mut(),
            ra: ra.as_mut(),
        })
    }
}

/// 机器相关的输入加上 VM 单例
pub struct Uvm {
    exp: UvmExp,
    physmem: PhysMem,
    pmap: Option<Box<dyn Pmap>>,
    pub(crate) core: UvmCore,
    booted: bool,
}

impl Default for Uvm {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// 进程唯一的 VM 实例
    pub static ref UVM: UPSafeCell<Uvm> = unsafe { UPSafeCell::new(Uvm::new()) };
}

/// 内核主初始化流程调用一次。任何失败（包括第二次调用）都直接 panic。
pub fn uvm_init() {
    let result = UVM.exclusive_access().bootstrap();
    if let Err(e) = result {
        panic!("uvm_init: {}", e);
    }
}

fn run_step<T>(
    obs: &mut dyn BootObserver,
    core: &mut UvmCore,
    step: BootStep,
    f: impl FnOnce(&mut UvmCore) -> UvmResult<T>,
) -> UvmResult<T> {
    info!("[uvm] step {}: {}", step.number(), step.name());
    obs.before(step, core);
    let out = f(core)?;
    obs.after(step, core);
    Ok(out)
}

impl Uvm {
    pub fn new() -> Self {
        Self {
            exp: UvmExp::default(),
            physmem: PhysMem::new(),
            pmap: None,
            core: UvmCore::default(),
            booted: false,
        }
    }

    pub fn uvm_setpagesize(&mut self, size: usize) {
        self.exp.uvm_setpagesize(size);
    }

    pub fn uvm_page_physload(
        &mut self,
        start: usize,
        end: usize,
        avail_start: usize,
        avail_end: usize,
        free_list: usize,
    ) -> UvmResult<()> {
        self.physmem
            .uvm_page_physload(start, end, avail_start, avail_end, free_list)
    }

    pub fn attach_pmap(&mut self, pmap: Box<dyn Pmap>) {
        self.pmap = Some(pmap);
    }

    pub fn exp(&self) -> &UvmExp {
        &self.exp
    }

    pub fn core(&self) -> &UvmCore {
        &self.core
    }

    pub fn pmap(&self) -> Option<&dyn Pmap> {
        self.pmap.as_deref()
    }

    pub fn is_booted(&self) -> bool {
        self.booted
    }

    pub fn bootstrap(&mut self) -> UvmResult<()> {
        self.bootstrap_observed(&mut Quiet)
    }

    /// 执行全部启动步骤。只能成功地开始一次：第 0 步通过之后，即使后面
    /// 某一步失败，再次调用也只会得到 [`UvmError::AlreadyInitialized`]。
    pub fn bootstrap_observed(&mut self, obs: &mut dyn BootObserver) -> UvmResult<()> {
        if self.booted {
            return Err(UvmError::AlreadyInitialized);
        }
        let Uvm {
            exp,
            physmem,
            pmap,
            core,
            booted,
        } = self;

        // step 0: 机器相关代码必须已经设置了页大小
        let (t, g) = run_step(obs, core, BootStep::CheckPageSize, |_| {
            stage::check_pagesize(exp)
        })?;
        *booted = true;
        let pmap: &mut dyn Pmap = pmap.as_deref_mut().ok_or(UvmError::NoPmap)?;

        let t = run_step(obs, core, BootStep::Zero, |core| Ok(stage::zero_core(t, core)))?;

        let (kva, t) = run_step(obs, core, BootStep::PageInit, |core| {
            let (pages, kva, t) = uvm_page_init(exp, physmem, &mut *pmap, g, t)?;
            core.page = Some(pages);
            core.pdpol = Some(uvmpdpol_init());
            Ok((kva, t))
        })?;

        let t = run_step(obs, core, BootStep::MapInit, |core| {
            let (mapsys, t) = uvm_map_init(t);
            core.map = Some(mapsys);
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::KmInit, |core| {
            let pages = ready(core.page.as_ref(), "page allocator")?;
            let mapsys = ready(core.map.as_mut(), "map entries")?;
            let (kernel, t) = uvm_km_init(kva, mapsys, pages, &mut *pmap, t)?;
            core.kernel = Some(kernel);
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::PmapInit, |core| {
            let npages = exp.npages;
            let size = g.round(pmap.init_size(npages));
            let mem = if size > 0 {
                let mut p = core.split(&mut *pmap)?;
                uvm_km_alloc(p.kernel_map, &mut p.ctx, size, 0, KmFlags::WIRED | KmFlags::ZERO)?
            } else {
                VirtAddr(0)
            };
            let ctx = PmapInitCtx {
                geom: g,
                npages,
                mem,
                size,
            };
            let t = stage::pmap_init(t, &mut *pmap, &ctx)?;
            core.pmap_initialized = true;
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::Kmeminit, |core| {
            let npages = exp.npages;
            let mut p = core.split(&mut *pmap)?;
            let (malloc, t) = kmeminit(npages, p.kernel_map, &mut p.ctx, t)?;
            core.malloc = Some(malloc);
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::PagerInit, |core| {
            let mut p = core.split(&mut *pmap)?;
            let (pager, t) = uvm_pager_init(p.kernel_map, &mut p.ctx, t)?;
            core.pager = Some(pager);
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::PoolInit, |core| {
            let mapsys = ready(core.map.as_mut(), "map entries")?;
            let (pools, t) = pool_subsystem_init(mapsys, g.size, t)?;
            core.pools = Some(pools);
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::KmemInit, |core| {
            let pools = ready(core.pools.as_mut(), "pools")?;
            let (kmem, t) = kmem_init(g.size, pools, t)?;
            core.kmem = Some(kmem);
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::LockObjInit, |core| {
            let mutex_obj = mutex_obj_init(&t);
            let (rw_obj, t) = rw_obj_init(t);
            core.mutex_obj = Some(mutex_obj);
            core.rw_obj = Some(rw_obj);
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::LoanInit, |core| {
            let mut p = core.split(&mut *pmap)?;
            let mutex_obj = ready(p.mutex_obj, "mutex objects")?;
            let kmem = ready(p.kmem, "kmem")?;
            let (loan, t) = uvm_loan_init(mutex_obj, kmem, p.kernel_map, &mut p.ctx, t)?;
            core.loan = Some(loan);
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::EmapInit, |core| {
            let mut p = core.split(&mut *pmap)?;
            let (emap, t) = uvm_emap_sysinit(p.kernel_map, &mut p.ctx, t)?;
            core.emap = Some(emap);
            Ok(t)
        })?;

        // 内核对象的交换哈希要用 kmem 分配，所以内核可换出只能从这里开始
        let t = run_step(obs, core, BootStep::KernelPageable, |core| {
            let t = {
                let mut p = core.split(&mut *pmap)?;
                let kmem = ready(p.kmem, "kmem")?;
                let nbuckets = swhash_buckets(p.ctx.kobj.size());
                let size = nbuckets * size_of::<usize>();
                let va = kmem.kmem_zalloc(p.kernel_map, &mut p.ctx, size)?;
                let storage = SwHashStorage { va, size };
                let (t, old) = stage::enable_kernel_pageable(t, p.ctx.kobj, nbuckets, storage);
                if let Some(old) = old {
                    kmem.kmem_free(p.kernel_map, &mut p.ctx, old.va, old.size)?;
                }
                t
            };
            core.kernel_pageable = true;
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::PdPolicyReinit, |core| {
            let stats = ready(core.page_stats(), "page allocator")?;
            let pdpol = ready(core.pdpol.as_mut(), "pdpolicy")?;
            let t = uvmpdpol_reinit(pdpol, exp, stats, t);
            core.pdpol_live = true;
            Ok(t)
        })?;

        let t = run_step(obs, core, BootStep::AnonUareaInit, |core| {
            let pools = ready(core.pools.as_mut(), "pools")?;
            let anon = uvm_anon_init(pools, g.size, &t)?;
            let (uarea, t) = uvm_uarea_init(pools, g.size, t)?;
            core.anon = Some(anon);
            core.uarea = Some(uarea);
            Ok(t)
        })?;

        run_step(obs, core, BootStep::ReadAheadInit, |core| {
            let pools = ready(core.pools.as_mut(), "pools")?;
            core.ra = Some(uvm_ra_init(pools, g.size, t)?);
            Ok(())
        })?;

        info!(
            "[uvm] initialized: {} page(s) of {:#x} byte(s), {} free",
            exp.npages,
            g.size,
            core.page_stats().map_or(0, |s| s.free)
        );
        Ok(())
    }

    fn parts(&mut self) -> UvmResult<Parts<'_>> {
        let pmap = self.pmap.as_deref_mut().ok_or(UvmError::NoPmap)?;
        self.core.split(pmap)
    }

    pub fn page_stats(&self) -> PageStats {
        self.core.page_stats().unwrap_or_default()
    }

    pub fn uvm_pagealloc(&self, flags: PgaFlags) -> Option<PageId> {
        self.core.page.as_ref()?.alloc(None, 0, flags)
    }

    pub fn uvm_pagealloc_owned(&self, owner: PageOwner, flags: PgaFlags) -> Option<PageId> {
        self.core.page.as_ref()?.alloc(Some(owner), 0, flags)
    }

    /// 释放一个页；页号越界时报 `BadFree`，重复释放仍然是致命错误
    pub fn uvm_pagefree(&self, id: PageId) -> UvmResult<()> {
        let pages = ready(self.core.page.as_ref(), "page allocator")?;
        if !pages.contains(id) {
            return Err(UvmError::BadFree);
        }
        pages.free(id);
        Ok(())
    }

    /// page daemon 是否应当醒来
    pub fn needs_scan(&self) -> bool {
        match (&self.core.pdpol, &self.core.page) {
            (Some(pdpol), Some(pages)) => pdpol.needs_scan(&self.exp, pages.stats()),
            _ => false,
        }
    }

    pub fn km_alloc(&mut self, size: usize, flags: KmFlags) -> UvmResult<VirtAddr> {
        let mut p = self.parts()?;
        uvm_km_alloc(p.kernel_map, &mut p.ctx, size, 0, flags)
    }

    pub fn km_free(&mut self, va: VirtAddr, size: usize) -> UvmResult<()> {
        let mut p = self.parts()?;
        uvm_km_free(p.kernel_map, &mut p.ctx, va, size)
    }

    pub fn malloc(&mut self, size: usize, mtype: &'static str) -> UvmResult<VirtAddr> {
        let mut p = self.parts()?;
        ready(p.malloc, "malloc")?.malloc(&mut p.ctx, size, mtype)
    }

    pub fn free(&mut self, va: VirtAddr, mtype: &'static str) -> UvmResult<()> {
        let mut p = self.parts()?;
        ready(p.malloc, "malloc")?.free(&mut p.ctx, va, mtype)
    }

    pub fn kmem_alloc(&mut self, size: usize) -> UvmResult<VirtAddr> {
        let mut p = self.parts()?;
        ready(p.kmem, "kmem")?.kmem_alloc(p.kernel_map, &mut p.ctx, size)
    }

    pub fn kmem_zalloc(&mut self, size: usize) -> UvmResult<VirtAddr> {
        let mut p = self.parts()?;
        ready(p.kmem, "kmem")?.kmem_zalloc(p.kernel_map, &mut p.ctx, size)
    }

    pub fn kmem_free(&mut self, va: VirtAddr, size: usize) -> UvmResult<()> {
        let mut p = self.parts()?;
        ready(p.kmem, "kmem")?.kmem_free(p.kernel_map, &mut p.ctx, va, size)
    }

    pub fn pagermapin(&mut self, pages: &[PageId]) -> UvmResult<VirtAddr> {
        let mut p = self.parts()?;
        for &id in pages {
            p.ctx.pages.check(id)?;
        }
        ready(p.pager, "pager")?.pagermapin(&mut p.ctx, pages)
    }

    pub fn pagermapout(&mut self, va: VirtAddr, npages: usize) -> UvmResult<()> {
        let mut p = self.parts()?;
        ready(p.pager, "pager")?.pagermapout(&mut p.ctx, va, npages)
    }

    pub fn swap_add(&self, nslots: u32) -> UvmResult<u32> {
        ready(self.core.pager.as_ref(), "pager")?.swap_add(nslots)
    }

    pub fn mutex_obj_alloc(&mut self) -> UvmResult<LockObjId> {
        let mut p = self.parts()?;
        let kmem = ready(p.kmem, "kmem")?;
        ready(p.mutex_obj, "mutex objects")?.alloc(kmem, p.kernel_map, &mut p.ctx)
    }

    pub fn mutex_obj_hold(&mut self, id: LockObjId) -> UvmResult<()> {
        ready(self.core.mutex_obj.as_mut(), "mutex objects")?.hold(id)
    }

    pub fn mutex_obj_free(&mut self, id: LockObjId) -> UvmResult<bool> {
        let mut p = self.parts()?;
        let kmem = ready(p.kmem, "kmem")?;
        ready(p.mutex_obj, "mutex objects")?.free(kmem, p.kernel_map, &mut p.ctx, id)
    }

    pub fn mutex_obj(&self, id: LockObjId) -> Option<&spin::Mutex<()>> {
        self.core.mutex_obj.as_ref()?.mutex(id)
    }

    pub fn rw_obj_alloc(&mut self) -> UvmResult<LockObjId> {
        let mut p = self.parts()?;
        let kmem = ready(p.kmem, "kmem")?;
        ready(p.rw_obj, "rw objects")?.alloc(kmem, p.kernel_map, &mut p.ctx)
    }

    pub fn rw_obj_free(&mut self, id: LockObjId) -> UvmResult<bool> {
        let mut p = self.parts()?;
        let kmem = ready(p.kmem, "kmem")?;
        ready(p.rw_obj, "rw objects")?.free(kmem, p.kernel_map, &mut p.ctx, id)
    }

    pub fn loan(&mut self, pages: &[PageId]) -> UvmResult<()> {
        let pg = ready(self.core.page.as_ref(), "page allocator")?;
        ready(self.core.loan.as_mut(), "loan")?.loan(pg, pages)
    }

    pub fn unloan(&mut self, pages: &[PageId]) -> UvmResult<()> {
        let pg = ready(self.core.page.as_ref(), "page allocator")?;
        ready(self.core.loan.as_mut(), "loan")?.unloan(pg, pages)
    }

    pub fn loan_zero(&mut self) -> UvmResult<PageId> {
        let pg = ready(self.core.page.as_ref(), "page allocator")?;
        ready(self.core.loan.as_mut(), "loan")?.loan_zero(pg)
    }

    pub fn emap_alloc(&mut self, size: usize) -> UvmResult<VirtAddr> {
        ready(self.core.emap.as_mut(), "emap")?.alloc(size)
    }

    pub fn emap_free(&mut self, va: VirtAddr, size: usize) -> UvmResult<()> {
        ready(self.core.emap.as_mut(), "emap")?.free(va, size)
    }

    pub fn emap_enter(&mut self, va: VirtAddr, pages: &[PageId]) -> UvmResult<()> {
        let p = self.parts()?;
        let emap = ready(p.emap, "emap")?;
        for &id in pages {
            p.ctx.pages.check(id)?;
        }
        let pas: alloc::vec::Vec<_> = pages.iter().map(|&id| p.ctx.pages.phys_addr(id)).collect();
        emap.enter(p.ctx.pmap, va, &pas, VmProt::READ)
    }

    pub fn emap_remove(&mut self, va: VirtAddr, size: usize) -> UvmResult<()> {
        let p = self.parts()?;
        ready(p.emap, "emap")?.remove(p.ctx.pmap, va, size)
    }

    /// 产生一个新的 emap 代号；emap 未初始化时返回 0
    pub fn emap_produce(&mut self) -> u32 {
        self.core.emap.as_mut().map_or(0, EmapSys::produce)
    }

    pub fn emap_consume(&mut self, cpu: usize, gen: u32) -> bool {
        let (Some(emap), Some(pmap)) = (self.core.emap.as_mut(), self.pmap.as_deref_mut()) else {
            return false;
        };
        cpu < MAXCPUS && emap.consume(pmap, cpu, gen)
    }

    pub fn analloc(&mut self) -> UvmResult<AnonId> {
        let p = self.parts()?;
        ready(p.anon, "anon")?.analloc(p.ctx.pages, p.ctx.pmap)
    }

    pub fn anref(&mut self, id: AnonId) -> UvmResult<()> {
        ready(self.core.anon.as_mut(), "anon")?.anref(id)
    }

    pub fn anfree(&mut self, id: AnonId) -> UvmResult<bool> {
        let pg = ready(self.core.page.as_ref(), "page allocator")?;
        ready(self.core.anon.as_mut(), "anon")?.anfree(pg, id)
    }

    pub fn anon_pagealloc(&mut self, id: AnonId) -> UvmResult<PageId> {
        let pg = ready(self.core.page.as_ref(), "page allocator")?;
        ready(self.core.anon.as_mut(), "anon")?.pagealloc(pg, id)
    }

    pub fn uarea_alloc(&mut self) -> UvmResult<VirtAddr> {
        let mut p = self.parts()?;
        ready(p.uarea, "uarea")?.uarea_alloc(p.kernel_map, &mut p.ctx)
    }

    pub fn uarea_free(&mut self, va: VirtAddr) -> UvmResult<()> {
        ready(self.core.uarea.as_mut(), "uarea")?.uarea_free(va)
    }

    pub fn ra_allocctx(&mut self) -> UvmResult<RaCtxId> {
        let p = self.parts()?;
        ready(p.ra, "read-ahead")?.allocctx(p.ctx.pages, p.ctx.pmap)
    }

    pub fn ra_freectx(&mut self, id: RaCtxId) -> UvmResult<()> {
        ready(self.core.ra.as_mut(), "read-ahead")?.freectx(id)
    }

    pub fn ra_request(&mut self, id: RaCtxId, advice: Advice, off: usize, size: usize) -> Option<(usize, usize)> {
        self.core.ra.as_mut()?.request(id, advice, off, size)
    }

    #[cfg(test)]
    pub(crate) fn km_ctx(&mut self) -> KmCtx<'_> {
        self.parts().unwrap().ctx
    }

    #[cfg(test)]
    pub(crate) fn kernel_map_ctx(&mut self) -> (&mut VmMap, KmCtx<'_>) {
        let p = self.parts().unwrap();
        (p.kernel_map, p.ctx)
    }

    #[cfg(test)]
    pub(crate) fn malloc_ctx(&mut self) -> (&mut MallocSys, KmCtx<'_>) {
        let p = self.parts().unwrap();
        (p.malloc.unwrap(), p.ctx)
    }

    #[cfg(test)]
    pub(crate) fn kmem_ctx(&mut self) -> (&mut Kmem, &mut VmMap, KmCtx<'_>) {
        let p = self.parts().unwrap();
        (p.kmem.unwrap(), p.kernel_map, p.ctx)
    }
}

/// 按给定页大小模拟一台机器：2 MiB 内核镜像后面跟着 `mib` MiB 内存
#[cfg(test)]
pub(crate) fn test_uvm(pagesize: usize, mib: usize) -> Uvm {
    use crate::config::VM_FREELIST_DEFAULT;
    use crate::mm::address::{PageGeometry, PhysAddr};
    use crate::pmap::soft::SoftPmap;

    let g = PageGeometry::new(pagesize).unwrap();
    let image = 2 << 20;
    let base = 0x8000_0000;
    let mut uvm = Uvm::new();
    uvm.uvm_setpagesize(pagesize);
    let start = g.atop(base + image);
    let end = g.atop(base + (mib << 20));
    uvm.uvm_page_physload(start, end, start, end, VM_FREELIST_DEFAULT)
        .unwrap();
    uvm.attach_pmap(Box::new(SoftPmap::bootstrap(g, PhysAddr(base), image)));
    uvm.bootstrap().unwrap();
    uvm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_starts_zeroed() {
        assert!(UvmCore::default().is_zeroed());
    }

    #[test]
    fn booted_core_is_complete() {
        let uvm = test_uvm(4096, 16);
        let core = uvm.core();
        assert!(!core.is_zeroed());
        assert!(core.pmap_initialized());
        assert!(core.kernel_pageable());
        assert!(core.ra_initialized());
        assert_eq!(
            core.kernel_object().unwrap().swhash_nbuckets(),
            crate::config::UAO_SWHASH_MAXBUCKETS
        );
        let kobj = core.kernel_object().unwrap();
        assert_eq!(kobj.id(), crate::mm::ObjId::KERNEL);
        assert_eq!(kobj.kind(), crate::mm::object::PagerKind::Aobj);
        let storage = kobj.swhash_storage().unwrap();
        assert_eq!(storage.size, crate::config::UAO_SWHASH_MAXBUCKETS * size_of::<usize>());
        assert!(uvm.pmap().unwrap().extract(storage.va).is_some());
        let pager_map = core.pager().unwrap().pager_map();
        assert_eq!(pager_map.max().0 - pager_map.min().0, crate::config::PAGER_MAP_SIZE);
        let names: alloc::vec::Vec<_> = core.pools().unwrap().pools().iter().map(|p| p.0).collect();
        assert_eq!(names[0], "vmmpepl");
        assert!(names.contains(&"anonpl"));
        assert_eq!(names.last(), Some(&"uvmractx"));
    }

    #[test]
    fn step_numbers_follow_declaration_order() {
        for (i, s) in BootStep::ALL.iter().enumerate() {
            assert_eq!(s.number(), i);
        }
        assert_eq!(BootStep::ReadAheadInit.number(), 16);
    }
}
