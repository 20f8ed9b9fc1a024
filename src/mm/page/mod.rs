//! 物理页分配器
//!
//! [`uvm_page_init`] 根据机器相关代码登记的物理段建立页帧数据库和空闲页
//! 队列，并把一段现在可以自由映射的内核虚拟地址区间交给上层。

mod physmem;
mod queue;

pub use physmem::{PhysMem, PhysSeg};
pub use queue::{FrameAllocator, FreeQueues, PageQueues, StackFrameAllocator};

use super::address::{PageGeometry, PhysAddr, VirtAddr};
use super::anon::AnonId;
use super::exp::UvmExp;
use super::map::VmProt;
use super::object::ObjId;
use super::stage::{Advance, PagesUp, Zeroed};
use crate::config::{RESERVE_KERNEL, RESERVE_PAGEDAEMON, VM_NFREELIST};
use crate::error::{UvmError, UvmResult};
use crate::pmap::Pmap;
use alloc::vec::Vec;
use log::{debug, info};
use spin::Mutex;

bitflags! {
    /// 页本身的状态位，由属主对象的锁保护
    pub struct PageFlags: u16 {
        const BUSY = 1 << 0;
        const WANTED = 1 << 1;
        const TABLED = 1 << 2;
        const CLEAN = 1 << 3;
        const FAKE = 1 << 4;
        const RELEASED = 1 << 5;
        const ZERO = 1 << 6;
        const RDONLY = 1 << 7;
    }
}

bitflags! {
    /// 页在分页队列上的状态，由 page-queue 锁保护
    pub struct PqFlags: u8 {
        const FREE = 1 << 0;
        const ACTIVE = 1 << 1;
        const INACTIVE = 1 << 2;
        const ANON = 1 << 3;
        const AOBJ = 1 << 4;
    }
}

bitflags! {
    /// uvm_pagealloc 的选项
    pub struct PgaFlags: u8 {
        /// 允许动用内核保留页
        const USERESERVE = 1 << 0;
        /// 需要清零的页
        const ZERO = 1 << 1;
        /// page daemon 自己的请求，可以用到最后的保留页
        const PAGEDAEMON = 1 << 2;
    }
}

/// 页帧数据库中的下标
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub usize);

/// 页的属主
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageOwner {
    Object(ObjId),
    Anon(AnonId),
}

/// 页帧数据库中的一条记录
#[derive(Clone, Debug)]
pub struct VmPage {
    pub phys_addr: PhysAddr,
    pub flags: PageFlags,
    pub pqflags: PqFlags,
    pub owner: Option<PageOwner>,
    pub offset: usize,
    pub wire_count: u32,
    pub loan_count: u32,
    pub free_list: usize,
}

impl VmPage {
    fn new(phys_addr: PhysAddr, free_list: usize) -> Self {
        Self {
            phys_addr,
            flags: PageFlags::empty(),
            pqflags: PqFlags::FREE,
            owner: None,
            offset: 0,
            wire_count: 0,
            loan_count: 0,
            free_list,
        }
    }
}

/// 页分配器交给内核地图的虚拟地址区间。
///
/// 不实现 `Clone`：它只能被 `uvm_km_init` 按值消耗一次。
#[derive(Debug)]
pub struct KernelVaRange {
    start: VirtAddr,
    end: VirtAddr,
}

impl KernelVaRange {
    pub fn into_bounds(self) -> (VirtAddr, VirtAddr) {
        (self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy)]
struct ManagedSeg {
    pfn_start: usize,
    pfn_end: usize,
    first: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
    pub npages: usize,
    pub free: usize,
    pub active: usize,
    pub inactive: usize,
    pub wired: usize,
}

/// 页分配器子系统
pub struct PageSys {
    geom: PageGeometry,
    segs: Vec<ManagedSeg>,
    npages: usize,
    reserve_kernel: usize,
    reserve_pagedaemon: usize,
    /// uvm_pageqlock
    pageq: Mutex<PageQueues>,
    /// uvm_fpageqlock，空闲链表的快路径单独加锁
    fpageq: Mutex<FreeQueues>,
}

/// 建立页帧数据库，返回可供内核地图使用的虚拟地址区间
pub fn uvm_page_init(
    exp: &mut UvmExp,
    physmem: &mut PhysMem,
    pmap: &mut dyn Pmap,
    geom: PageGeometry,
    t: Zeroed,
) -> UvmResult<(PageSys, KernelVaRange, PagesUp)> {
    let freepages = physmem.avail_pages();
    if freepages == 0 {
        return Err(UvmError::NoMemoryFound);
    }

    // 页帧数据库本身也要占用物理内存，按比例扣除
    let recsize = core::mem::size_of::<VmPage>();
    let pagecount = (geom.size * freepages) / (geom.size + recsize);
    let npgs = geom.atop(geom.round(pagecount * recsize)).max(1);
    let pfn = physmem.steal(npgs)?;

    let (vstart, vend) = pmap.virtual_space();
    for i in 0..npgs {
        pmap.kenter_pa(
            vstart.offset(geom.ptoa(i)),
            PhysAddr(geom.ptoa(pfn + i)),
            VmProt::READ | VmProt::WRITE,
        );
    }
    pmap.update();
    debug!(
        "[uvm] page array: {} page(s) stolen at {:?}, mapped at {:?}",
        npgs,
        PhysAddr(geom.ptoa(pfn)),
        vstart
    );

    if physmem.avail_pages() == 0 {
        return Err(UvmError::NoMemoryFound);
    }

    let mut pages = Vec::with_capacity(physmem.avail_pages());
    let mut free = FreeQueues::new();
    let mut segs = Vec::new();
    for seg in physmem.segs() {
        if seg.avail_pages() == 0 {
            continue;
        }
        let first = pages.len();
        for pfn in seg.avail_start..seg.avail_end {
            pages.push(VmPage::new(PhysAddr(geom.ptoa(pfn)), seg.free_list));
        }
        free.add_segment(seg.free_list, first, pages.len());
        segs.push(ManagedSeg {
            pfn_start: seg.avail_start,
            pfn_end: seg.avail_end,
            first,
        });
    }
    let npages = pages.len();
    for list in 0..VM_NFREELIST {
        let n = free.nfree_list(list);
        if n > 0 {
            debug!("[uvm] free list {}: {} page(s)", list, n);
        }
    }

    exp.npages = npages;
    exp.free = npages;
    exp.reserve_pagedaemon = RESERVE_PAGEDAEMON;
    exp.reserve_kernel = RESERVE_KERNEL;

    // 把偷取之后剩下的虚拟空间交给上层
    let kva = KernelVaRange {
        start: VirtAddr(geom.round(vstart.0 + geom.ptoa(npgs))),
        end: VirtAddr(geom.trunc(vend.0)),
    };
    if kva.start >= kva.end {
        return Err(UvmError::EmptyKernelRange);
    }
    for (s, e) in pmap.early_claims() {
        if kva.start < e && s < kva.end {
            return Err(UvmError::KernelRangeOverlap);
        }
    }

    info!(
        "[uvm] {} page(s) managed in {} segment(s), kva [{:?}, {:?})",
        npages,
        segs.len(),
        kva.start,
        kva.end
    );

    let sys = PageSys {
        geom,
        segs,
        npages,
        reserve_kernel: exp.reserve_kernel,
        reserve_pagedaemon: exp.reserve_pagedaemon,
        pageq: Mutex::new(PageQueues::new(pages)),
        fpageq: Mutex::new(free),
    };
    let t = t.advance(&sys);
    Ok((sys, kva, t))
}

impl PageSys {
    pub fn geometry(&self) -> PageGeometry {
        self.geom
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    /// 分配一个物理页。空闲页降到内核保留量时只有带 `USERESERVE` 的请求能成功，
    /// 降到 page daemon 保留量时只有带 `PAGEDAEMON` 的请求能成功。
    pub fn alloc(&self, owner: Option<PageOwner>, offset: usize, flags: PgaFlags) -> Option<PageId> {
        let id = {
            let mut fq = self.fpageq.lock();
            let nfree = fq.nfree();
            let daemon = flags.contains(PgaFlags::PAGEDAEMON);
            if nfree <= self.reserve_kernel && !daemon && !flags.contains(PgaFlags::USERESERVE) {
                return None;
            }
            if nfree <= self.reserve_pagedaemon && !daemon {
                return None;
            }
            fq.alloc()?
        };
        let mut q = self.pageq.lock();
        let pg = &mut q.pages[id.0];
        assert!(pg.pqflags.contains(PqFlags::FREE), "{:?} on free list but not free", id);
        pg.pqflags = PqFlags::empty();
        match owner {
            Some(PageOwner::Anon(_)) => pg.pqflags.insert(PqFlags::ANON),
            Some(PageOwner::Object(_)) => pg.pqflags.insert(PqFlags::AOBJ),
            None => {}
        }
        pg.owner = owner;
        pg.offset = offset;
        pg.flags = PageFlags::CLEAN;
        if flags.contains(PgaFlags::ZERO) {
            pg.flags.insert(PageFlags::ZERO);
        }
        Some(id)
    }

    /// 释放一个页。被出借的页只断开属主，等最后一个借用者归还时再释放。
    pub fn free(&self, id: PageId) {
        {
            let mut q = self.pageq.lock();
            assert!(
                !q.pages[id.0].pqflags.contains(PqFlags::FREE),
                "{:?} freed twice",
                id
            );
            q.dequeue(id);
            let pg = &mut q.pages[id.0];
            if pg.loan_count > 0 {
                pg.owner = None;
                pg.pqflags.remove(PqFlags::AOBJ);
                return;
            }
            let was_wired = pg.wire_count > 0;
            pg.wire_count = 0;
            pg.owner = None;
            pg.offset = 0;
            pg.flags = PageFlags::empty();
            pg.pqflags = PqFlags::FREE;
            if was_wired {
                q.nwired -= 1;
            }
        }
        self.fpageq.lock().dealloc(id);
    }

    /// 页号是否落在页帧数据库里
    pub fn contains(&self, id: PageId) -> bool {
        id.0 < self.pageq.lock().pages.len()
    }

    /// `id` 必须是一个已分配的页
    pub fn check(&self, id: PageId) -> UvmResult<()> {
        match self.pageq.lock().pages.get(id.0) {
            Some(pg) if !pg.pqflags.contains(PqFlags::FREE) => Ok(()),
            _ => Err(UvmError::BadPage),
        }
    }

    pub fn wire(&self, id: PageId) -> UvmResult<()> {
        let mut q = self.pageq.lock();
        let first = match q.pages.get(id.0) {
            Some(pg) if !pg.pqflags.contains(PqFlags::FREE) => pg.wire_count == 0,
            _ => return Err(UvmError::BadPage),
        };
        if first {
            q.dequeue(id);
            q.nwired += 1;
        }
        q.pages[id.0].wire_count += 1;
        Ok(())
    }

    pub fn unwire(&self, id: PageId) -> UvmResult<()> {
        let mut q = self.pageq.lock();
        let pg = match q.pages.get_mut(id.0) {
            Some(pg) if pg.wire_count > 0 => pg,
            _ => return Err(UvmError::BadPage),
        };
        pg.wire_count -= 1;
        if pg.wire_count == 0 {
            pg.pqflags.insert(PqFlags::ACTIVE);
            q.nwired -= 1;
            q.active.push_back(id);
        }
        Ok(())
    }

    pub fn activate(&self, id: PageId) {
        let mut q = self.pageq.lock();
        let pg = &q.pages[id.0];
        if pg.wire_count > 0 || pg.pqflags.contains(PqFlags::ACTIVE) {
            return;
        }
        q.dequeue(id);
        q.pages[id.0].pqflags.insert(PqFlags::ACTIVE);
        q.active.push_back(id);
    }

    pub fn deactivate(&self, id: PageId) {
        let mut q = self.pageq.lock();
        let pg = &q.pages[id.0];
        if pg.wire_count > 0 || pg.pqflags.contains(PqFlags::INACTIVE) {
            return;
        }
        q.dequeue(id);
        q.pages[id.0].pqflags.insert(PqFlags::INACTIVE);
        q.inactive.push_back(id);
    }

    /// 页记录的快照
    pub fn page(&self, id: PageId) -> VmPage {
        self.pageq.lock().pages[id.0].clone()
    }

    /// 在 page-queue 锁下修改页记录
    pub fn with_page<R>(&self, id: PageId, f: impl FnOnce(&mut VmPage) -> R) -> R {
        f(&mut self.pageq.lock().pages[id.0])
    }

    pub fn phys_addr(&self, id: PageId) -> PhysAddr {
        self.pageq.lock().pages[id.0].phys_addr
    }

    /// 物理地址到页记录
    pub fn lookup(&self, pa: PhysAddr) -> Option<PageId> {
        let pfn = self.geom.atop(pa.0);
        self.segs
            .iter()
            .find(|s| s.pfn_start <= pfn && pfn < s.pfn_end)
            .map(|s| PageId(s.first + pfn - s.pfn_start))
    }

    pub fn free_count(&self) -> usize {
        self.fpageq.lock().nfree()
    }

    pub fn stats(&self) -> PageStats {
        let free = self.free_count();
        let q = self.pageq.lock();
        PageStats {
            npages: self.npages,
            free,
            active: q.active.len(),
            inactive: q.inactive.len(),
            wired: q.nwired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::init::test_uvm;

    #[test]
    fn alloc_and_free_update_counts() {
        let uvm = test_uvm(4096, 8);
        let pages = uvm.core.page.as_ref().unwrap();
        let before = pages.free_count();
        let id = pages.alloc(None, 0, PgaFlags::ZERO).unwrap();
        assert_eq!(pages.free_count(), before - 1);
        assert!(pages.page(id).flags.contains(PageFlags::ZERO));
        pages.free(id);
        assert_eq!(pages.free_count(), before);
        assert!(pages.page(id).pqflags.contains(PqFlags::FREE));
    }

    #[test]
    fn queues_track_activation_and_wiring() {
        let uvm = test_uvm(4096, 8);
        let pages = uvm.core.page.as_ref().unwrap();
        let base = pages.stats();
        let id = pages.alloc(None, 0, PgaFlags::empty()).unwrap();
        pages.activate(id);
        assert_eq!(pages.stats().active, base.active + 1);
        pages.deactivate(id);
        assert_eq!(pages.stats().inactive, base.inactive + 1);
        assert_eq!(pages.stats().active, base.active);
        pages.wire(id).unwrap();
        assert_eq!(pages.stats().inactive, base.inactive);
        assert_eq!(pages.stats().wired, base.wired + 1);
        pages.unwire(id).unwrap();
        assert_eq!(pages.stats().wired, base.wired);
        assert_eq!(pages.stats().active, base.active + 1);
        pages.free(id);
        assert_eq!(pages.stats().active, base.active);
    }

    #[test]
    fn lookup_maps_phys_addr_back_to_page() {
        let uvm = test_uvm(4096, 8);
        let pages = uvm.core.page.as_ref().unwrap();
        let id = pages.alloc(None, 0, PgaFlags::empty()).unwrap();
        let pa = pages.phys_addr(id);
        assert_eq!(pages.lookup(pa), Some(id));
        assert_eq!(pages.lookup(PhysAddr(0)), None);
        pages.free(id);
    }

    #[test]
    fn wiring_needs_an_allocated_page() {
        let uvm = test_uvm(4096, 8);
        let pages = uvm.core.page.as_ref().unwrap();
        let id = pages.alloc(None, 0, PgaFlags::empty()).unwrap();
        assert_eq!(pages.unwire(id), Err(UvmError::BadPage));
        assert_eq!(pages.wire(PageId(usize::MAX)), Err(UvmError::BadPage));
        assert!(!pages.contains(PageId(usize::MAX)));
        let wired = pages.stats().wired;
        pages.free(id);
        assert_eq!(pages.check(id), Err(UvmError::BadPage));
        assert_eq!(pages.wire(id), Err(UvmError::BadPage));
        assert_eq!(pages.stats().wired, wired);
    }

    #[test]
    fn reserves_come_from_uvmexp() {
        let uvm = test_uvm(4096, 4);
        let pages = uvm.core.page.as_ref().unwrap();
        let exp = uvm.exp();
        assert_eq!(exp.reserve_kernel, RESERVE_KERNEL);
        assert_eq!(exp.reserve_pagedaemon, RESERVE_PAGEDAEMON);
        while pages.alloc(None, 0, PgaFlags::empty()).is_some() {}
        assert_eq!(pages.free_count(), exp.reserve_kernel);
        while pages.alloc(None, 0, PgaFlags::USERESERVE).is_some() {}
        assert_eq!(pages.free_count(), exp.reserve_pagedaemon);
        while pages.alloc(None, 0, PgaFlags::PAGEDAEMON).is_some() {}
        assert_eq!(pages.free_count(), 0);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_fatal() {
        let uvm = test_uvm(4096, 8);
        let pages = uvm.core.page.as_ref().unwrap();
        let id = pages.alloc(None, 0, PgaFlags::empty()).unwrap();
        pages.free(id);
        pages.free(id);
    }
}
