//! 定长对象池
//!
//! 一个 [`Pool`] 把后端给的页切成等长的项。后端有两种：
//! [`PoolPageBackend`] 用 pmap 直接映射单个物理页，不经过内核地图，
//! 所以 map entry 自己的 pool 也能用它；[`KmBackend`] 从内核地图分配
//! 多页，用于 uarea 这类大对象。

use crate::error::{UvmError, UvmResult};
use crate::mm::address::VirtAddr;
use crate::mm::km::{KmCtx, KmFlags, uvm_km_alloc, uvm_km_free};
use crate::mm::map::{MapSys, VmMap, VmMapEntry};
use crate::mm::page::{PageSys, PgaFlags};
use crate::mm::stage::{Advance, PagersUp, PoolsUp};
use crate::pmap::Pmap;
use alloc::vec::Vec;
use log::{debug, info, trace};

/// pool 的页来源
pub trait PoolBackend {
    fn page_alloc(&mut self, size: usize) -> UvmResult<VirtAddr>;
    fn page_free(&mut self, va: VirtAddr, size: usize);
}

/// 直接映射的单页
pub struct PoolPageBackend<'a> {
    pub pages: &'a PageSys,
    pub pmap: &'a mut dyn Pmap,
}

impl PoolBackend for PoolPageBackend<'_> {
    fn page_alloc(&mut self, size: usize) -> UvmResult<VirtAddr> {
        assert_eq!(size, self.pages.geometry().size);
        let id = self
            .pages
            .alloc(None, 0, PgaFlags::USERESERVE)
            .ok_or(UvmError::OutOfPages)?;
        self.pages.wire(id)?;
        Ok(self.pmap.map_poolpage(self.pages.phys_addr(id)))
    }

    fn page_free(&mut self, va: VirtAddr, _size: usize) {
        let pa = self.pmap.unmap_poolpage(va);
        match self.pages.lookup(pa) {
            Some(id) => self.pages.free(id),
            None => panic!("pool page {:?} has no vm_page", pa),
        }
    }
}

/// 内核地图上的钉住页
pub struct KmBackend<'a, 'b> {
    pub map: &'a mut VmMap,
    pub ctx: &'a mut KmCtx<'b>,
}

impl PoolBackend for KmBackend<'_, '_> {
    fn page_alloc(&mut self, size: usize) -> UvmResult<VirtAddr> {
        uvm_km_alloc(self.map, self.ctx, size, 0, KmFlags::WIRED | KmFlags::CANFAIL)
    }

    fn page_free(&mut self, va: VirtAddr, size: usize) {
        if let Err(e) = uvm_km_free(self.map, self.ctx, va, size) {
            panic!("pool: km page {:?} free failed: {}", va, e);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub nget: usize,
    pub nput: usize,
    pub npagealloc: usize,
    pub npagefree: usize,
    pub nout: usize,
}

struct PoolPage {
    va: VirtAddr,
    free: Vec<u16>,
}

pub struct Pool {
    name: &'static str,
    size: usize,
    pgsize: usize,
    itemsperpage: usize,
    pages: Vec<PoolPage>,
    stats: PoolStats,
}

impl Pool {
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn pgsize(&self) -> usize {
        self.pgsize
    }
    pub fn stats(&self) -> PoolStats {
        self.stats
    }
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    pub fn get(&mut self, backend: &mut dyn PoolBackend) -> UvmResult<VirtAddr> {
        let page = match self.pages.iter().position(|p| !p.free.is_empty()) {
            Some(i) => i,
            None => {
                let va = backend.page_alloc(self.pgsize)?;
                trace!("[pool] {}: new page {:?}", self.name, va);
                self.pages.push(PoolPage {
                    va,
                    free: (0..self.itemsperpage as u16).rev().collect(),
                });
                self.stats.npagealloc += 1;
                self.pages.len() - 1
            }
        };
        let p = &mut self.pages[page];
        let idx = p.free.pop().ok_or(UvmError::OutOfPages)?;
        self.stats.nget += 1;
        self.stats.nout += 1;
        Ok(p.va.offset(idx as usize * self.size))
    }

    pub fn put(&mut self, va: VirtAddr) -> UvmResult<()> {
        let size = self.size;
        let p = self
            .pages
            .iter_mut()
            .find(|p| p.va <= va && va.0 < p.va.0 + self.pgsize)
            .ok_or(UvmError::BadFree)?;
        let delta = va.0 - p.va.0;
        if delta % size != 0 {
            return Err(UvmError::BadFree);
        }
        let idx = (delta / size) as u16;
        if idx as usize >= self.itemsperpage || p.free.contains(&idx) {
            return Err(UvmError::BadFree);
        }
        p.free.push(idx);
        self.stats.nput += 1;
        self.stats.nout -= 1;
        Ok(())
    }

    /// 把完全空闲的页还给后端，返回归还的页数
    pub fn reclaim(&mut self, backend: &mut dyn PoolBackend) -> usize {
        let ipp = self.itemsperpage;
        let mut n = 0;
        self.pages.retain(|p| {
            if p.free.len() == ipp {
                backend.page_free(p.va, self.pgsize);
                n += 1;
                false
            } else {
                true
            }
        });
        self.stats.npagefree += n;
        n
    }
}

/// pool 注册表
#[derive(Debug, Default)]
pub struct PoolSys {
    registry: Vec<(&'static str, usize)>,
}

impl PoolSys {
    /// 已注册的 pool 名称及项大小
    pub fn pools(&self) -> &[(&'static str, usize)] {
        &self.registry
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.registry
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, size)| size)
    }
}

/// 创建一个 pool。项按 `align` 对齐，`pgsize` 至少能放下一项。
pub fn pool_init(
    sys: &mut PoolSys,
    name: &'static str,
    size: usize,
    align: usize,
    pgsize: usize,
) -> UvmResult<Pool> {
    let align = align.max(core::mem::size_of::<usize>());
    let size = size.max(1).div_ceil(align) * align;
    if size > pgsize {
        return Err(UvmError::InvalidSize);
    }
    let itemsperpage = (pgsize / size).min(u16::MAX as usize);
    sys.registry.push((name, size));
    debug!(
        "[pool] {}: {} byte item(s), {} per {:#x} page",
        name, size, itemsperpage, pgsize
    );
    Ok(Pool {
        name,
        size,
        pgsize,
        itemsperpage,
        pages: Vec::new(),
        stats: PoolStats::default(),
    })
}

/// 第 8 步：建立 pool 注册表并创建 map entry 的 pool
pub fn pool_subsystem_init(
    mapsys: &mut MapSys,
    pagesize: usize,
    t: PagersUp,
) -> UvmResult<(PoolSys, PoolsUp)> {
    let mut sys = PoolSys::default();
    let entry_pool = pool_init(
        &mut sys,
        "vmmpepl",
        core::mem::size_of::<VmMapEntry>(),
        0,
        pagesize,
    )?;
    mapsys.install_entry_pool(entry_pool);
    info!("[pool] subsystem up");
    let t = t.advance(&sys);
    Ok((sys, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeSet;

    /// 从一段假想地址空间里切页
    struct FakeBackend {
        next: usize,
        live: BTreeSet<usize>,
    }

    impl PoolBackend for FakeBackend {
        fn page_alloc(&mut self, size: usize) -> UvmResult<VirtAddr> {
            let va = self.next;
            self.next += size;
            self.live.insert(va);
            Ok(VirtAddr(va))
        }
        fn page_free(&mut self, va: VirtAddr, _size: usize) {
            assert!(self.live.remove(&va.0));
        }
    }

    fn backend() -> FakeBackend {
        FakeBackend {
            next: 0x10_0000,
            live: BTreeSet::new(),
        }
    }

    #[test]
    fn items_are_aligned_and_pages_grow_on_demand() {
        let mut sys = PoolSys::default();
        let mut pool = pool_init(&mut sys, "test", 100, 16, 512).unwrap();
        assert_eq!(pool.size(), 112);
        assert_eq!(pool.pgsize(), 512);
        assert_eq!(sys.lookup("test"), Some(112));
        let mut b = backend();
        let items: Vec<_> = (0..5).map(|_| pool.get(&mut b).unwrap()).collect();
        assert_eq!(pool.npages(), 2);
        assert!(items.iter().all(|va| va.0 % 16 == 0));
        assert_eq!(pool.stats().nout, 5);
        for va in items {
            pool.put(va).unwrap();
        }
        assert_eq!(pool.reclaim(&mut b), 2);
        assert!(b.live.is_empty());
    }

    #[test]
    fn bad_puts_are_rejected() {
        let mut sys = PoolSys::default();
        let mut pool = pool_init(&mut sys, "test", 64, 0, 256).unwrap();
        let mut b = backend();
        let va = pool.get(&mut b).unwrap();
        assert_eq!(pool.put(va.offset(8)), Err(UvmError::BadFree));
        assert_eq!(pool.put(VirtAddr(0x42)), Err(UvmError::BadFree));
        pool.put(va).unwrap();
        assert_eq!(pool.put(va), Err(UvmError::BadFree));
    }

    #[test]
    fn oversized_items_are_refused() {
        let mut sys = PoolSys::default();
        assert!(pool_init(&mut sys, "huge", 8192, 0, 4096).is_err());
    }
}
