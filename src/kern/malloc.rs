//! 早期 malloc
//!
//! pmap 初始化之后、kmem 起来之前驱动需要的定长分配器。内存来自内核
//! 地图中一个中断安全的子地图 `kmem_map`，虚拟页由 buddy 分配器管理；
//! 小于一页的请求按 2 的幂分桶，整页以上的请求直接拿整页。

use crate::config::{MINBUCKET, NKMEMPAGES_MAX_BYTES, NKMEMPAGES_MIN_BYTES};
use crate::error::{UvmError, UvmResult};
use crate::mm::address::{PageGeometry, VirtAddr};
use crate::mm::km::{KmCtx, km_back, km_unback, uvm_km_suballoc};
use crate::mm::map::{MapFlags, VmMap};
use crate::mm::stage::{Advance, MallocUp, PmapUp};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use buddy_system_allocator::FrameAllocator;
use log::{info, warn};

/// 一个 2 的幂大小的桶
#[derive(Debug, Default)]
struct Bucket {
    size: usize,
    free: Vec<VirtAddr>,
    calls: usize,
    total: usize,
}

/// 每个 kmem_map 页的用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KmemUsage {
    Bucket(usize),
    Large(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MallocStats {
    pub inuse: usize,
    pub memuse: usize,
    pub calls: usize,
    pub maxused: usize,
}

pub struct MallocSys {
    geom: PageGeometry,
    kmem_map: VmMap,
    arena: FrameAllocator,
    buckets: Vec<Bucket>,
    /// 以虚拟页号为键
    kmemusage: BTreeMap<usize, KmemUsage>,
    types: BTreeMap<&'static str, MallocStats>,
    /// 已分配块的起始地址到类型
    owners: BTreeMap<usize, &'static str>,
}

/// kmem_map 的页数：物理内存的四分之一，夹在上下界之间
pub fn nkmempages(g: PageGeometry, npages: usize) -> usize {
    (npages / 4).clamp(g.atop(NKMEMPAGES_MIN_BYTES), g.atop(NKMEMPAGES_MAX_BYTES))
}

/// 第 6 步
pub fn kmeminit(
    npages: usize,
    kernel_map: &mut VmMap,
    ctx: &mut KmCtx<'_>,
    t: PmapUp,
) -> UvmResult<(MallocSys, MallocUp)> {
    let g = ctx.pages.geometry();
    let n = nkmempages(g, npages);
    let kmem_map = uvm_km_suballoc(kernel_map, ctx, g.ptoa(n), MapFlags::INTRSAFE, "kmem_map")?;
    let mut arena = FrameAllocator::new();
    arena.add_frame(g.atop(kmem_map.min().0), g.atop(kmem_map.max().0));
    let buckets = (MINBUCKET..=g.shift)
        .map(|i| Bucket {
            size: 1 << i,
            ..Bucket::default()
        })
        .collect::<Vec<_>>();
    info!(
        "[malloc] kmem_map {} page(s), {} bucket(s) {}..={}",
        n,
        buckets.len(),
        1usize << MINBUCKET,
        g.size
    );
    let sys = MallocSys {
        geom: g,
        kmem_map,
        arena,
        buckets,
        kmemusage: BTreeMap::new(),
        types: BTreeMap::new(),
        owners: BTreeMap::new(),
    };
    let t = t.advance(&sys);
    Ok((sys, t))
}

impl MallocSys {
    pub fn kmem_map(&self) -> &VmMap {
        &self.kmem_map
    }

    pub fn type_stats(&self, mtype: &str) -> Option<MallocStats> {
        self.types.get(mtype).copied()
    }

    fn bucket_index(&self, size: usize) -> usize {
        let shift = size.next_power_of_two().trailing_zeros() as usize;
        shift.max(MINBUCKET) - MINBUCKET
    }

    fn page_alloc(&mut self, ctx: &mut KmCtx<'_>, npages: usize) -> UvmResult<VirtAddr> {
        let vpn = self.arena.alloc(npages).ok_or(UvmError::NoSpace)?;
        let va = VirtAddr(self.geom.ptoa(vpn));
        if let Err(e) = km_back(ctx, va, self.geom.ptoa(npages), false) {
            self.arena.dealloc(vpn, npages);
            return Err(e);
        }
        Ok(va)
    }

    fn page_free(&mut self, ctx: &mut KmCtx<'_>, va: VirtAddr, npages: usize) {
        km_unback(ctx, va, self.geom.ptoa(npages));
        self.arena.dealloc(self.geom.atop(va.0), npages);
    }

    pub fn malloc(&mut self, ctx: &mut KmCtx<'_>, size: usize, mtype: &'static str) -> UvmResult<VirtAddr> {
        if size == 0 {
            return Err(UvmError::InvalidSize);
        }
        let g = self.geom;
        let (va, allocated) = if size > g.size {
            let npages = g.atop(g.round(size));
            let va = self.page_alloc(ctx, npages)?;
            self.kmemusage.insert(g.atop(va.0), KmemUsage::Large(npages));
            (va, g.ptoa(npages))
        } else {
            let indx = self.bucket_index(size);
            if self.buckets[indx].free.is_empty() {
                let page = self.page_alloc(ctx, 1)?;
                let bsize = self.buckets[indx].size;
                let bucket = &mut self.buckets[indx];
                // 倒序压栈，低地址先分出去
                for i in (0..g.size / bsize).rev() {
                    bucket.free.push(page.offset(i * bsize));
                }
                bucket.total += g.size / bsize;
                self.kmemusage.insert(g.atop(page.0), KmemUsage::Bucket(indx));
            }
            let bucket = &mut self.buckets[indx];
            bucket.calls += 1;
            let va = bucket.free.pop().ok_or(UvmError::OutOfPages)?;
            (va, bucket.size)
        };
        self.owners.insert(va.0, mtype);
        let st = self.types.entry(mtype).or_default();
        st.calls += 1;
        st.inuse += 1;
        st.memuse += allocated;
        st.maxused = st.maxused.max(st.memuse);
        Ok(va)
    }

    pub fn free(&mut self, ctx: &mut KmCtx<'_>, va: VirtAddr, mtype: &'static str) -> UvmResult<()> {
        let g = self.geom;
        // 先核对块的归属，出错时不动任何状态
        if self.owners.get(&va.0) != Some(&mtype) {
            warn!("[malloc] bad free {:?} of {}", va, mtype);
            return Err(UvmError::BadFree);
        }
        let released = match self.kmemusage.get(&g.atop(va.0)).copied() {
            Some(KmemUsage::Large(npages)) => {
                self.kmemusage.remove(&g.atop(va.0));
                self.page_free(ctx, va, npages);
                g.ptoa(npages)
            }
            Some(KmemUsage::Bucket(indx)) => {
                let bucket = &mut self.buckets[indx];
                bucket.free.push(va);
                bucket.size
            }
            None => return Err(UvmError::BadFree),
        };
        self.owners.remove(&va.0);
        if let Some(st) = self.types.get_mut(mtype) {
            st.inuse -= 1;
            st.memuse -= released;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::init::test_uvm;

    #[test]
    fn nkmempages_is_clamped() {
        let g = PageGeometry::new(4096).unwrap();
        assert_eq!(nkmempages(g, 16), 2048);
        assert_eq!(nkmempages(g, 4 * 3000), 3000);
        assert_eq!(nkmempages(g, 1 << 30), 32768);
    }

    #[test]
    fn small_requests_share_a_bucket_page() {
        let mut uvm = test_uvm(4096, 16);
        let (malloc, mut ctx) = uvm.malloc_ctx();
        let a = malloc.malloc(&mut ctx, 20, "test").unwrap();
        let b = malloc.malloc(&mut ctx, 32, "test").unwrap();
        assert_eq!(b.0, a.0 + 32);
        assert!(ctx.pmap.extract(a).is_some());
        assert!(malloc.kmem_map().min() <= a && a < malloc.kmem_map().max());
        let st = malloc.type_stats("test").unwrap();
        assert_eq!((st.inuse, st.memuse), (2, 64));
        malloc.free(&mut ctx, a, "test").unwrap();
        assert_eq!(malloc.free(&mut ctx, a, "test"), Err(UvmError::BadFree));
        assert_eq!(malloc.malloc(&mut ctx, 17, "test").unwrap(), a);
    }

    #[test]
    fn large_requests_take_whole_pages() {
        let mut uvm = test_uvm(4096, 16);
        let (malloc, mut ctx) = uvm.malloc_ctx();
        let va = malloc.malloc(&mut ctx, 3 * 4096 + 1, "big").unwrap();
        assert!(ctx.pmap.extract(va.offset(3 * 4096)).is_some());
        assert_eq!(malloc.type_stats("big").unwrap().memuse, 4 * 4096);
        assert_eq!(malloc.free(&mut ctx, va.offset(4096), "big"), Err(UvmError::BadFree));
        malloc.free(&mut ctx, va, "big").unwrap();
        assert!(ctx.pmap.extract(va).is_none());
        assert_eq!(malloc.type_stats("big").unwrap().memuse, 0);
    }

    #[test]
    fn free_with_wrong_type_leaves_block_allocated() {
        let mut uvm = test_uvm(4096, 16);
        let (malloc, mut ctx) = uvm.malloc_ctx();
        let a = malloc.malloc(&mut ctx, 32, "A").unwrap();
        assert_eq!(malloc.free(&mut ctx, a, "never-used"), Err(UvmError::BadFree));
        let b = malloc.malloc(&mut ctx, 32, "B").unwrap();
        assert_ne!(a, b);
        assert_eq!(malloc.type_stats("A").unwrap().inuse, 1);
        malloc.free(&mut ctx, a, "A").unwrap();
        let st = malloc.type_stats("A").unwrap();
        assert_eq!((st.inuse, st.memuse), (0, 0));

        let big = malloc.malloc(&mut ctx, 2 * 4096, "A").unwrap();
        assert_eq!(malloc.free(&mut ctx, big, "B"), Err(UvmError::BadFree));
        assert!(ctx.pmap.extract(big).is_some());
        malloc.free(&mut ctx, big, "A").unwrap();
        assert!(ctx.pmap.extract(big).is_none());
    }

    #[test]
    fn zero_size_is_invalid() {
        let mut uvm = test_uvm(4096, 16);
        let (malloc, mut ctx) = uvm.malloc_ctx();
        assert_eq!(malloc.malloc(&mut ctx, 0, "x"), Err(UvmError::InvalidSize));
    }
}
