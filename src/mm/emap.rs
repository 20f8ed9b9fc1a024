//! emap：短暂映射与按 CPU 的延迟 TLB 同步
//!
//! 生产者建立映射后产生一个新的代号；消费者在使用映射前检查本 CPU 见过
//! 的代号，落后时才刷新。代号 0 保留为“未激活”，回绕时跳过。

use super::address::{PageGeometry, PhysAddr, VirtAddr};
use super::km::{KmCtx, KmFlags, uvm_km_alloc};
use super::map::{VmMap, VmProt};
use super::stage::{Advance, EmapUp, LoansUp};
use crate::config::{MAXCPUS, UVM_EMAP_SIZE};
use crate::error::{UvmError, UvmResult};
use crate::pmap::Pmap;
use alloc::collections::BTreeMap;
use buddy_system_allocator::FrameAllocator;
use log::{info, warn};

pub struct EmapSys {
    geom: PageGeometry,
    va: VirtAddr,
    size: usize,
    arena: FrameAllocator,
    /// 已分配的窗口：起始地址到页数
    live: BTreeMap<usize, usize>,
    gen: u32,
    cpu_gen: [u32; MAXCPUS],
}

/// 第 12 步
pub fn uvm_emap_sysinit(
    kernel_map: &mut VmMap,
    ctx: &mut KmCtx<'_>,
    t: LoansUp,
) -> UvmResult<(EmapSys, EmapUp)> {
    let g = ctx.pages.geometry();
    let size = g.round(UVM_EMAP_SIZE);
    let va = uvm_km_alloc(kernel_map, ctx, size, 0, KmFlags::VAONLY)?;
    let mut arena = FrameAllocator::new();
    arena.add_frame(g.atop(va.0), g.atop(va.0 + size));
    info!("[emap] {:#x} byte(s) at {:?}", size, va);
    let sys = EmapSys {
        geom: g,
        va,
        size,
        arena,
        live: BTreeMap::new(),
        gen: 1,
        cpu_gen: [0; MAXCPUS],
    };
    let t = t.advance(&sys);
    Ok((sys, t))
}

impl EmapSys {
    pub fn range(&self) -> (VirtAddr, VirtAddr) {
        (self.va, self.va.offset(self.size))
    }

    pub fn alloc(&mut self, size: usize) -> UvmResult<VirtAddr> {
        let n = self.geom.atop(self.geom.round(size));
        if n == 0 {
            return Err(UvmError::InvalidSize);
        }
        let vpn = self.arena.alloc(n).ok_or(UvmError::NoSpace)?;
        let va = self.geom.ptoa(vpn);
        self.live.insert(va, n);
        Ok(VirtAddr(va))
    }

    /// `[va, va + size)` 是否落在某个已分配的窗口里
    fn owns(&self, va: VirtAddr, size: usize) -> bool {
        let Some((&start, &n)) = self.live.range(..=va.0).next_back() else {
            return false;
        };
        va.0.checked_add(size)
            .is_some_and(|end| end <= start + self.geom.ptoa(n))
    }

    pub fn free(&mut self, va: VirtAddr, size: usize) -> UvmResult<()> {
        let n = self.geom.atop(self.geom.round(size));
        if self.live.get(&va.0) != Some(&n) {
            warn!("[emap] bad free {:?}", va);
            return Err(UvmError::BadFree);
        }
        self.live.remove(&va.0);
        self.arena.dealloc(self.geom.atop(va.0), n);
        Ok(())
    }

    pub fn enter(
        &mut self,
        pmap: &mut dyn Pmap,
        va: VirtAddr,
        pas: &[PhysAddr],
        prot: VmProt,
    ) -> UvmResult<()> {
        if pas.is_empty() || !self.owns(va, self.geom.ptoa(pas.len())) {
            return Err(UvmError::InvalidSize);
        }
        for (i, &pa) in pas.iter().enumerate() {
            pmap.kenter_pa(va.offset(self.geom.ptoa(i)), pa, prot);
        }
        Ok(())
    }

    pub fn remove(&mut self, pmap: &mut dyn Pmap, va: VirtAddr, size: usize) -> UvmResult<()> {
        let size = self.geom.round(size);
        if size == 0 || !self.owns(va, size) {
            return Err(UvmError::InvalidSize);
        }
        pmap.kremove(va, size);
        Ok(())
    }

    pub fn current(&self) -> u32 {
        self.gen
    }

    /// 产生一个新代号
    pub fn produce(&mut self) -> u32 {
        self.gen = self.gen.wrapping_add(1);
        if self.gen == 0 {
            self.gen = 1;
        }
        self.gen
    }

    /// CPU 在使用映射前调用；本 CPU 落后于 `gen` 时刷新并返回 `true`
    pub fn consume(&mut self, pmap: &mut dyn Pmap, cpu: usize, gen: u32) -> bool {
        let seen = self.cpu_gen[cpu];
        if seen != 0 && (gen.wrapping_sub(seen) as i32) <= 0 {
            return false;
        }
        pmap.update();
        self.cpu_gen[cpu] = self.gen;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::init::test_uvm;
    use crate::mm::page::PgaFlags;

    #[test]
    fn consume_flushes_only_when_behind() {
        let mut uvm = test_uvm(4096, 16);
        let g1 = uvm.emap_produce();
        assert!(uvm.emap_consume(0, g1));
        assert!(!uvm.emap_consume(0, g1));
        let g2 = uvm.emap_produce();
        assert!(g2 != g1);
        assert!(uvm.emap_consume(0, g2));
        assert!(uvm.emap_consume(1, g1));
        assert!(!uvm.emap_consume(1, g2));
    }

    #[test]
    fn generation_skips_zero() {
        let mut uvm = test_uvm(4096, 16);
        let emap = uvm.core.emap.as_mut().unwrap();
        emap.gen = u32::MAX;
        assert_eq!(emap.produce(), 1);
        assert_eq!(emap.current(), 1);
    }

    #[test]
    fn enter_and_remove_through_the_arena() {
        let mut uvm = test_uvm(4096, 16);
        let id = uvm.uvm_pagealloc(PgaFlags::empty()).unwrap();
        let va = uvm.emap_alloc(4096).unwrap();
        let (lo, hi) = uvm.core.emap.as_ref().unwrap().range();
        assert!(lo <= va && va < hi);
        uvm.emap_enter(va, &[id]).unwrap();
        let pa = uvm.core.page.as_ref().unwrap().phys_addr(id);
        assert_eq!(uvm.pmap().unwrap().extract(va), Some(pa));
        uvm.emap_remove(va, 4096).unwrap();
        assert!(uvm.pmap().unwrap().extract(va).is_none());
        uvm.emap_free(va, 4096).unwrap();
    }

    #[test]
    fn free_rejects_addresses_it_did_not_hand_out() {
        let mut uvm = test_uvm(4096, 16);
        let (lo, hi) = uvm.core.emap.as_ref().unwrap().range();
        assert_eq!(uvm.emap_free(hi.offset(1 << 20), 4096), Err(UvmError::BadFree));
        assert_eq!(uvm.emap_free(lo, 4096), Err(UvmError::BadFree));
        let va = uvm.emap_alloc(2 * 4096).unwrap();
        assert_eq!(uvm.emap_free(va, 4096), Err(UvmError::BadFree));
        uvm.emap_free(va, 2 * 4096).unwrap();
        assert_eq!(uvm.emap_free(va, 2 * 4096), Err(UvmError::BadFree));
        let again = uvm.emap_alloc(4096).unwrap();
        assert!(lo <= again && again < hi);
    }

    #[test]
    fn enter_stays_inside_the_allocation() {
        let mut uvm = test_uvm(4096, 16);
        let id = uvm.uvm_pagealloc(PgaFlags::empty()).unwrap();
        let (_, hi) = uvm.core.emap.as_ref().unwrap().range();
        assert_eq!(uvm.emap_enter(hi, &[id]), Err(UvmError::InvalidSize));
        let va = uvm.emap_alloc(4096).unwrap();
        assert_eq!(uvm.emap_enter(va, &[id, id]), Err(UvmError::InvalidSize));
        assert_eq!(uvm.emap_remove(va.offset(4096), 4096), Err(UvmError::InvalidSize));
        uvm.emap_enter(va, &[id]).unwrap();
        assert!(uvm.pmap().unwrap().extract(va).is_some());
    }
}
