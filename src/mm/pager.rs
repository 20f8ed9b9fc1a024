//! pager 子系统
//!
//! `pager_map` 是内核地图里专门给 pager 临时映射页用的子地图；它用完时
//! 还有一个 `MAXPHYS` 大小的紧急窗口可以借用一次。交换设备的簿记由
//! swap-data 锁保护。

use super::address::VirtAddr;
use super::km::{KmCtx, KmFlags, uvm_km_alloc, uvm_km_suballoc};
use super::map::{EntryObject, MapFlags, UvmFlags, VmMap, VmProt};
use super::object::PagerKind;
use super::page::PageId;
use super::stage::{Advance, MallocUp, PagersUp};
use crate::config::{MAXPHYS, PAGER_MAP_SIZE};
use crate::error::{UvmError, UvmResult};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use buddy_system_allocator::FrameAllocator;
use log::{debug, info, warn};
use spin::Mutex;

/// 每种 pager 的操作表
pub struct PagerOps {
    pub kind: PagerKind,
    pub name: &'static str,
    pub pgo_init: Option<fn() -> bool>,
}

fn uao_init() -> bool {
    debug!("[pager] aobj pager ready");
    true
}

fn ubc_init() -> bool {
    debug!("[pager] ubc pager ready");
    true
}

pub static PAGER_OPS: [PagerOps; 4] = [
    PagerOps {
        kind: PagerKind::Aobj,
        name: "aobj",
        pgo_init: Some(uao_init),
    },
    PagerOps {
        kind: PagerKind::Device,
        name: "device",
        pgo_init: None,
    },
    PagerOps {
        kind: PagerKind::Vnode,
        name: "vnode",
        pgo_init: None,
    },
    PagerOps {
        kind: PagerKind::Ubc,
        name: "ubc",
        pgo_init: Some(ubc_init),
    },
];

struct SwapDev {
    /// 第一个槽号，槽号 0 表示“没有槽”
    base: u32,
    nslots: u32,
    nfree: u32,
    slots: FrameAllocator,
    /// 已分配的槽：起始槽号到个数
    live: BTreeMap<u32, u32>,
}

#[derive(Default)]
pub struct SwapData {
    devs: Vec<SwapDev>,
    next_base: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    pub ndevs: usize,
    pub nslots: usize,
    pub nfree: usize,
}

pub struct PagerSys {
    pager_map: VmMap,
    emergva: VirtAddr,
    emerginuse: bool,
    /// swap-data 锁
    swap: Mutex<SwapData>,
    ready: [bool; 4],
}

/// 第 7 步
pub fn uvm_pager_init(
    kernel_map: &mut VmMap,
    ctx: &mut KmCtx<'_>,
    t: MallocUp,
) -> UvmResult<(PagerSys, PagersUp)> {
    let pager_map = uvm_km_suballoc(kernel_map, ctx, PAGER_MAP_SIZE, MapFlags::PAGEABLE, "pager_map")?;
    let emergva = uvm_km_alloc(kernel_map, ctx, MAXPHYS, 0, KmFlags::VAONLY)?;
    let mut ready = [false; 4];
    for (i, ops) in PAGER_OPS.iter().enumerate() {
        ready[i] = ops.pgo_init.map_or(true, |init| init());
    }
    info!(
        "[pager] pager_map {:#x} byte(s), emergency window at {:?}",
        PAGER_MAP_SIZE, emergva
    );
    let sys = PagerSys {
        pager_map,
        emergva,
        emerginuse: false,
        swap: Mutex::new(SwapData {
            devs: Vec::new(),
            next_base: 1,
        }),
        ready,
    };
    let t = t.advance(&sys);
    Ok((sys, t))
}

impl PagerSys {
    pub fn pager_map(&self) -> &VmMap {
        &self.pager_map
    }

    pub fn emergva(&self) -> VirtAddr {
        self.emergva
    }

    pub fn ops_ready(&self, kind: PagerKind) -> bool {
        PAGER_OPS
            .iter()
            .position(|o| o.kind == kind)
            .is_some_and(|i| self.ready[i])
    }

    /// 把一组页临时映射进 pager_map
    pub fn pagermapin(&mut self, ctx: &mut KmCtx<'_>, pages: &[PageId]) -> UvmResult<VirtAddr> {
        let g = ctx.pages.geometry();
        let size = g.ptoa(pages.len());
        if pages.is_empty() || size > g.round(MAXPHYS) {
            return Err(UvmError::InvalidSize);
        }
        let hint = self.pager_map.min();
        let va = match self.pager_map.map(
            ctx,
            hint,
            size,
            EntryObject::None,
            None,
            0,
            VmProt::READ | VmProt::WRITE,
            UvmFlags::NOMERGE,
        ) {
            Ok(va) => va,
            Err(UvmError::NoSpace) if !self.emerginuse => {
                warn!("[pager] pager_map full, using emergency window");
                self.emerginuse = true;
                self.emergva
            }
            Err(UvmError::NoSpace) => return Err(UvmError::PagerMapFull),
            Err(e) => return Err(e),
        };
        for (i, &id) in pages.iter().enumerate() {
            ctx.pmap.kenter_pa(
                va.offset(g.ptoa(i)),
                ctx.pages.phys_addr(id),
                VmProt::READ | VmProt::WRITE,
            );
        }
        ctx.pmap.update();
        Ok(va)
    }

    pub fn pagermapout(&mut self, ctx: &mut KmCtx<'_>, va: VirtAddr, npages: usize) -> UvmResult<()> {
        let size = ctx.pages.geometry().ptoa(npages);
        if va == self.emergva {
            if !self.emerginuse {
                return Err(UvmError::BadFree);
            }
            self.emerginuse = false;
        } else if self.pager_map.unmap(ctx, va, va.offset(size))?.is_empty() {
            return Err(UvmError::BadFree);
        }
        ctx.pmap.kremove(va, size);
        ctx.pmap.update();
        Ok(())
    }

    /// 加入一个有 `nslots` 个槽的交换设备，返回它的第一个槽号
    pub fn swap_add(&self, nslots: u32) -> UvmResult<u32> {
        if nslots == 0 {
            return Err(UvmError::InvalidSize);
        }
        let mut sd = self.swap.lock();
        let base = sd.next_base;
        let end = base.checked_add(nslots).ok_or(UvmError::InvalidSize)?;
        let mut slots = FrameAllocator::new();
        slots.add_frame(base as usize, end as usize);
        sd.devs.push(SwapDev {
            base,
            nslots,
            nfree: nslots,
            slots,
            live: BTreeMap::new(),
        });
        sd.next_base = end;
        info!("[swap] device {} with {} slot(s)", sd.devs.len() - 1, nslots);
        Ok(base)
    }

    /// 分配 `n` 个连续的交换槽
    pub fn swap_alloc(&self, n: u32) -> UvmResult<u32> {
        if n == 0 {
            return Err(UvmError::InvalidSize);
        }
        let mut sd = self.swap.lock();
        for dev in sd.devs.iter_mut() {
            if dev.nfree < n {
                continue;
            }
            if let Some(slot) = dev.slots.alloc(n as usize) {
                dev.nfree -= n.next_power_of_two();
                dev.live.insert(slot as u32, n);
                return Ok(slot as u32);
            }
        }
        Err(UvmError::SwapFull)
    }

    /// 释放 `swap_alloc` 分出的一段槽，`n` 必须和分配时一致
    pub fn swap_free(&self, slot: u32, n: u32) -> UvmResult<()> {
        let mut sd = self.swap.lock();
        let dev = sd
            .devs
            .iter_mut()
            .find(|d| d.base <= slot && slot - d.base < d.nslots)
            .ok_or(UvmError::BadFree)?;
        if dev.live.get(&slot) != Some(&n) {
            warn!("[swap] bad free of {} slot(s) at {}", n, slot);
            return Err(UvmError::BadFree);
        }
        dev.live.remove(&slot);
        dev.slots.dealloc(slot as usize, n as usize);
        dev.nfree += n.next_power_of_two();
        Ok(())
    }

    pub fn swap_stats(&self) -> SwapStats {
        let sd = self.swap.lock();
        SwapStats {
            ndevs: sd.devs.len(),
            nslots: sd.devs.iter().map(|d| d.nslots as usize).sum(),
            nfree: sd.devs.iter().map(|d| d.nfree as usize).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::init::test_uvm;
    use crate::mm::page::PgaFlags;

    #[test]
    fn all_pager_ops_initialised() {
        let uvm = test_uvm(4096, 16);
        let pager = uvm.core.pager.as_ref().unwrap();
        for ops in PAGER_OPS.iter() {
            assert!(pager.ops_ready(ops.kind), "{} not ready", ops.name);
        }
    }

    #[test]
    fn mapin_falls_back_to_emergency_window_once() {
        let mut uvm = test_uvm(4096, 16);
        let pages: Vec<PageId> = (0..16)
            .map(|_| uvm.uvm_pagealloc(PgaFlags::empty()).unwrap())
            .collect();
        let mut mapped = Vec::new();
        loop {
            let va = uvm.pagermapin(&pages).unwrap();
            if va == uvm.core.pager.as_ref().unwrap().emergva() {
                break;
            }
            mapped.push(va);
        }
        assert_eq!(mapped.len(), PAGER_MAP_SIZE / MAXPHYS);
        assert_eq!(uvm.pagermapin(&pages[..1]), Err(UvmError::PagerMapFull));
        let emerg = uvm.core.pager.as_ref().unwrap().emergva();
        uvm.pagermapout(emerg, 16).unwrap();
        uvm.pagermapout(mapped[3], 16).unwrap();
        let again = uvm.pagermapin(&pages[..2]).unwrap();
        assert_eq!(again, mapped[3]);
    }

    #[test]
    fn mapin_enters_pages() {
        let mut uvm = test_uvm(4096, 16);
        let a = uvm.uvm_pagealloc(PgaFlags::empty()).unwrap();
        let b = uvm.uvm_pagealloc(PgaFlags::empty()).unwrap();
        let va = uvm.pagermapin(&[a, b]).unwrap();
        let pb = uvm.core.page.as_ref().unwrap().phys_addr(b);
        assert_eq!(uvm.pmap().unwrap().extract(va.offset(4096)), Some(pb));
        uvm.pagermapout(va, 2).unwrap();
        assert!(uvm.pmap().unwrap().extract(va).is_none());
        assert_eq!(uvm.pagermapout(va, 2), Err(UvmError::BadFree));
    }

    #[test]
    fn swap_slots_come_and_go() {
        let uvm = test_uvm(4096, 16);
        let pager = uvm.core.pager.as_ref().unwrap();
        assert_eq!(pager.swap_alloc(1), Err(UvmError::SwapFull));
        let base = pager.swap_add(64).unwrap();
        assert_eq!(base, 1);
        let s = pager.swap_alloc(4).unwrap();
        assert!(s >= base && s + 4 <= base + 64);
        assert_eq!(pager.swap_stats().nfree, 60);
        pager.swap_free(s, 4).unwrap();
        assert_eq!(pager.swap_stats(), SwapStats { ndevs: 1, nslots: 64, nfree: 64 });
        assert_eq!(pager.swap_free(1000, 1), Err(UvmError::BadFree));
    }

    #[test]
    fn swap_free_only_takes_live_slots() {
        let uvm = test_uvm(4096, 16);
        let pager = uvm.core.pager.as_ref().unwrap();
        let base = pager.swap_add(8).unwrap();
        let s = pager.swap_alloc(4).unwrap();
        assert_eq!(pager.swap_free(s, 2), Err(UvmError::BadFree));
        pager.swap_free(s, 4).unwrap();
        assert_eq!(pager.swap_free(s, 4), Err(UvmError::BadFree));
        assert_eq!(pager.swap_free(base + 4, 4), Err(UvmError::BadFree));
        assert_eq!(pager.swap_stats().nfree, 8);
        // 槽 1..9 里只有一块对齐的 4 槽
        assert_eq!(pager.swap_alloc(4), Ok(s));
        assert_eq!(pager.swap_alloc(4), Err(UvmError::SwapFull));
    }

    #[test]
    fn swap_add_rejects_slot_number_overflow() {
        let uvm = test_uvm(4096, 16);
        let pager = uvm.core.pager.as_ref().unwrap();
        assert_eq!(pager.swap_add(u32::MAX), Err(UvmError::InvalidSize));
        assert_eq!(pager.swap_stats().ndevs, 0);
        assert_eq!(pager.swap_add(16), Ok(1));
    }
}
