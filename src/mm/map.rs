//! 虚拟地址地图
//!
//! [`VmMap`] 是一棵按起始地址排序的 entry 树。entry 的存储来自
//! [`MapSys`]：pool 子系统起来之前、以及任何中断安全的地图，都只能使用
//! 静态的 [`KentryPool`]；之后普通地图的 entry 从 `vmmpepl` pool 分配。

use super::address::VirtAddr;
use super::kentry::KentryPool;
use super::km::KmCtx;
use super::page::PageSys;
use super::stage::{Advance, MapsUp, PagesUp};
use crate::config::VM_MIN_KERNEL_ADDRESS;
use crate::error::{UvmError, UvmResult};
use crate::kern::pool::{Pool, PoolPageBackend};
use crate::pmap::Pmap;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, info, warn};
use spin::Mutex;

bitflags! {
    pub struct VmProt: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    /// 地图本身的属性
    pub struct MapFlags: u8 {
        /// 可以在中断上下文中操作，entry 只能来自静态池
        const INTRSAFE = 1 << 0;
        const PAGEABLE = 1 << 1;
    }
}

bitflags! {
    /// uvm_map 的选项
    pub struct UvmFlags: u8 {
        /// 必须映射在给定地址
        const FIXED = 1 << 0;
        /// 不与相邻 entry 合并
        const NOMERGE = 1 << 1;
        const WIRED = 1 << 2;
    }
}

/// entry 的存储槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySlot {
    Static(u16),
    Pooled(VirtAddr),
}

/// entry 背后的对象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryObject {
    /// 只占虚拟地址
    None,
    /// 内核对象
    Kernel,
    /// 子地图
    Submap(&'static str),
}

#[derive(Debug, Clone)]
pub struct VmMapEntry {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub object: EntryObject,
    pub offset: usize,
    pub protection: VmProt,
    pub wired_count: u32,
    pub nomerge: bool,
    slot: EntrySlot,
}

impl VmMapEntry {
    pub fn len(&self) -> usize {
        self.end.0 - self.start.0
    }

    pub fn slot(&self) -> EntrySlot {
        self.slot
    }
}

/// 被 unmap 移除的一段地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub object: EntryObject,
    pub offset: usize,
    pub wired: bool,
}

/// map entry 的分配者
pub struct MapSys {
    /// kernel-map-entry 锁保护的静态池
    kentry: Mutex<KentryPool>,
    entry_pool: Option<Pool>,
}

/// 第 3 步：准备静态 map entry 池
pub fn uvm_map_init(t: PagesUp) -> (MapSys, MapsUp) {
    let kentry = KentryPool::new();
    info!("[uvm] {} static map entries", kentry.capacity());
    let sys = MapSys {
        kentry: Mutex::new(kentry),
        entry_pool: None,
    };
    let t = t.advance(&sys);
    (sys, t)
}

impl MapSys {
    pub fn alloc_entry(
        &mut self,
        map_flags: MapFlags,
        pages: &PageSys,
        pmap: &mut dyn Pmap,
    ) -> UvmResult<EntrySlot> {
        if !map_flags.contains(MapFlags::INTRSAFE) {
            if let Some(pool) = self.entry_pool.as_mut() {
                let va = pool.get(&mut PoolPageBackend { pages, pmap })?;
                return Ok(EntrySlot::Pooled(va));
            }
        }
        match self.kentry.lock().alloc() {
            Some(idx) => Ok(EntrySlot::Static(idx)),
            None => {
                warn!("[uvm] out of static map entries");
                Err(UvmError::MapEntryPoolExhausted)
            }
        }
    }

    pub fn free_entry(&mut self, slot: EntrySlot) {
        match slot {
            EntrySlot::Static(idx) => self.kentry.lock().free(idx),
            EntrySlot::Pooled(va) => match self.entry_pool.as_mut() {
                Some(pool) => {
                    if pool.put(va).is_err() {
                        panic!("map entry {:?} not from vmmpepl", va);
                    }
                }
                None => panic!("pooled map entry {:?} without a pool", va),
            },
        }
    }

    pub fn kentry_free(&self) -> usize {
        self.kentry.lock().nfree()
    }

    pub fn entry_pool(&self) -> Option<&Pool> {
        self.entry_pool.as_ref()
    }

    /// pool 子系统起来之后由它调用一次
    pub(crate) fn install_entry_pool(&mut self, pool: Pool) {
        debug!("[uvm] map entries now come from {}", pool.name());
        self.entry_pool = Some(pool);
    }
}

/// 一个虚拟地址空间
pub struct VmMap {
    name: &'static str,
    min: VirtAddr,
    max: VirtAddr,
    flags: MapFlags,
    entries: BTreeMap<usize, VmMapEntry>,
    size: usize,
}

impl VmMap {
    pub fn new(name: &'static str, min: VirtAddr, max: VirtAddr, flags: MapFlags) -> Self {
        Self {
            name,
            min,
            max,
            flags,
            entries: BTreeMap::new(),
            size: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn min(&self) -> VirtAddr {
        self.min
    }
    pub fn max(&self) -> VirtAddr {
        self.max
    }
    pub fn flags(&self) -> MapFlags {
        self.flags
    }
    /// 已映射的字节数
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn nentries(&self) -> usize {
        self.entries.len()
    }
    pub fn entries(&self) -> impl Iterator<Item = &VmMapEntry> {
        self.entries.values()
    }

    /// 包含 `va` 的 entry
    pub fn lookup(&self, va: VirtAddr) -> Option<&VmMapEntry> {
        self.entries
            .range(..=va.0)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| va < e.end)
    }

    /// 首次适配：从 `hint` 开始找一段 `size` 字节、按 `align` 对齐的空闲地址，
    /// 找不到时再从地图起点找一遍
    pub fn findspace(&self, hint: VirtAddr, size: usize, align: usize) -> Option<VirtAddr> {
        let from = if hint < self.min { self.min } else { hint };
        self.findspace_from(from, size, align).or_else(|| {
            if from > self.min {
                self.findspace_from(self.min, size, align)
            } else {
                None
            }
        })
    }

    fn findspace_from(&self, from: VirtAddr, size: usize, align: usize) -> Option<VirtAddr> {
        let align = align.max(1);
        let mut addr = align_up(from.0, align)?;
        for e in self.entries.values() {
            if e.end.0 <= addr {
                continue;
            }
            if addr.checked_add(size)? <= e.start.0 {
                break;
            }
            addr = align_up(e.end.0, align)?;
        }
        if addr.checked_add(size)? <= self.max.0 {
            Some(VirtAddr(addr))
        } else {
            None
        }
    }

    fn is_free(&self, start: usize, end: usize) -> bool {
        start >= self.min.0
            && end <= self.max.0
            && !self
                .entries
                .values()
                .any(|e| e.start.0 < end && start < e.end.0)
    }

    /// 建立一段映射，返回实际的起始地址。
    ///
    /// 内核对象的偏移省略时取 `va - VM_MIN_KERNEL_ADDRESS`。
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &mut self,
        ctx: &mut KmCtx<'_>,
        start: VirtAddr,
        size: usize,
        object: EntryObject,
        offset: Option<usize>,
        align: usize,
        prot: VmProt,
        flags: UvmFlags,
    ) -> UvmResult<VirtAddr> {
        let g = ctx.pages.geometry();
        if size == 0 || !g.is_aligned(size) {
            return Err(UvmError::InvalidSize);
        }
        let va = if flags.contains(UvmFlags::FIXED) {
            let end = start.0.checked_add(size).ok_or(UvmError::NoSpace)?;
            if !self.is_free(start.0, end) {
                return Err(UvmError::NoSpace);
            }
            start
        } else {
            self.findspace(start, size, align)
                .ok_or(UvmError::NoSpace)?
        };
        let offset = match (object, offset) {
            (_, Some(off)) => off,
            (EntryObject::Kernel, None) => va.0 - VM_MIN_KERNEL_ADDRESS,
            _ => 0,
        };
        let wired_count = u32::from(flags.contains(UvmFlags::WIRED));
        let nomerge = flags.contains(UvmFlags::NOMERGE);

        // 向后合并：与紧邻的前一个 entry 属性完全一致时直接延长它
        if !nomerge && !matches!(object, EntryObject::Submap(_)) {
            if let Some((_, prev)) = self.entries.range_mut(..va.0).next_back() {
                if prev.end == va
                    && !prev.nomerge
                    && prev.object == object
                    && prev.protection == prot
                    && prev.wired_count == wired_count
                    && (object != EntryObject::Kernel || prev.offset + prev.len() == offset)
                {
                    prev.end = VirtAddr(va.0 + size);
                    self.size += size;
                    return Ok(va);
                }
            }
        }

        let slot = ctx.mapsys.alloc_entry(self.flags, ctx.pages, &mut *ctx.pmap)?;
        self.entries.insert(
            va.0,
            VmMapEntry {
                start: va,
                end: VirtAddr(va.0 + size),
                object,
                offset,
                protection: prot,
                wired_count,
                nomerge,
                slot,
            },
        );
        self.size += size;
        Ok(va)
    }

    /// 移除 `[start, end)` 内的所有映射，必要时切分 entry
    pub fn unmap(
        &mut self,
        ctx: &mut KmCtx<'_>,
        start: VirtAddr,
        end: VirtAddr,
    ) -> UvmResult<Vec<MapRange>> {
        let keys: Vec<usize> = self
            .entries
            .values()
            .filter(|e| e.start < end && start < e.end)
            .map(|e| e.start.0)
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(e) = self.entries.get(&key) else {
                continue;
            };
            let keep_left = e.start < start;
            let keep_right = e.end > end;
            // 两头都保留时需要一个新 entry，先分配好再动树
            let extra = if keep_left && keep_right {
                Some(ctx.mapsys.alloc_entry(self.flags, ctx.pages, &mut *ctx.pmap)?)
            } else {
                None
            };
            let Some(mut e) = self.entries.remove(&key) else {
                continue;
            };
            let cut_start = if keep_left { start } else { e.start };
            let cut_end = if keep_right { end } else { e.end };
            removed.push(MapRange {
                start: cut_start,
                end: cut_end,
                object: e.object,
                offset: e.offset + (cut_start.0 - e.start.0),
                wired: e.wired_count > 0,
            });
            self.size -= cut_end.0 - cut_start.0;

            let mut right = None;
            if keep_right {
                let mut r = e.clone();
                r.offset = e.offset + (end.0 - e.start.0);
                r.start = end;
                if let Some(slot) = extra {
                    r.slot = slot;
                }
                right = Some(r);
            }
            if keep_left {
                e.end = start;
                self.entries.insert(e.start.0, e);
            } else if !keep_right {
                ctx.mapsys.free_entry(e.slot);
            }
            if let Some(r) = right {
                self.entries.insert(r.start.0, r);
            }
        }
        Ok(removed)
    }
}

fn align_up(x: usize, align: usize) -> Option<usize> {
    let mask = align - 1;
    Some(x.checked_add(mask)? & !mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::init::test_uvm;

    fn scratch_map(g: usize) -> VmMap {
        VmMap::new(
            "scratch",
            VirtAddr(VM_MIN_KERNEL_ADDRESS),
            VirtAddr(VM_MIN_KERNEL_ADDRESS + 64 * g),
            MapFlags::empty(),
        )
    }

    #[test]
    fn findspace_is_first_fit_and_aligned() {
        let mut uvm = test_uvm(4096, 16);
        let mut ctx = uvm.km_ctx();
        let mut map = scratch_map(4096);
        let base = map.min();
        let a = map
            .map(&mut ctx, base, 4096, EntryObject::None, None, 0, VmProt::READ, UvmFlags::NOMERGE)
            .unwrap();
        assert_eq!(a, base);
        let b = map
            .map(&mut ctx, base, 4096, EntryObject::None, None, 4 * 4096, VmProt::READ, UvmFlags::empty())
            .unwrap();
        assert_eq!(b.0, base.0 + 4 * 4096);
        assert_eq!(map.findspace(base, 4096, 0), Some(VirtAddr(base.0 + 4096)));
        assert_eq!(map.findspace(base, 65 * 4096, 0), None);
    }

    #[test]
    fn adjacent_kernel_entries_merge_unless_nomerge() {
        let mut uvm = test_uvm(4096, 16);
        let mut ctx = uvm.km_ctx();
        let mut map = scratch_map(4096);
        let base = map.min();
        let rw = VmProt::READ | VmProt::WRITE;
        map.map(&mut ctx, base, 4096, EntryObject::Kernel, None, 0, rw, UvmFlags::FIXED)
            .unwrap();
        map.map(&mut ctx, VirtAddr(base.0 + 4096), 4096, EntryObject::Kernel, None, 0, rw, UvmFlags::FIXED)
            .unwrap();
        assert_eq!(map.nentries(), 1);
        map.map(
            &mut ctx,
            VirtAddr(base.0 + 2 * 4096),
            4096,
            EntryObject::Kernel,
            None,
            0,
            rw,
            UvmFlags::FIXED | UvmFlags::NOMERGE,
        )
        .unwrap();
        assert_eq!(map.nentries(), 2);
        assert_eq!(map.size(), 3 * 4096);
        assert_eq!(map.lookup(VirtAddr(base.0 + 4096 + 7)).unwrap().start, base);
    }

    #[test]
    fn fixed_mapping_over_existing_entry_fails() {
        let mut uvm = test_uvm(4096, 16);
        let mut ctx = uvm.km_ctx();
        let mut map = scratch_map(4096);
        let base = map.min();
        map.map(&mut ctx, base, 2 * 4096, EntryObject::None, None, 0, VmProt::READ, UvmFlags::FIXED)
            .unwrap();
        assert_eq!(
            map.map(&mut ctx, VirtAddr(base.0 + 4096), 4096, EntryObject::None, None, 0, VmProt::READ, UvmFlags::FIXED),
            Err(UvmError::NoSpace)
        );
    }

    #[test]
    fn unmap_middle_splits_entry() {
        let mut uvm = test_uvm(4096, 16);
        let mut ctx = uvm.km_ctx();
        let mut map = scratch_map(4096);
        let base = map.min();
        map.map(&mut ctx, base, 4 * 4096, EntryObject::Kernel, None, 0, VmProt::READ, UvmFlags::FIXED)
            .unwrap();
        let removed = map
            .unmap(&mut ctx, VirtAddr(base.0 + 4096), VirtAddr(base.0 + 2 * 4096))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].offset, 4096);
        assert_eq!(map.nentries(), 2);
        assert_eq!(map.size(), 3 * 4096);
        let right = map.lookup(VirtAddr(base.0 + 2 * 4096)).unwrap();
        assert_eq!(right.offset, 2 * 4096);
        assert!(map.lookup(VirtAddr(base.0 + 4096)).is_none());
        map.unmap(&mut ctx, base, map.max()).unwrap();
        assert_eq!(map.nentries(), 0);
    }

    #[test]
    fn intrsafe_maps_use_static_entries() {
        let mut uvm = test_uvm(4096, 16);
        let mut ctx = uvm.km_ctx();
        let before = ctx.mapsys.kentry_free();
        let mut map = VmMap::new(
            "intr",
            VirtAddr(VM_MIN_KERNEL_ADDRESS),
            VirtAddr(VM_MIN_KERNEL_ADDRESS + 16 * 4096),
            MapFlags::INTRSAFE,
        );
        let va = map
            .map(&mut ctx, map.min(), 4096, EntryObject::None, None, 0, VmProt::READ, UvmFlags::NOMERGE)
            .unwrap();
        assert!(matches!(map.lookup(va).unwrap().slot(), EntrySlot::Static(_)));
        assert_eq!(ctx.mapsys.kentry_free(), before - 1);

        let mut plain = scratch_map(4096);
        let va = plain
            .map(&mut ctx, plain.min(), 4096, EntryObject::None, None, 0, VmProt::READ, UvmFlags::NOMERGE)
            .unwrap();
        assert!(matches!(plain.lookup(va).unwrap().slot(), EntrySlot::Pooled(_)));
        assert_eq!(ctx.mapsys.kentry_free(), before - 1);
    }
}
