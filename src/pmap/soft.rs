//! 软件页表
//!
//! 用 `BTreeMap<VirtPageNum, PageTableEntry>` 模拟一张单级页表，PTE 的
//! 位布局沿用 Sv39：物理页号放在第 10 位以上，低 8 位是标志。

use super::{Pmap, PmapInitCtx};
use crate::config::{PMAP_DIRECT_BASE, PMAP_DIRECT_END, VM_MAX_KERNEL_ADDRESS, VM_MIN_KERNEL_ADDRESS};
use crate::error::{UvmError, UvmResult};
use crate::mm::address::{PageGeometry, PhysAddr, PhysPageNum, VPNRange, VirtAddr, VirtPageNum};
use crate::mm::map::VmProt;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, info};

bitflags! {
    /// page table entry flags
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

impl From<VmProt> for PTEFlags {
    fn from(prot: VmProt) -> Self {
        let mut f = PTEFlags::empty();
        if prot.contains(VmProt::READ) {
            f |= PTEFlags::R;
        }
        if prot.contains(VmProt::WRITE) {
            f |= PTEFlags::W;
        }
        if prot.contains(VmProt::EXECUTE) {
            f |= PTEFlags::X;
        }
        f
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
/// page table entry structure
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }
    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }
}

/// pv 表每项的大小：映射到的虚拟地址加链表的下一项
const PV_ENTRY_SIZE: usize = 2 * core::mem::size_of::<usize>();

pub struct SoftPmap {
    geom: PageGeometry,
    avail_start: VirtAddr,
    claims: Vec<(VirtAddr, VirtAddr)>,
    table: BTreeMap<VirtPageNum, PageTableEntry>,
    /// pmap_init 之后才有：(地址, 项数)
    pv_table: Option<(VirtAddr, usize)>,
    nupdates: usize,
}

impl SoftPmap {
    /// 模拟 pmap_bootstrap：内核镜像从 `VM_MIN_KERNEL_ADDRESS` 开始占
    /// `image_size` 字节，物理上从 `image_pa` 开始
    pub fn bootstrap(geom: PageGeometry, image_pa: PhysAddr, image_size: usize) -> Self {
        let mut pmap = Self {
            geom,
            avail_start: VirtAddr(VM_MIN_KERNEL_ADDRESS),
            claims: Vec::new(),
            table: BTreeMap::new(),
            pv_table: None,
            nupdates: 0,
        };
        let size = geom.round(image_size);
        if size > 0 {
            let start = VirtAddr(VM_MIN_KERNEL_ADDRESS);
            for i in 0..geom.atop(size) {
                pmap.kenter_pa(
                    start.offset(geom.ptoa(i)),
                    image_pa.offset(geom.ptoa(i)),
                    VmProt::READ | VmProt::WRITE | VmProt::EXECUTE,
                );
            }
            pmap.claims.push((start, start.offset(size)));
            pmap.avail_start = start.offset(size);
        }
        debug!(
            "[pmap] bootstrap: image {:#x} byte(s), virtual space from {:?}",
            size, pmap.avail_start
        );
        pmap
    }

    pub fn is_initialized(&self) -> bool {
        self.pv_table.is_some()
    }

    pub fn pv_table(&self) -> Option<(VirtAddr, usize)> {
        self.pv_table
    }

    pub fn mapped_pages(&self) -> usize {
        self.table.len()
    }

    pub fn nupdates(&self) -> usize {
        self.nupdates
    }

    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.table.get(&vpn).copied()
    }
}

impl Pmap for SoftPmap {
    fn virtual_space(&self) -> (VirtAddr, VirtAddr) {
        (self.avail_start, VirtAddr(VM_MAX_KERNEL_ADDRESS))
    }

    fn early_claims(&self) -> Vec<(VirtAddr, VirtAddr)> {
        self.claims.clone()
    }

    fn init_size(&self, npages: usize) -> usize {
        npages * PV_ENTRY_SIZE
    }

    fn init(&mut self, ctx: &PmapInitCtx) -> UvmResult<()> {
        let need = self.init_size(ctx.npages);
        if ctx.size < need {
            return Err(UvmError::PmapInitFailed("pv table too small"));
        }
        if need > 0 && self.extract(ctx.mem).is_none() {
            return Err(UvmError::PmapInitFailed("pv table not mapped"));
        }
        self.pv_table = Some((ctx.mem, ctx.npages));
        info!(
            "[pmap] init: pv table for {} page(s) at {:?}",
            ctx.npages, ctx.mem
        );
        Ok(())
    }

    fn kenter_pa(&mut self, va: VirtAddr, pa: PhysAddr, prot: VmProt) {
        let flags = PTEFlags::V | PTEFlags::G | PTEFlags::A | PTEFlags::D | PTEFlags::from(prot);
        self.table
            .insert(va.floor(self.geom), PageTableEntry::new(pa.floor(self.geom), flags));
    }

    fn kremove(&mut self, va: VirtAddr, len: usize) {
        let range = VPNRange::new(va.floor(self.geom), va.offset(len).ceil(self.geom));
        for vpn in range {
            self.table.remove(&vpn);
        }
    }

    fn extract(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.translate(va.floor(self.geom))
            .filter(PageTableEntry::is_valid)
            .map(|pte| pte.ppn().addr(self.geom).offset(va.page_offset(self.geom)))
    }

    fn map_poolpage(&mut self, pa: PhysAddr) -> VirtAddr {
        let va = VirtAddr(PMAP_DIRECT_BASE + pa.0);
        assert!(va.0 < PMAP_DIRECT_END, "{:?} outside the direct map", pa);
        self.kenter_pa(va, pa, VmProt::READ | VmProt::WRITE);
        va
    }

    fn unmap_poolpage(&mut self, va: VirtAddr) -> PhysAddr {
        let pa = PhysAddr(va.0 - PMAP_DIRECT_BASE);
        self.kremove(va, self.geom.size);
        pa
    }

    fn update(&mut self) {
        self.nupdates += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmap() -> SoftPmap {
        SoftPmap::bootstrap(PageGeometry::new(4096).unwrap(), PhysAddr(0x8020_0000), 3 * 4096)
    }

    #[test]
    fn bootstrap_claims_kernel_image() {
        let p = pmap();
        let (start, end) = p.virtual_space();
        assert_eq!(start.0, VM_MIN_KERNEL_ADDRESS + 3 * 4096);
        assert_eq!(end.0, VM_MAX_KERNEL_ADDRESS);
        assert_eq!(p.early_claims(), vec![(VirtAddr(VM_MIN_KERNEL_ADDRESS), start)]);
        assert_eq!(
            p.extract(VirtAddr(VM_MIN_KERNEL_ADDRESS + 4096 + 5)),
            Some(PhysAddr(0x8020_1005))
        );
    }

    #[test]
    fn kenter_and_kremove() {
        let mut p = pmap();
        let va = VirtAddr(VM_MIN_KERNEL_ADDRESS + 0x10_0000);
        assert_eq!(p.mapped_pages(), 3);
        p.kenter_pa(va, PhysAddr(0x9000_0000), VmProt::READ);
        assert_eq!(p.mapped_pages(), 4);
        let pte = p.translate(va.floor(p.geom)).unwrap();
        assert!(pte.is_valid());
        assert!(!pte.writable());
        p.kremove(va, 1);
        assert!(p.extract(va).is_none());
    }

    #[test]
    fn poolpages_live_in_the_direct_map() {
        let mut p = pmap();
        let va = p.map_poolpage(PhysAddr(0x8100_0000));
        assert_eq!(va.0, PMAP_DIRECT_BASE + 0x8100_0000);
        assert_eq!(p.extract(va.offset(8)), Some(PhysAddr(0x8100_0008)));
        assert_eq!(p.unmap_poolpage(va), PhysAddr(0x8100_0000));
        assert!(p.extract(va).is_none());
    }

    #[test]
    fn init_rejects_short_pv_table() {
        let mut p = pmap();
        let ctx = PmapInitCtx {
            geom: p.geom,
            npages: 100,
            mem: VirtAddr(VM_MIN_KERNEL_ADDRESS),
            size: 16,
        };
        assert_eq!(p.init(&ctx), Err(UvmError::PmapInitFailed("pv table too small")));
        assert!(!p.is_initialized());
    }

    #[test]
    fn init_records_mapped_pv_table() {
        let mut p = pmap();
        let mem = VirtAddr(VM_MIN_KERNEL_ADDRESS + 0x20_0000);
        let ctx = PmapInitCtx {
            geom: p.geom,
            npages: 100,
            mem,
            size: 4096,
        };
        assert_eq!(p.init_size(100), 100 * PV_ENTRY_SIZE);
        assert_eq!(
            p.init(&PmapInitCtx { size: 16, ..ctx }),
            Err(UvmError::PmapInitFailed("pv table too small"))
        );
        assert_eq!(p.init(&ctx), Err(UvmError::PmapInitFailed("pv table not mapped")));
        p.kenter_pa(mem, PhysAddr(0x9000_0000), VmProt::READ | VmProt::WRITE);
        let before = p.nupdates();
        p.update();
        assert_eq!(p.nupdates(), before + 1);
        p.init(&ctx).unwrap();
        assert_eq!(p.pv_table(), Some((mem, 100)));
    }
}
