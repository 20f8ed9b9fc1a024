//! 体系结构相关的页表层
//!
//! UVM 只通过 [`Pmap`] 这个接口和页表打交道；主机侧的模拟用
//! [`soft::SoftPmap`]。

pub mod soft;

use crate::error::UvmResult;
use crate::mm::address::{PageGeometry, PhysAddr, VirtAddr};
use crate::mm::map::VmProt;
use alloc::vec::Vec;

/// 交给 `pmap_init` 的启动上下文
#[derive(Debug, Clone, Copy)]
pub struct PmapInitCtx {
    pub geom: PageGeometry,
    /// 受管理的物理页数
    pub npages: usize,
    /// 按 [`Pmap::init_size`] 从内核地图中分配好的钉住内存
    pub mem: VirtAddr,
    pub size: usize,
}

pub trait Pmap {
    /// 内核虚拟地址中尚未使用的部分
    fn virtual_space(&self) -> (VirtAddr, VirtAddr);

    /// 启动早期已经被占用的内核虚拟地址区间
    fn early_claims(&self) -> Vec<(VirtAddr, VirtAddr)> {
        Vec::new()
    }

    /// `pmap_init` 需要的簿记内存（字节）
    fn init_size(&self, _npages: usize) -> usize {
        0
    }

    fn init(&mut self, ctx: &PmapInitCtx) -> UvmResult<()>;

    fn kenter_pa(&mut self, va: VirtAddr, pa: PhysAddr, prot: VmProt);
    fn kremove(&mut self, va: VirtAddr, len: usize);
    fn extract(&self, va: VirtAddr) -> Option<PhysAddr>;

    /// 把一个物理页放进直接映射窗口，供 pool 使用
    fn map_poolpage(&mut self, pa: PhysAddr) -> VirtAddr;
    fn unmap_poolpage(&mut self, va: VirtAddr) -> PhysAddr;

    fn update(&mut self) {}
}
