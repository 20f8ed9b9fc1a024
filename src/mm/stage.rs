//! 启动阶段的能力令牌
//!
//! 每个启动步骤消耗上一步的令牌、产出下一步的令牌。令牌只能在本模块内
//! 构造：要么凭上一步的令牌加这一步建好的子系统推进，要么由本模块里
//! 完成该步工作的函数交出。缺了前一步的令牌就调用某一步会直接编译失败。

use super::address::PageGeometry;
use super::emap::EmapSys;
use super::exp::UvmExp;
use super::init::UvmCore;
use super::km::KernelSpace;
use super::loan::LoanSys;
use super::map::MapSys;
use super::object::{SwHashStorage, UvmObject};
use super::page::PageSys;
use super::pager::PagerSys;
use super::pdpolicy::PdPolicy;
use super::uarea::UareaSys;
use crate::error::{UvmError, UvmResult};
use crate::kern::kmem::Kmem;
use crate::kern::lockobj::LockObjCache;
use crate::kern::malloc::MallocSys;
use crate::kern::pool::PoolSys;
use crate::pmap::{Pmap, PmapInitCtx};

macro_rules! stage_tokens {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[must_use]
            #[derive(Debug)]
            pub struct $name {
                _priv: (),
            }
        )*
    };
}

stage_tokens! {
    /// 页大小已经由硬件设置且合法
    PageSizeOk,
    /// 全局 VM 单例已清零
    Zeroed,
    /// 页帧数据库与空闲队列就绪
    PagesUp,
    /// 静态 map entry 池就绪
    MapsUp,
    /// 内核地图与内核对象就绪
    KernelMapUp,
    /// pmap 模块就绪
    PmapUp,
    /// 早期 malloc 可用
    MallocUp,
    /// pager 与 pager_map 就绪
    PagersUp,
    /// pool 子系统就绪
    PoolsUp,
    /// kmem 可用
    KmemUp,
    /// 锁对象缓存就绪
    LockObjsUp,
    /// loan 就绪
    LoansUp,
    /// emap 就绪
    EmapUp,
    /// 内核对象可换出
    KernelPageable,
    /// 换页策略已按真实计数重新调整
    PdPolicyLive,
    /// 匿名内存与 uarea 就绪
    AnonUp,
}

/// 从一个阶段推进到它唯一的后继阶段。
///
/// 推进需要本步骤建好的子系统作为凭据；这些子系统只能由对应的初始化
/// 函数构造。
pub(crate) trait Advance: Sized {
    type Next;
    type Proof: ?Sized;
    fn advance(self, proof: &Self::Proof) -> Self::Next;
}

macro_rules! stage_chain {
    ($($from:ident => $to:ident by $proof:ty),* $(,)?) => {
        $(
            impl Advance for $from {
                type Next = $to;
                type Proof = $proof;
                fn advance(self, _: &$proof) -> $to {
                    $to { _priv: () }
                }
            }
        )*
    };
}

stage_chain! {
    Zeroed => PagesUp by PageSys,
    PagesUp => MapsUp by MapSys,
    MapsUp => KernelMapUp by KernelSpace,
    PmapUp => MallocUp by MallocSys,
    MallocUp => PagersUp by PagerSys,
    PagersUp => PoolsUp by PoolSys,
    PoolsUp => KmemUp by Kmem,
    KmemUp => LockObjsUp by LockObjCache,
    LockObjsUp => LoansUp by LoanSys,
    LoansUp => EmapUp by EmapSys,
    KernelPageable => PdPolicyLive by PdPolicy,
    PdPolicyLive => AnonUp by UareaSys,
}

// 以下三步由 uvm_init 自己完成，工作和令牌放在一起

/// 第 1 步：清零全局 VM 单例
pub(crate) fn zero_core(_: PageSizeOk, core: &mut UvmCore) -> Zeroed {
    *core = UvmCore::default();
    Zeroed { _priv: () }
}

/// 第 5 步：内核地图可用之后初始化 pmap
pub(crate) fn pmap_init(_: KernelMapUp, pmap: &mut dyn Pmap, ctx: &PmapInitCtx) -> UvmResult<PmapUp> {
    pmap.init(ctx)?;
    Ok(PmapUp { _priv: () })
}

/// 第 13 步：内核对象换上覆盖整个内核空间的交换哈希，返回被替换的旧存储
pub(crate) fn enable_kernel_pageable(
    _: EmapUp,
    kobj: &mut UvmObject,
    nbuckets: usize,
    storage: SwHashStorage,
) -> (KernelPageable, Option<SwHashStorage>) {
    let old = kobj.enable_kernel_swap(nbuckets, storage);
    (KernelPageable { _priv: () }, old)
}

/// 第 0 步：确认硬件已经设置了页大小
pub(crate) fn check_pagesize(exp: &UvmExp) -> UvmResult<(PageSizeOk, PageGeometry)> {
    if exp.pagesize == 0 {
        return Err(UvmError::PageSizeUnset);
    }
    let geom = PageGeometry::new(exp.pagesize)
        .ok_or(UvmError::PageSizeNotPowerOfTwo(exp.pagesize))?;
    Ok((PageSizeOk { _priv: () }, geom))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VM_MIN_KERNEL_ADDRESS;
    use crate::mm::address::{PhysAddr, VirtAddr};
    use crate::mm::init::test_uvm;
    use crate::mm::object::{AobjFlags, ObjId};
    use crate::pmap::soft::SoftPmap;

    #[test]
    fn page_size_must_be_a_set_power_of_two() {
        let mut exp = UvmExp::default();
        assert_eq!(check_pagesize(&exp).unwrap_err(), UvmError::PageSizeUnset);
        exp.pagesize = 3000;
        assert_eq!(check_pagesize(&exp).unwrap_err(), UvmError::PageSizeNotPowerOfTwo(3000));
        exp.pagesize = 8192;
        assert_eq!(check_pagesize(&exp).unwrap().1.shift, 13);
    }

    #[test]
    fn zeroing_resets_a_used_core() {
        let mut uvm = test_uvm(4096, 16);
        assert!(!uvm.core.is_zeroed());
        let (t, _) = check_pagesize(uvm.exp()).unwrap();
        let _t: Zeroed = zero_core(t, &mut uvm.core);
        assert!(uvm.core.is_zeroed());
    }

    #[test]
    fn failed_pmap_init_yields_no_token() {
        let g = PageGeometry::new(4096).unwrap();
        let mut pmap = SoftPmap::bootstrap(g, PhysAddr(0x8000_0000), 0x20_0000);
        let ctx = PmapInitCtx {
            geom: g,
            npages: 10,
            mem: VirtAddr(VM_MIN_KERNEL_ADDRESS + 0x40_0000),
            size: 4096,
        };
        let r = pmap_init(KernelMapUp { _priv: () }, &mut pmap, &ctx);
        assert!(matches!(r, Err(UvmError::PmapInitFailed(_))));
        assert!(!pmap.is_initialized());
    }

    #[test]
    fn kernel_pageable_installs_the_hash() {
        let mut kobj = UvmObject::uao_create(ObjId::KERNEL, 1 << 16, AobjFlags::KERNOBJ);
        let storage = SwHashStorage {
            va: VirtAddr(0x1000),
            size: 128,
        };
        let (_t, old) = enable_kernel_pageable(EmapUp { _priv: () }, &mut kobj, 16, storage);
        assert_eq!(old, None);
        assert!(kobj.flags().contains(AobjFlags::KERNSWAP));
        assert_eq!(kobj.swhash_nbuckets(), 16);
    }
}
