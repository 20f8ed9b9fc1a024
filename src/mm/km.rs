//! 内核虚拟内存：内核地图、内核对象与 uvm_km_* 接口

use super::address::VirtAddr;
use super::map::{EntryObject, MapFlags, MapSys, UvmFlags, VmMap, VmProt};
use super::object::{AobjFlags, ObjId, UvmObject};
use super::page::{KernelVaRange, PageOwner, PageSys, PgaFlags};
use super::stage::{Advance, KernelMapUp, MapsUp};
use crate::config::{VM_MAX_KERNEL_ADDRESS, VM_MIN_KERNEL_ADDRESS};
use crate::error::{UvmError, UvmResult};
use crate::pmap::Pmap;
use log::{error, info, trace};

bitflags! {
    pub struct KmFlags: u8 {
        /// 立即分配并钉住物理页
        const WIRED = 1 << 0;
        /// 页按需分配，可被换出
        const PAGEABLE = 1 << 1;
        /// 只分配虚拟地址
        const VAONLY = 1 << 2;
        const ZERO = 1 << 3;
        /// 失败时安静地返回错误
        const CANFAIL = 1 << 4;
    }
}

/// 内核地图操作需要借用的各个子系统
pub struct KmCtx<'a> {
    pub pages: &'a PageSys,
    pub pmap: &'a mut dyn Pmap,
    pub mapsys: &'a mut MapSys,
    pub kobj: &'a mut UvmObject,
    /// 内核对象是否已经可以换出
    pub kernel_pageable: bool,
}

pub struct KernelSpace {
    pub kernel_map: VmMap,
    pub kernel_object: UvmObject,
}

/// 第 4 步：在页分配器交出的区间上建立内核地图和内核对象。
///
/// 内核地图覆盖 `[VM_MIN_KERNEL_ADDRESS, end)`，其中 `[VM_MIN_KERNEL_ADDRESS, start)`
/// 已被内核镜像和启动期偷取的内存占用，作为一个固定 entry 预留。
pub fn uvm_km_init(
    kva: KernelVaRange,
    mapsys: &mut MapSys,
    pages: &PageSys,
    pmap: &mut dyn Pmap,
    t: MapsUp,
) -> UvmResult<(KernelSpace, KernelMapUp)> {
    let (start, end) = kva.into_bounds();
    let g = pages.geometry();
    let mut kernel_map = VmMap::new(
        "kernel_map",
        VirtAddr(VM_MIN_KERNEL_ADDRESS),
        end,
        MapFlags::PAGEABLE,
    );
    let mut kernel_object = UvmObject::uao_create(
        ObjId::KERNEL,
        g.atop(VM_MAX_KERNEL_ADDRESS - VM_MIN_KERNEL_ADDRESS),
        AobjFlags::KERNOBJ,
    );
    if start.0 > VM_MIN_KERNEL_ADDRESS {
        let mut ctx = KmCtx {
            pages,
            pmap,
            mapsys,
            kobj: &mut kernel_object,
            kernel_pageable: false,
        };
        kernel_map.map(
            &mut ctx,
            VirtAddr(VM_MIN_KERNEL_ADDRESS),
            start.0 - VM_MIN_KERNEL_ADDRESS,
            EntryObject::Kernel,
            Some(0),
            0,
            VmProt::READ | VmProt::WRITE | VmProt::EXECUTE,
            UvmFlags::FIXED | UvmFlags::NOMERGE | UvmFlags::WIRED,
        )?;
    }
    info!(
        "[uvm] kernel_map [{:?}, {:?}), free from {:?}",
        kernel_map.min(),
        kernel_map.max(),
        start
    );
    let kernel = KernelSpace {
        kernel_map,
        kernel_object,
    };
    let t = t.advance(&kernel);
    Ok((kernel, t))
}

/// 在 `map` 中分配 `size` 字节的内核内存
pub fn uvm_km_alloc(
    map: &mut VmMap,
    ctx: &mut KmCtx<'_>,
    size: usize,
    align: usize,
    flags: KmFlags,
) -> UvmResult<VirtAddr> {
    let g = ctx.pages.geometry();
    let size = g.round(size);
    if size == 0 {
        return Err(UvmError::InvalidSize);
    }
    // 内核对象可换出之前，PAGEABLE 的请求也只能钉住
    let wired = flags.contains(KmFlags::WIRED)
        || (!flags.contains(KmFlags::VAONLY)
            && !(flags.contains(KmFlags::PAGEABLE) && ctx.kernel_pageable));
    let object = if flags.contains(KmFlags::VAONLY) {
        EntryObject::None
    } else {
        EntryObject::Kernel
    };
    let uflags = if wired { UvmFlags::WIRED } else { UvmFlags::empty() };
    let hint = map.min();
    let va = match map.map(
        ctx,
        hint,
        size,
        object,
        None,
        align,
        VmProt::READ | VmProt::WRITE,
        uflags,
    ) {
        Ok(va) => va,
        Err(e) => {
            if !flags.contains(KmFlags::CANFAIL) {
                error!("uvm_km_alloc: {} in {}: {}", size, map.name(), e);
            }
            return Err(e);
        }
    };
    if object == EntryObject::None || !wired {
        trace!("[uvm] km_alloc {:?} +{:#x} without pages", va, size);
        return Ok(va);
    }
    if let Err(e) = km_back(ctx, va, size, flags.contains(KmFlags::ZERO)) {
        if !flags.contains(KmFlags::CANFAIL) {
            error!("uvm_km_alloc: out of pages for {} in {}", size, map.name());
        }
        map.unmap(ctx, va, va.offset(size))?;
        return Err(e);
    }
    trace!("[uvm] km_alloc {:?} +{:#x} wired", va, size);
    Ok(va)
}

/// 内核虚拟地址在内核对象中的偏移
pub(crate) fn kobj_offset(va: VirtAddr) -> usize {
    va.0 - VM_MIN_KERNEL_ADDRESS
}

/// 为 `[va, va + size)` 分配钉住的物理页，挂进内核对象并建立映射。
/// 失败时撤销已经完成的部分。
pub(crate) fn km_back(ctx: &mut KmCtx<'_>, va: VirtAddr, size: usize, zero: bool) -> UvmResult<()> {
    let g = ctx.pages.geometry();
    let pgflags = if zero {
        PgaFlags::ZERO | PgaFlags::USERESERVE
    } else {
        PgaFlags::USERESERVE
    };
    for i in 0..g.atop(size) {
        let cur = va.offset(g.ptoa(i));
        let owner = Some(PageOwner::Object(ObjId::KERNEL));
        let Some(id) = ctx.pages.alloc(owner, kobj_offset(cur), pgflags) else {
            km_unback(ctx, va, g.ptoa(i));
            return Err(UvmError::OutOfPages);
        };
        ctx.pages.wire(id)?;
        ctx.kobj.insert_page(kobj_offset(cur), id);
        ctx.pmap
            .kenter_pa(cur, ctx.pages.phys_addr(id), VmProt::READ | VmProt::WRITE);
    }
    ctx.pmap.update();
    Ok(())
}

/// [`km_back`] 的逆操作
pub(crate) fn km_unback(ctx: &mut KmCtx<'_>, va: VirtAddr, size: usize) {
    let g = ctx.pages.geometry();
    let end = va.offset(size);
    let mut cur = va;
    while cur < end {
        if let Some(id) = ctx.kobj.remove_page(kobj_offset(cur)) {
            ctx.pages.free(id);
        }
        cur = cur.offset(g.size);
    }
    if size > 0 {
        ctx.pmap.kremove(va, size);
    }
    ctx.pmap.update();
}

/// 释放 [`uvm_km_alloc`] 分配的内存
pub fn uvm_km_free(map: &mut VmMap, ctx: &mut KmCtx<'_>, va: VirtAddr, size: usize) -> UvmResult<()> {
    let g = ctx.pages.geometry();
    let size = g.round(size);
    if size == 0 || !g.is_aligned(va.0) {
        return Err(UvmError::BadFree);
    }
    let removed = map.unmap(ctx, va, va.offset(size))?;
    if removed.is_empty() {
        return Err(UvmError::BadFree);
    }
    for r in removed {
        if r.object == EntryObject::Kernel {
            km_unback(ctx, r.start, r.end.0 - r.start.0);
        }
    }
    Ok(())
}

/// 从 `parent` 中切出一段作为子地图
pub fn uvm_km_suballoc(
    parent: &mut VmMap,
    ctx: &mut KmCtx<'_>,
    size: usize,
    flags: MapFlags,
    name: &'static str,
) -> UvmResult<VmMap> {
    let size = ctx.pages.geometry().round(size);
    let hint = parent.min();
    let va = parent.map(
        ctx,
        hint,
        size,
        EntryObject::Submap(name),
        None,
        0,
        VmProt::READ | VmProt::WRITE,
        UvmFlags::NOMERGE,
    )?;
    info!("[uvm] {} [{:?}, {:?})", name, va, va.offset(size));
    Ok(VmMap::new(name, va, va.offset(size), flags))
}
