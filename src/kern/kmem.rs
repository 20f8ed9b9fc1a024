//! kmem：通用的变长内核堆
//!
//! 小请求按 2 的幂落到 `kmem-N` 尺寸类，每个尺寸类是一个直接映射页上的
//! pool；超过最大尺寸类的请求直接从内核地图分配整页。释放时必须给出
//! 与分配时相同的大小。

use super::pool::{Pool, PoolPageBackend, PoolSys, pool_init};
use crate::config::{KMEM_CACHE_MAXSIZE, KMEM_QUANTUM};
use crate::error::{UvmError, UvmResult};
use crate::mm::address::VirtAddr;
use crate::mm::km::{KmCtx, KmFlags, uvm_km_alloc, uvm_km_free};
use crate::mm::map::VmMap;
use crate::mm::stage::{Advance, KmemUp, PoolsUp};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{info, warn};

const CACHE_NAMES: [&str; 9] = [
    "kmem-8", "kmem-16", "kmem-32", "kmem-64", "kmem-128", "kmem-256", "kmem-512", "kmem-1024",
    "kmem-2048",
];

pub struct Kmem {
    caches: Vec<Pool>,
    maxsize: usize,
    /// 在用的分配：地址 -> 请求大小
    live: BTreeMap<usize, usize>,
}

/// 第 9 步
pub fn kmem_init(pagesize: usize, pools: &mut PoolSys, t: PoolsUp) -> UvmResult<(Kmem, KmemUp)> {
    let maxsize = KMEM_CACHE_MAXSIZE.min(pagesize);
    let mut caches = Vec::new();
    let mut size = KMEM_QUANTUM;
    while size <= maxsize {
        let name = CACHE_NAMES[caches.len()];
        caches.push(pool_init(pools, name, size, size, pagesize)?);
        size <<= 1;
    }
    info!("[kmem] {} size class(es) up to {}", caches.len(), maxsize);
    let kmem = Kmem {
        caches,
        maxsize,
        live: BTreeMap::new(),
    };
    let t = t.advance(&kmem);
    Ok((kmem, t))
}

impl Kmem {
    fn class(&self, size: usize) -> usize {
        let shift = size.max(KMEM_QUANTUM).next_power_of_two().trailing_zeros();
        (shift - KMEM_QUANTUM.trailing_zeros()) as usize
    }

    pub fn cache(&self, name: &str) -> Option<&Pool> {
        self.caches.iter().find(|p| p.name() == name)
    }

    pub fn nlive(&self) -> usize {
        self.live.len()
    }

    fn alloc_inner(
        &mut self,
        kernel_map: &mut VmMap,
        ctx: &mut KmCtx<'_>,
        size: usize,
        zero: bool,
    ) -> UvmResult<VirtAddr> {
        if size == 0 {
            return Err(UvmError::InvalidSize);
        }
        let va = if size <= self.maxsize {
            let class = self.class(size);
            self.caches[class].get(&mut PoolPageBackend {
                pages: ctx.pages,
                pmap: &mut *ctx.pmap,
            })?
        } else {
            let flags = if zero {
                KmFlags::WIRED | KmFlags::ZERO
            } else {
                KmFlags::WIRED
            };
            uvm_km_alloc(kernel_map, ctx, size, 0, flags)?
        };
        self.live.insert(va.0, size);
        Ok(va)
    }

    pub fn kmem_alloc(&mut self, kernel_map: &mut VmMap, ctx: &mut KmCtx<'_>, size: usize) -> UvmResult<VirtAddr> {
        self.alloc_inner(kernel_map, ctx, size, false)
    }

    pub fn kmem_zalloc(&mut self, kernel_map: &mut VmMap, ctx: &mut KmCtx<'_>, size: usize) -> UvmResult<VirtAddr> {
        self.alloc_inner(kernel_map, ctx, size, true)
    }

    pub fn kmem_free(
        &mut self,
        kernel_map: &mut VmMap,
        ctx: &mut KmCtx<'_>,
        va: VirtAddr,
        size: usize,
    ) -> UvmResult<()> {
        if size == 0 {
            return Err(UvmError::InvalidSize);
        }
        match self.live.get(&va.0) {
            Some(&s) if s == size => {}
            other => {
                warn!("[kmem] bad free {:?} size {} (allocated {:?})", va, size, other);
                return Err(UvmError::BadFree);
            }
        }
        if size <= self.maxsize {
            let class = self.class(size);
            self.caches[class].put(va)?;
        } else {
            uvm_km_free(kernel_map, ctx, va, size)?;
        }
        self.live.remove(&va.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::init::test_uvm;

    #[test]
    fn small_sizes_round_to_classes() {
        let mut uvm = test_uvm(4096, 16);
        let (kmem, map, mut ctx) = uvm.kmem_ctx();
        let a = kmem.kmem_alloc(map, &mut ctx, 24).unwrap();
        assert_eq!(a.0 % 32, 0);
        let out = kmem.cache("kmem-32").unwrap().stats().nout;
        assert!(out >= 1);
        kmem.kmem_free(map, &mut ctx, a, 24).unwrap();
        assert_eq!(kmem.cache("kmem-32").unwrap().stats().nout, out - 1);
    }

    #[test]
    fn large_sizes_come_from_the_kernel_map() {
        let mut uvm = test_uvm(4096, 16);
        let (kmem, map, mut ctx) = uvm.kmem_ctx();
        let va = kmem.kmem_zalloc(map, &mut ctx, 10_000).unwrap();
        assert!(map.lookup(va).is_some());
        assert!(ctx.pmap.extract(va.offset(9_999)).is_some());
        kmem.kmem_free(map, &mut ctx, va, 10_000).unwrap();
        assert!(ctx.pmap.extract(va).is_none());
    }

    #[test]
    fn free_checks_size_and_ownership() {
        let mut uvm = test_uvm(4096, 16);
        let (kmem, map, mut ctx) = uvm.kmem_ctx();
        let live = kmem.nlive();
        let va = kmem.kmem_alloc(map, &mut ctx, 100).unwrap();
        assert_eq!(kmem.nlive(), live + 1);
        assert_eq!(kmem.kmem_free(map, &mut ctx, va, 64), Err(UvmError::BadFree));
        assert_eq!(kmem.kmem_free(map, &mut ctx, va, 0), Err(UvmError::InvalidSize));
        kmem.kmem_free(map, &mut ctx, va, 100).unwrap();
        assert_eq!(kmem.nlive(), live);
        assert_eq!(kmem.kmem_free(map, &mut ctx, va, 100), Err(UvmError::BadFree));
        assert_eq!(kmem.kmem_alloc(map, &mut ctx, 0), Err(UvmError::InvalidSize));
    }

    #[test]
    fn small_pages_cap_the_size_classes() {
        let mut uvm = test_uvm(1024, 16);
        let (kmem, _, _) = uvm.kmem_ctx();
        assert!(kmem.cache("kmem-1024").is_some());
        assert!(kmem.cache("kmem-2048").is_none());
    }
}
