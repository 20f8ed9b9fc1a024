//! uarea：每个线程的 PCB 与内核栈，钉住在内核地图里

use super::address::VirtAddr;
use super::km::KmCtx;
use super::map::VmMap;
use super::stage::{Advance, AnonUp, PdPolicyLive};
use crate::config::UPAGES;
use crate::error::UvmResult;
use crate::kern::pool::{KmBackend, Pool, PoolSys, pool_init};
use log::info;

pub struct UareaSys {
    pool: Pool,
    uspace: usize,
}

/// 第 15 步后半
pub fn uvm_uarea_init(pools: &mut PoolSys, pagesize: usize, t: PdPolicyLive) -> UvmResult<(UareaSys, AnonUp)> {
    let uspace = UPAGES * pagesize;
    let pool = pool_init(pools, "uarea", uspace, pagesize, uspace)?;
    info!("[uarea] USPACE {:#x}", uspace);
    let sys = UareaSys { pool, uspace };
    let t = t.advance(&sys);
    Ok((sys, t))
}

impl UareaSys {
    pub fn uspace(&self) -> usize {
        self.uspace
    }

    pub fn nout(&self) -> usize {
        self.pool.stats().nout
    }

    pub fn uarea_alloc(&mut self, kernel_map: &mut VmMap, ctx: &mut KmCtx<'_>) -> UvmResult<VirtAddr> {
        self.pool.get(&mut KmBackend { map: kernel_map, ctx })
    }

    pub fn uarea_free(&mut self, va: VirtAddr) -> UvmResult<()> {
        self.pool.put(va)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::UvmError;
    use crate::mm::init::test_uvm;

    #[test]
    fn uarea_is_wired_and_reused() {
        let mut uvm = test_uvm(4096, 16);
        let va = uvm.uarea_alloc().unwrap();
        let uarea = uvm.core.uarea.as_ref().unwrap();
        assert_eq!(uarea.uspace(), 2 * 4096);
        assert_eq!(uarea.nout(), 1);
        let pmap = uvm.pmap().unwrap();
        assert!(pmap.extract(va).is_some());
        assert!(pmap.extract(va.offset(2 * 4096 - 1)).is_some());
        uvm.uarea_free(va).unwrap();
        assert_eq!(uvm.uarea_free(va), Err(UvmError::BadFree));
        assert_eq!(uvm.uarea_alloc().unwrap(), va);
    }
}
