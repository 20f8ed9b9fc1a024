//! 匿名内存
//!
//! 每个 anon 是 `anonpl` pool 中的一项，以它的地址为标识；它最多持有
//! 一个物理页或一个交换槽。

use super::address::VirtAddr;
use super::page::{PageId, PageOwner, PageSys, PgaFlags};
use super::stage::PdPolicyLive;
use crate::error::{UvmError, UvmResult};
use crate::kern::pool::{Pool, PoolPageBackend, PoolSys, pool_init};
use crate::pmap::Pmap;
use alloc::collections::BTreeMap;
use log::info;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnonId(pub VirtAddr);

#[derive(Debug, Clone, Default)]
pub struct VmAnon {
    pub refs: u32,
    pub page: Option<PageId>,
    pub swslot: u32,
}

pub struct AnonSys {
    pool: Pool,
    anons: BTreeMap<AnonId, VmAnon>,
}

/// 第 15 步前半
pub fn uvm_anon_init(pools: &mut PoolSys, pagesize: usize, _: &PdPolicyLive) -> UvmResult<AnonSys> {
    let pool = pool_init(pools, "anonpl", core::mem::size_of::<VmAnon>(), 0, pagesize)?;
    info!("[anon] anonpl: {} byte anon(s)", pool.size());
    Ok(AnonSys {
        pool,
        anons: BTreeMap::new(),
    })
}

impl AnonSys {
    pub fn nanons(&self) -> usize {
        self.anons.len()
    }

    pub fn anon(&self, id: AnonId) -> Option<&VmAnon> {
        self.anons.get(&id)
    }

    pub fn analloc(&mut self, pages: &PageSys, pmap: &mut dyn Pmap) -> UvmResult<AnonId> {
        let va = self.pool.get(&mut PoolPageBackend { pages, pmap })?;
        let id = AnonId(va);
        self.anons.insert(
            id,
            VmAnon {
                refs: 1,
                ..VmAnon::default()
            },
        );
        Ok(id)
    }

    pub fn anref(&mut self, id: AnonId) -> UvmResult<()> {
        let anon = self.anons.get_mut(&id).ok_or(UvmError::BadFree)?;
        anon.refs += 1;
        Ok(())
    }

    /// 给 anon 分配一个清零的页
    pub fn pagealloc(&mut self, pages: &PageSys, id: AnonId) -> UvmResult<PageId> {
        let anon = self.anons.get_mut(&id).ok_or(UvmError::BadFree)?;
        if let Some(pg) = anon.page {
            return Ok(pg);
        }
        let pg = pages
            .alloc(Some(PageOwner::Anon(id)), 0, PgaFlags::ZERO)
            .ok_or(UvmError::OutOfPages)?;
        pages.activate(pg);
        anon.page = Some(pg);
        Ok(pg)
    }

    /// 放掉一个引用；最后一个引用时释放页并归还 anon，返回 `true`
    pub fn anfree(&mut self, pages: &PageSys, id: AnonId) -> UvmResult<bool> {
        let anon = self.anons.get_mut(&id).ok_or(UvmError::BadFree)?;
        anon.refs -= 1;
        if anon.refs > 0 {
            return Ok(false);
        }
        if let Some(pg) = anon.page.take() {
            pages.free(pg);
        }
        self.anons.remove(&id);
        self.pool.put(id.0)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::mm::page::PqFlags;
    use crate::mm::init::test_uvm;

    #[test]
    fn anon_page_is_freed_with_last_reference() {
        let mut uvm = test_uvm(4096, 16);
        let id = uvm.analloc().unwrap();
        assert_eq!(uvm.core.anon.as_ref().unwrap().nanons(), 1);
        uvm.anref(id).unwrap();
        let pg = uvm.anon_pagealloc(id).unwrap();
        assert_eq!(uvm.anon_pagealloc(id).unwrap(), pg);
        assert!(!uvm.anfree(id).unwrap());
        assert!(uvm.anfree(id).unwrap());
        let pages = uvm.core.page.as_ref().unwrap();
        assert!(pages.page(pg).pqflags.contains(PqFlags::FREE));
        assert!(uvm.core.anon.as_ref().unwrap().anon(id).is_none());
        assert_eq!(uvm.core.anon.as_ref().unwrap().nanons(), 0);
    }
}
