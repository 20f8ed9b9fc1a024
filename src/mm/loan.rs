//! 页出借
//!
//! 出借的页对属主变为只读，`loan_count` 归零之前不会回到空闲队列。
//! 全零页由 loan-zero 对象持有，第一次使用时才分配。

use super::km::KmCtx;
use super::map::VmMap;
use super::object::{ObjId, PagerKind, UvmObject};
use super::page::{PageFlags, PageId, PageOwner, PageSys, PgaFlags, PqFlags};
use super::stage::{Advance, LoansUp, LockObjsUp};
use crate::error::{UvmError, UvmResult};
use crate::kern::kmem::Kmem;
use crate::kern::lockobj::{LockObjCache, LockObjId};
use log::{debug, trace};

pub struct LoanSys {
    zero_obj: UvmObject,
    zero_lock: LockObjId,
    zero_page: Option<PageId>,
    nloans: usize,
}

/// 第 11 步：loan-zero 对象的锁来自互斥锁对象缓存
pub fn uvm_loan_init(
    mutex_obj: &mut LockObjCache,
    kmem: &mut Kmem,
    kernel_map: &mut VmMap,
    ctx: &mut KmCtx<'_>,
    t: LockObjsUp,
) -> UvmResult<(LoanSys, LoansUp)> {
    let zero_lock = mutex_obj.alloc(kmem, kernel_map, ctx)?;
    debug!("[loan] loan-zero object lock {:?}", zero_lock);
    let sys = LoanSys {
        zero_obj: UvmObject::new(ObjId::LOANZERO, PagerKind::Aobj, 1),
        zero_lock,
        zero_page: None,
        nloans: 0,
    };
    let t = t.advance(&sys);
    Ok((sys, t))
}

impl LoanSys {
    pub fn zero_lock(&self) -> LockObjId {
        self.zero_lock
    }

    pub fn zero_object(&self) -> &UvmObject {
        &self.zero_obj
    }

    pub fn nloans(&self) -> usize {
        self.nloans
    }

    /// 出借一组页；只要有一页不能出借就整体失败
    pub fn loan(&mut self, pages: &PageSys, ids: &[PageId]) -> UvmResult<()> {
        for &id in ids {
            if !pages.contains(id) {
                return Err(UvmError::NotLoanable);
            }
            let pg = pages.page(id);
            if pg.pqflags.contains(PqFlags::FREE)
                || pg.owner.is_none()
                || pg.flags.intersects(PageFlags::BUSY | PageFlags::RELEASED)
            {
                return Err(UvmError::NotLoanable);
            }
        }
        for &id in ids {
            pages.with_page(id, |pg| {
                pg.loan_count += 1;
                pg.flags.insert(PageFlags::RDONLY);
            });
        }
        self.nloans += ids.len();
        trace!("[loan] {} page(s) loaned", ids.len());
        Ok(())
    }

    /// 归还出借的页。属主已经放弃的页在最后一次归还时释放。
    pub fn unloan(&mut self, pages: &PageSys, ids: &[PageId]) -> UvmResult<()> {
        if ids
            .iter()
            .any(|&id| !pages.contains(id) || pages.page(id).loan_count == 0)
        {
            return Err(UvmError::BadFree);
        }
        for &id in ids {
            let orphan = pages.with_page(id, |pg| {
                pg.loan_count -= 1;
                if pg.loan_count == 0 {
                    pg.flags.remove(PageFlags::RDONLY);
                }
                pg.loan_count == 0 && pg.owner.is_none()
            });
            if orphan {
                pages.free(id);
            }
        }
        self.nloans -= ids.len();
        Ok(())
    }

    /// 借出共享的全零页
    pub fn loan_zero(&mut self, pages: &PageSys) -> UvmResult<PageId> {
        let id = match self.zero_page {
            Some(id) => id,
            None => {
                let id = pages
                    .alloc(Some(PageOwner::Object(ObjId::LOANZERO)), 0, PgaFlags::ZERO)
                    .ok_or(UvmError::OutOfPages)?;
                pages.wire(id)?;
                self.zero_obj.insert_page(0, id);
                self.zero_page = Some(id);
                id
            }
        };
        self.loan(pages, &[id])?;
        Ok(id)
    }
}
