//! 锁对象缓存
//!
//! 引用计数的互斥锁 / 读写锁对象，存储来自 kmem。最后一个引用释放时
//! 对象才真正归还。

use super::kmem::Kmem;
use crate::error::{UvmError, UvmResult};
use crate::mm::address::VirtAddr;
use crate::mm::km::KmCtx;
use crate::mm::map::VmMap;
use crate::mm::stage::{Advance, KmemUp, LockObjsUp};
use alloc::collections::BTreeMap;
use log::debug;
use spin::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockObjKind {
    Mutex,
    RwLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockObjId(pub VirtAddr);

enum LockObj {
    Mutex(Mutex<()>),
    RwLock(RwLock<()>),
}

struct Slot {
    refcnt: u32,
    lock: LockObj,
}

pub struct LockObjCache {
    kind: LockObjKind,
    objsize: usize,
    objs: BTreeMap<LockObjId, Slot>,
}

impl LockObjCache {
    fn new(kind: LockObjKind) -> Self {
        let objsize = match kind {
            LockObjKind::Mutex => core::mem::size_of::<(Mutex<()>, u32)>(),
            LockObjKind::RwLock => core::mem::size_of::<(RwLock<()>, u32)>(),
        };
        debug!("[lockobj] {:?} cache, {} byte object(s)", kind, objsize);
        Self {
            kind,
            objsize,
            objs: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> LockObjKind {
        self.kind
    }

    pub fn nobjs(&self) -> usize {
        self.objs.len()
    }

    pub fn alloc(&mut self, kmem: &mut Kmem, kernel_map: &mut VmMap, ctx: &mut KmCtx<'_>) -> UvmResult<LockObjId> {
        let va = kmem.kmem_alloc(kernel_map, ctx, self.objsize)?;
        let lock = match self.kind {
            LockObjKind::Mutex => LockObj::Mutex(Mutex::new(())),
            LockObjKind::RwLock => LockObj::RwLock(RwLock::new(())),
        };
        let id = LockObjId(va);
        self.objs.insert(id, Slot { refcnt: 1, lock });
        Ok(id)
    }

    pub fn hold(&mut self, id: LockObjId) -> UvmResult<()> {
        let slot = self.objs.get_mut(&id).ok_or(UvmError::BadFree)?;
        slot.refcnt += 1;
        Ok(())
    }

    /// 放掉一个引用，最后一个引用时返回 `true`
    pub fn free(
        &mut self,
        kmem: &mut Kmem,
        kernel_map: &mut VmMap,
        ctx: &mut KmCtx<'_>,
        id: LockObjId,
    ) -> UvmResult<bool> {
        let slot = self.objs.get_mut(&id).ok_or(UvmError::BadFree)?;
        slot.refcnt -= 1;
        if slot.refcnt > 0 {
            return Ok(false);
        }
        self.objs.remove(&id);
        kmem.kmem_free(kernel_map, ctx, id.0, self.objsize)?;
        Ok(true)
    }

    pub fn refcnt(&self, id: LockObjId) -> Option<u32> {
        self.objs.get(&id).map(|s| s.refcnt)
    }

    pub fn mutex(&self, id: LockObjId) -> Option<&Mutex<()>> {
        match self.objs.get(&id).map(|s| &s.lock) {
            Some(LockObj::Mutex(m)) => Some(m),
            _ => None,
        }
    }

    pub fn rwlock(&self, id: LockObjId) -> Option<&RwLock<()>> {
        match self.objs.get(&id).map(|s| &s.lock) {
            Some(LockObj::RwLock(l)) => Some(l),
            _ => None,
        }
    }
}

/// 第 10 步前半
pub fn mutex_obj_init(_: &KmemUp) -> LockObjCache {
    LockObjCache::new(LockObjKind::Mutex)
}

/// 第 10 步后半
pub fn rw_obj_init(t: KmemUp) -> (LockObjCache, LockObjsUp) {
    let cache = LockObjCache::new(LockObjKind::RwLock);
    let t = t.advance(&cache);
    (cache, t)
}
