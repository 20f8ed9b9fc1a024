//! 内存对象与匿名对象的交换槽
//!
//! 小对象直接用数组记录每页的交换槽；大对象和内核对象用按簇分组的
//! 哈希表。内核对象创建时还没有 kmem，它的哈希表要等到第 13 步才分配。

use super::address::VirtAddr;
use super::page::PageId;
use crate::config::{
    UAO_SWHASH_CLUSTER_SHIFT, UAO_SWHASH_CLUSTER_SIZE, UAO_SWHASH_MAXBUCKETS,
    UAO_SWHASH_THRESHOLD,
};
use crate::error::{UvmError, UvmResult};
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use log::info;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjId(pub u32);

impl ObjId {
    pub const KERNEL: ObjId = ObjId(0);
    pub const LOANZERO: ObjId = ObjId(1);
}

/// 对象背后的 pager
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PagerKind {
    Aobj,
    Device,
    Vnode,
    Ubc,
}

bitflags! {
    pub struct AobjFlags: u8 {
        /// 内核对象
        const KERNOBJ = 1 << 0;
        /// 内核对象的交换哈希已经分配
        const KERNSWAP = 1 << 1;
    }
}

#[derive(Debug, Clone)]
struct SwCluster {
    tag: usize,
    slots: [u32; UAO_SWHASH_CLUSTER_SIZE],
    count: usize,
}

/// 内核对象交换哈希的桶数组在 kmem 中占的块
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwHashStorage {
    pub va: VirtAddr,
    pub size: usize,
}

#[derive(Debug)]
struct SwHash {
    buckets: Vec<Vec<SwCluster>>,
    /// 只有内核对象有，替换哈希时交还给调用者释放
    storage: Option<SwHashStorage>,
}

impl SwHash {
    fn new(nbuckets: usize, storage: Option<SwHashStorage>) -> Self {
        Self {
            buckets: vec![Vec::new(); nbuckets],
            storage,
        }
    }

    fn bucket(&self, idx: usize) -> usize {
        (idx >> UAO_SWHASH_CLUSTER_SHIFT) & (self.buckets.len() - 1)
    }

    fn find(&self, idx: usize) -> u32 {
        let tag = idx >> UAO_SWHASH_CLUSTER_SHIFT;
        self.buckets[self.bucket(idx)]
            .iter()
            .find(|c| c.tag == tag)
            .map_or(0, |c| c.slots[idx & (UAO_SWHASH_CLUSTER_SIZE - 1)])
    }

    fn set(&mut self, idx: usize, slot: u32) -> u32 {
        let tag = idx >> UAO_SWHASH_CLUSTER_SHIFT;
        let sub = idx & (UAO_SWHASH_CLUSTER_SIZE - 1);
        let b = self.bucket(idx);
        let bucket = &mut self.buckets[b];
        let pos = match bucket.iter().position(|c| c.tag == tag) {
            Some(pos) => pos,
            None if slot == 0 => return 0,
            None => {
                bucket.push(SwCluster {
                    tag,
                    slots: [0; UAO_SWHASH_CLUSTER_SIZE],
                    count: 0,
                });
                bucket.len() - 1
            }
        };
        let cluster = &mut bucket[pos];
        let old = cluster.slots[sub];
        cluster.slots[sub] = slot;
        match (old, slot) {
            (0, s) if s != 0 => cluster.count += 1,
            (o, 0) if o != 0 => cluster.count -= 1,
            _ => {}
        }
        if cluster.count == 0 {
            bucket.swap_remove(pos);
        }
        old
    }
}

#[derive(Debug)]
enum SwSlots {
    /// 内核对象在第 13 步之前没有交换槽
    None,
    Array(Vec<u32>),
    Hash(SwHash),
}

/// 交换哈希的桶数：按簇数取不超过上限的 2 的幂
pub fn swhash_buckets(npages: usize) -> usize {
    let n = (npages >> UAO_SWHASH_CLUSTER_SHIFT).clamp(1, UAO_SWHASH_MAXBUCKETS);
    1 << (usize::BITS - 1 - n.leading_zeros())
}

#[derive(Debug)]
pub struct UvmObject {
    id: ObjId,
    kind: PagerKind,
    /// 对象大小（页）
    size: usize,
    flags: AobjFlags,
    pages: BTreeMap<usize, PageId>,
    swslots: SwSlots,
}

impl UvmObject {
    pub fn new(id: ObjId, kind: PagerKind, size: usize) -> Self {
        Self {
            id,
            kind,
            size,
            flags: AobjFlags::empty(),
            pages: BTreeMap::new(),
            swslots: SwSlots::None,
        }
    }

    /// 创建匿名对象
    pub fn uao_create(id: ObjId, size: usize, flags: AobjFlags) -> Self {
        let mut obj = Self::new(id, PagerKind::Aobj, size);
        obj.flags = flags & AobjFlags::KERNOBJ;
        if !flags.contains(AobjFlags::KERNOBJ) {
            obj.swslots = if size > UAO_SWHASH_THRESHOLD {
                SwSlots::Hash(SwHash::new(swhash_buckets(size), None))
            } else {
                SwSlots::Array(vec![0; size])
            };
        }
        obj
    }

    pub fn id(&self) -> ObjId {
        self.id
    }
    pub fn kind(&self) -> PagerKind {
        self.kind
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn flags(&self) -> AobjFlags {
        self.flags
    }

    pub fn insert_page(&mut self, offset: usize, page: PageId) {
        if let Some(old) = self.pages.insert(offset, page) {
            panic!("{:?}: offset {:#x} already has {:?}", self.id, offset, old);
        }
    }
    pub fn remove_page(&mut self, offset: usize) -> Option<PageId> {
        self.pages.remove(&offset)
    }
    pub fn lookup_page(&self, offset: usize) -> Option<PageId> {
        self.pages.get(&offset).copied()
    }
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    /// 内核对象启用交换：装入在 kmem 中分配好的哈希表。
    ///
    /// 已有哈希时按新桶数重新散列，返回旧桶数组的存储交给调用者释放。
    pub(crate) fn enable_kernel_swap(
        &mut self,
        nbuckets: usize,
        storage: SwHashStorage,
    ) -> Option<SwHashStorage> {
        assert!(self.flags.contains(AobjFlags::KERNOBJ));
        let mut hash = SwHash::new(nbuckets, Some(storage));
        let old = match core::mem::replace(&mut self.swslots, SwSlots::None) {
            SwSlots::Hash(old) => {
                for cluster in old.buckets.into_iter().flatten() {
                    let b = cluster.tag & (nbuckets - 1);
                    hash.buckets[b].push(cluster);
                }
                old.storage
            }
            _ => None,
        };
        self.swslots = SwSlots::Hash(hash);
        self.flags.insert(AobjFlags::KERNSWAP);
        info!(
            "[uvm] kernel object swap hash: {} bucket(s) at {:?}",
            nbuckets, storage.va
        );
        old
    }

    pub fn swhash_storage(&self) -> Option<SwHashStorage> {
        match &self.swslots {
            SwSlots::Hash(h) => h.storage,
            _ => None,
        }
    }

    pub fn swhash_nbuckets(&self) -> usize {
        match &self.swslots {
            SwSlots::Hash(h) => h.buckets.len(),
            _ => 0,
        }
    }

    /// 设置第 `idx` 页的交换槽，返回旧值；0 表示没有槽
    pub fn uao_set_swslot(&mut self, idx: usize, slot: u32) -> UvmResult<u32> {
        if idx >= self.size {
            return Err(UvmError::InvalidSize);
        }
        match &mut self.swslots {
            SwSlots::None => Err(UvmError::NotReady("kernel object swap")),
            SwSlots::Array(a) => Ok(core::mem::replace(&mut a[idx], slot)),
            SwSlots::Hash(h) => Ok(h.set(idx, slot)),
        }
    }

    pub fn uao_find_swslot(&self, idx: usize) -> u32 {
        match &self.swslots {
            SwSlots::None => 0,
            SwSlots::Array(a) => a.get(idx).copied().unwrap_or(0),
            SwSlots::Hash(h) => h.find(idx),
        }
    }
}
