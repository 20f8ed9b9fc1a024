//! 空闲页队列与活跃/非活跃页队列

use super::{PageId, VmPage};
use crate::config::VM_NFREELIST;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// 空闲页分配器的 trait 定义
pub trait FrameAllocator {
    fn alloc(&mut self) -> Option<PageId>;
    fn dealloc(&mut self, id: PageId);
    fn nfree(&self) -> usize;
}

/// 一个物理段内的空闲页栈
pub struct StackFrameAllocator {
    /// 段内第一个页的编号
    base: usize,
    /// 尚未分配过的页从这里开始，只增不减
    current: usize,
    /// 段的结束编号
    end: usize,
    /// 已回收的页，优先从这里分配
    recycled: Vec<usize>,
}

impl StackFrameAllocator {
    /// 管理页帧数据库中 `[l, r)` 范围的页
    pub fn new(l: usize, r: usize) -> Self {
        Self {
            base: l,
            current: l,
            end: r,
            recycled: Vec::new(),
        }
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.base <= id.0 && id.0 < self.end
    }
}

impl FrameAllocator for StackFrameAllocator {
    fn alloc(&mut self) -> Option<PageId> {
        if let Some(id) = self.recycled.pop() {
            Some(PageId(id))
        } else if self.current == self.end {
            None
        } else {
            self.current += 1;
            Some(PageId(self.current - 1))
        }
    }

    fn dealloc(&mut self, id: PageId) {
        let id = id.0;
        // 编号必须已经分配出去过，并且不在回收列表里
        if id >= self.current || self.recycled.iter().any(|&v| v == id) {
            panic!("Page {:#x} has not been allocated!", id);
        }
        self.recycled.push(id);
    }

    fn nfree(&self) -> usize {
        self.end - self.current + self.recycled.len()
    }
}

/// 全部空闲页，由 free-page-queue 锁保护
pub struct FreeQueues {
    lists: [Vec<StackFrameAllocator>; VM_NFREELIST],
    nfree: usize,
}

impl FreeQueues {
    pub fn new() -> Self {
        Self {
            lists: core::array::from_fn(|_| Vec::new()),
            nfree: 0,
        }
    }

    pub fn add_segment(&mut self, free_list: usize, first: usize, end: usize) {
        self.nfree += end - first;
        self.lists[free_list].push(StackFrameAllocator::new(first, end));
    }

    /// 按链表顺序分配，默认链表优先
    pub fn alloc(&mut self) -> Option<PageId> {
        for list in self.lists.iter_mut() {
            for seg in list.iter_mut() {
                if let Some(id) = seg.alloc() {
                    self.nfree -= 1;
                    return Some(id);
                }
            }
        }
        None
    }

    /// 只从指定的空闲链表分配
    #[cfg(test)]
    pub fn alloc_from(&mut self, free_list: usize) -> Option<PageId> {
        let id = self.lists[free_list].iter_mut().find_map(|seg| seg.alloc())?;
        self.nfree -= 1;
        Some(id)
    }

    pub fn dealloc(&mut self, id: PageId) {
        let seg = self
            .lists
            .iter_mut()
            .flat_map(|list| list.iter_mut())
            .find(|seg| seg.contains(id));
        match seg {
            Some(seg) => seg.dealloc(id),
            None => panic!("Page {:#x} is not managed by any free list!", id.0),
        }
        self.nfree += 1;
    }

    pub fn nfree(&self) -> usize {
        self.nfree
    }

    /// 某一条空闲链表上的页数
    pub fn nfree_list(&self, free_list: usize) -> usize {
        self.lists[free_list].iter().map(|seg| seg.nfree()).sum()
    }
}

/// 页帧数据库与分页队列，由 page-queue 锁保护
pub struct PageQueues {
    pub pages: Vec<VmPage>,
    pub active: VecDeque<PageId>,
    pub inactive: VecDeque<PageId>,
    pub nwired: usize,
}

impl PageQueues {
    pub fn new(pages: Vec<VmPage>) -> Self {
        Self {
            pages,
            active: VecDeque::new(),
            inactive: VecDeque::new(),
            nwired: 0,
        }
    }

    /// 把页从活跃/非活跃队列中摘下
    pub fn dequeue(&mut self, id: PageId) {
        use super::PqFlags;
        let pg = &mut self.pages[id.0];
        if pg.pqflags.contains(PqFlags::ACTIVE) {
            pg.pqflags.remove(PqFlags::ACTIVE);
            self.active.retain(|&p| p != id);
        }
        if pg.pqflags.contains(PqFlags::INACTIVE) {
            pg.pqflags.remove(PqFlags::INACTIVE);
            self.inactive.retain(|&p| p != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_allocator_recycles_first() {
        let mut a = StackFrameAllocator::new(10, 13);
        let x = a.alloc().unwrap();
        let y = a.alloc().unwrap();
        assert_eq!((x, y), (PageId(10), PageId(11)));
        a.dealloc(x);
        assert_eq!(a.nfree(), 2);
        assert_eq!(a.alloc(), Some(PageId(10)));
        assert_eq!(a.alloc(), Some(PageId(12)));
        assert_eq!(a.alloc(), None);
    }

    #[test]
    #[should_panic(expected = "has not been allocated")]
    fn stack_allocator_double_free_panics() {
        let mut a = StackFrameAllocator::new(0, 4);
        let x = a.alloc().unwrap();
        a.dealloc(x);
        a.dealloc(x);
    }

    #[test]
    fn free_queues_prefer_default_list() {
        let mut fq = FreeQueues::new();
        fq.add_segment(1, 0, 2);
        fq.add_segment(0, 2, 4);
        assert_eq!(fq.nfree(), 4);
        assert_eq!(fq.alloc(), Some(PageId(2)));
        assert_eq!(fq.alloc_from(1), Some(PageId(0)));
        assert_eq!(fq.nfree_list(0), 1);
        fq.dealloc(PageId(2));
        assert_eq!(fq.nfree(), 3);
    }
}
