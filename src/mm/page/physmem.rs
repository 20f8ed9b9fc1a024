//! 物理内存段表
//!
//! 机器相关代码在 `uvm_init` 之前通过 [`PhysMem::uvm_page_physload`]
//! 报告发现的物理内存；页帧数据库建立之前需要的内存也从这里偷取。

use crate::config::{VM_NFREELIST, VM_PHYSSEG_MAX};
use crate::error::{UvmError, UvmResult};
use alloc::vec::Vec;
use log::{debug, error};

/// 一段物理内存，单位均为页帧号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysSeg {
    pub start: usize,
    pub end: usize,
    /// 可供分配的部分，`[start, avail_start)` 通常是内核镜像
    pub avail_start: usize,
    pub avail_end: usize,
    pub free_list: usize,
}

impl PhysSeg {
    pub fn avail_pages(&self) -> usize {
        self.avail_end - self.avail_start
    }
}

#[derive(Debug, Default)]
pub struct PhysMem {
    /// 按起始页帧号排序
    segs: Vec<PhysSeg>,
}

impl PhysMem {
    pub fn new() -> Self {
        Self { segs: Vec::new() }
    }

    /// 登记一段物理内存
    pub fn uvm_page_physload(
        &mut self,
        start: usize,
        end: usize,
        avail_start: usize,
        avail_end: usize,
        free_list: usize,
    ) -> UvmResult<()> {
        if free_list >= VM_NFREELIST {
            error!("uvm_page_physload: bad free list {}", free_list);
            return Err(UvmError::BadPhysSeg);
        }
        if start >= end || start > avail_start || avail_start > avail_end || avail_end > end {
            error!(
                "uvm_page_physload: bad segment [{:#x}, {:#x}) avail [{:#x}, {:#x})",
                start, end, avail_start, avail_end
            );
            return Err(UvmError::BadPhysSeg);
        }
        if self.segs.len() >= VM_PHYSSEG_MAX {
            error!(
                "uvm_page_physload: unable to load physical memory segment [{:#x}, {:#x})",
                start, end
            );
            return Err(UvmError::PhysSegOverflow);
        }
        if self.segs.iter().any(|s| start < s.end && s.start < end) {
            error!("uvm_page_physload: segment [{:#x}, {:#x}) overlaps", start, end);
            return Err(UvmError::BadPhysSeg);
        }
        let pos = self.segs.partition_point(|s| s.start < start);
        self.segs.insert(
            pos,
            PhysSeg {
                start,
                end,
                avail_start,
                avail_end,
                free_list,
            },
        );
        debug!(
            "[uvm] physload [{:#x}, {:#x}) free list {}",
            avail_start, avail_end, free_list
        );
        Ok(())
    }

    pub fn segs(&self) -> &[PhysSeg] {
        &self.segs
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn avail_pages(&self) -> usize {
        self.segs.iter().map(PhysSeg::avail_pages).sum()
    }

    /// 在页帧数据库存在之前偷取 `npgs` 个连续物理页，返回首个页帧号。
    ///
    /// 可用部分紧接段首时从头部偷取，紧接段尾时从尾部偷取。偷空的段从表中
    /// 移除；不能偷空最后一个段。失败时段表保持原样。
    pub(crate) fn steal(&mut self, npgs: usize) -> UvmResult<usize> {
        let fits = |s: &PhysSeg| s.avail_pages() >= npgs;
        let (idx, from_head) = match self
            .segs
            .iter()
            .position(|s| s.avail_start == s.start && fits(s))
        {
            Some(idx) => (idx, true),
            None => match self.segs.iter().position(|s| s.avail_end == s.end && fits(s)) {
                Some(idx) => (idx, false),
                None => return Err(UvmError::StealFailed(npgs)),
            },
        };
        let seg = &self.segs[idx];
        let drained = seg.avail_pages() == npgs && seg.end - seg.start == npgs;
        if drained && self.segs.len() == 1 {
            return Err(UvmError::StealFailed(npgs));
        }
        let seg = &mut self.segs[idx];
        let pfn = if from_head {
            let pfn = seg.avail_start;
            seg.avail_start += npgs;
            seg.start += npgs;
            pfn
        } else {
            seg.avail_end -= npgs;
            seg.end -= npgs;
            seg.avail_end
        };
        if drained {
            self.segs.remove(idx);
        }
        Ok(pfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physload_keeps_segments_sorted() {
        let mut pm = PhysMem::new();
        pm.uvm_page_physload(0x800, 0x900, 0x800, 0x900, 0).unwrap();
        pm.uvm_page_physload(0x100, 0x200, 0x120, 0x200, 0).unwrap();
        assert_eq!(pm.segs()[0].start, 0x100);
        assert_eq!(pm.avail_pages(), 0x100 + 0xe0);
    }

    #[test]
    fn physload_rejects_bad_segments() {
        let mut pm = PhysMem::new();
        assert_eq!(
            pm.uvm_page_physload(0x200, 0x100, 0x200, 0x100, 0),
            Err(UvmError::BadPhysSeg)
        );
        assert_eq!(
            pm.uvm_page_physload(0x100, 0x200, 0x100, 0x300, 0),
            Err(UvmError::BadPhysSeg)
        );
        pm.uvm_page_physload(0x100, 0x200, 0x100, 0x200, 0).unwrap();
        assert_eq!(
            pm.uvm_page_physload(0x180, 0x280, 0x180, 0x280, 0),
            Err(UvmError::BadPhysSeg)
        );
        for i in 1..VM_PHYSSEG_MAX {
            let base = 0x1000 * i;
            pm.uvm_page_physload(base, base + 1, base, base + 1, 0).unwrap();
        }
        assert_eq!(
            pm.uvm_page_physload(0x100000, 0x100001, 0x100000, 0x100001, 0),
            Err(UvmError::PhysSegOverflow)
        );
    }

    #[test]
    fn steal_skips_segments_with_reserved_head() {
        let mut pm = PhysMem::new();
        pm.uvm_page_physload(0x100, 0x200, 0x110, 0x200, 0).unwrap();
        pm.uvm_page_physload(0x400, 0x500, 0x400, 0x500, 0).unwrap();
        assert_eq!(pm.steal(0x10), Ok(0x400));
        assert_eq!(pm.segs()[1].avail_start, 0x410);
        assert_eq!(pm.steal(0x1000), Err(UvmError::StealFailed(0x1000)));
    }

    #[test]
    fn steal_takes_from_segment_tail() {
        let mut pm = PhysMem::new();
        pm.uvm_page_physload(0x100, 0x200, 0x110, 0x200, 0).unwrap();
        assert_eq!(pm.steal(0x20), Ok(0x1e0));
        let seg = pm.segs()[0];
        assert_eq!((seg.avail_end, seg.end), (0x1e0, 0x1e0));
        assert_eq!(seg.avail_start, 0x110);
    }

    #[test]
    fn failed_steal_leaves_segments_alone() {
        let mut pm = PhysMem::new();
        pm.uvm_page_physload(0x100, 0x110, 0x100, 0x110, 0).unwrap();
        let before = pm.segs().to_vec();
        assert_eq!(pm.steal(0x10), Err(UvmError::StealFailed(0x10)));
        assert_eq!(pm.segs(), &before[..]);
        assert_eq!(pm.steal(0x8), Ok(0x100));

        pm.uvm_page_physload(0x400, 0x404, 0x400, 0x404, 0).unwrap();
        assert_eq!(pm.steal(0x4), Ok(0x108));
        assert_eq!(pm.segs().len(), 2);
        assert_eq!(pm.steal(0x4), Ok(0x10c));
        assert_eq!(pm.segs().len(), 1);
        assert_eq!(pm.segs()[0].start, 0x400);
    }
}
