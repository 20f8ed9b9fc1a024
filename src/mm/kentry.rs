//! 静态 map entry 池
//!
//! 这是 pool/kmem 起来之前唯一的 map entry 来源：一个固定大小的数组加上
//! 空闲下标链表。容量 [`MAX_KMAPENT`] 是手工调好的常量，启动期的内核
//! 地图操作不能把它用完。

use crate::config::MAX_KMAPENT;
use log::trace;

const NIL: u16 = u16::MAX;

pub struct KentryPool {
    /// 空闲链表的后继下标
    next: [u16; MAX_KMAPENT],
    in_use: [bool; MAX_KMAPENT],
    head: u16,
    nfree: usize,
}

impl KentryPool {
    pub fn new() -> Self {
        let mut next = [NIL; MAX_KMAPENT];
        for (i, n) in next.iter_mut().enumerate().take(MAX_KMAPENT - 1) {
            *n = (i + 1) as u16;
        }
        Self {
            next,
            in_use: [false; MAX_KMAPENT],
            head: 0,
            nfree: MAX_KMAPENT,
        }
    }

    pub fn alloc(&mut self) -> Option<u16> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.head = self.next[idx as usize];
        self.in_use[idx as usize] = true;
        self.nfree -= 1;
        trace!("[uvm] kentry {} allocated, {} left", idx, self.nfree);
        Some(idx)
    }

    pub fn free(&mut self, idx: u16) {
        let i = idx as usize;
        if !self.in_use[i] {
            panic!("kentry {} freed twice", idx);
        }
        self.in_use[i] = false;
        self.next[i] = self.head;
        self.head = idx;
        self.nfree += 1;
    }

    pub fn nfree(&self) -> usize {
        self.nfree
    }

    pub fn capacity(&self) -> usize {
        MAX_KMAPENT
    }
}
