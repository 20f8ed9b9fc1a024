//! uvmexp：全局的 VM 计数与调节参数
//!
//! 页大小由机器相关代码在 `uvm_init` 之前写入；其余计数由各子系统在
//! 启动过程中填充。

use super::address::PageGeometry;

#[derive(Debug, Default, Clone)]
pub struct UvmExp {
    pub pagesize: usize,
    pub pagemask: usize,
    pub pageshift: usize,

    pub npages: usize,
    pub free: usize,
    pub active: usize,
    pub inactive: usize,
    pub wired: usize,

    pub freemin: usize,
    pub freetarg: usize,
    pub inactarg: usize,
    pub wiredmax: usize,
    pub reserve_pagedaemon: usize,
    pub reserve_kernel: usize,
}

impl UvmExp {
    /// 记录硬件页大小。非法的值照样写入，由 `uvm_init` 的第 0 步拒绝。
    pub fn uvm_setpagesize(&mut self, size: usize) {
        self.pagesize = size;
        match PageGeometry::new(size) {
            Some(g) => {
                self.pagemask = g.mask;
                self.pageshift = g.shift;
            }
            None => {
                self.pagemask = 0;
                self.pageshift = 0;
            }
        }
    }

    pub fn geometry(&self) -> Option<PageGeometry> {
        PageGeometry::new(self.pagesize)
    }
}
