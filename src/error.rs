//! UVM 启动与内存分配的错误类型
//!
//! 启动阶段没有任何可以处理“可恢复错误”的上层，[`crate::uvm_init`] 会把
//! 这里的每一种错误都变成 panic；保留具体的变体是为了让主机侧的模拟
//! 能看到到底是哪个前置条件失败了。

use core::fmt;

pub type UvmResult<T> = Result<T, UvmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvmError {
    /// 机器相关代码没有设置页大小
    PageSizeUnset,
    /// 页大小不是 2 的幂
    PageSizeNotPowerOfTwo(usize),
    /// 同一个进程里第二次调用 uvm_init
    AlreadyInitialized,
    /// 没有挂接 pmap
    NoPmap,
    /// 没有可用的物理内存
    NoMemoryFound,
    /// 物理段表已满
    PhysSegOverflow,
    /// 物理段边界不合法
    BadPhysSeg,
    /// 启动期偷取内存失败，参数为请求的页数
    StealFailed(usize),
    /// 页分配器交出的内核虚拟地址区间为空
    EmptyKernelRange,
    /// 内核虚拟地址区间与体系结构早期映射重叠
    KernelRangeOverlap,
    /// 静态 map entry 池耗尽
    MapEntryPoolExhausted,
    /// 地图中没有足够的虚拟地址空间
    NoSpace,
    /// 物理页耗尽
    OutOfPages,
    /// pmap_init 失败
    PmapInitFailed(&'static str),
    /// 依赖的子系统尚未初始化
    NotReady(&'static str),
    /// 释放了不属于该分配器的地址，或者大小不符
    BadFree,
    /// 非法的分配大小
    InvalidSize,
    /// pager_map 和紧急窗口都已占用
    PagerMapFull,
    /// 页不能出借
    NotLoanable,
    /// 交换空间耗尽
    SwapFull,
    /// 页号越界，或者页并未分配
    BadPage,
}

impl fmt::Display for UvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PageSizeUnset => write!(f, "page size not set"),
            Self::PageSizeNotPowerOfTwo(size) => {
                write!(f, "page size {:#x} not a power of two", size)
            }
            Self::AlreadyInitialized => write!(f, "already initialized"),
            Self::NoPmap => write!(f, "no pmap attached"),
            Self::NoMemoryFound => write!(f, "no physical memory found"),
            Self::PhysSegOverflow => write!(f, "too many physical segments"),
            Self::BadPhysSeg => write!(f, "bad physical segment"),
            Self::StealFailed(npages) => write!(f, "unable to steal {} page(s)", npages),
            Self::EmptyKernelRange => write!(f, "empty kernel virtual range"),
            Self::KernelRangeOverlap => {
                write!(f, "kernel virtual range overlaps early mappings")
            }
            Self::MapEntryPoolExhausted => write!(f, "out of static map entries"),
            Self::NoSpace => write!(f, "no virtual space"),
            Self::OutOfPages => write!(f, "out of physical pages"),
            Self::PmapInitFailed(why) => write!(f, "pmap_init failed: {}", why),
            Self::NotReady(what) => write!(f, "{} not initialized", what),
            Self::BadFree => write!(f, "bad free"),
            Self::InvalidSize => write!(f, "invalid size"),
            Self::PagerMapFull => write!(f, "pager map full"),
            Self::NotLoanable => write!(f, "page not loanable"),
            Self::SwapFull => write!(f, "swap space full"),
            Self::BadPage => write!(f, "bad page"),
        }
    }
}
