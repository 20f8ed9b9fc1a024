// 内核虚拟地址空间的上下界
pub const VM_MIN_KERNEL_ADDRESS: usize = 0xffff_ffc0_0000_0000;
pub const VM_MAX_KERNEL_ADDRESS: usize = 0xffff_ffe0_0000_0000;
// 池页的直接映射窗口，位于内核地图之外
pub const PMAP_DIRECT_BASE: usize = 0xffff_ffe0_0000_0000;
pub const PMAP_DIRECT_END: usize = 0xffff_fff0_0000_0000;

// 物理段表容量
pub const VM_PHYSSEG_MAX: usize = 16;
// 空闲页链表的个数，0 号为默认链表
pub const VM_NFREELIST: usize = 2;
pub const VM_FREELIST_DEFAULT: usize = 0;

/// 静态 map entry 池的容量。
///
/// 在 pool 子系统起来之前，内核地图只能从这个数组里拿 entry；
/// 如果启动期耗尽它，就再也没有办法分配新的 entry。
pub const MAX_KMAPENT: usize = 1000;

// 单次 I/O 的最大字节数
pub const MAXPHYS: usize = 64 * 1024;
// pager 临时映射窗口大小
pub const PAGER_MAP_SIZE: usize = 16 * 1024 * 1024;

// 早期 malloc 的 kmem_map 大小界限（字节）
pub const NKMEMPAGES_MIN_BYTES: usize = 8 * 1024 * 1024;
pub const NKMEMPAGES_MAX_BYTES: usize = 128 * 1024 * 1024;
// malloc 最小桶 2^4
pub const MINBUCKET: usize = 4;

// kmem 尺寸类的量子与上限
pub const KMEM_QUANTUM: usize = 8;
pub const KMEM_CACHE_MAXSIZE: usize = 2048;

// 匿名对象交换槽哈希
pub const UAO_SWHASH_CLUSTER_SHIFT: usize = 4;
pub const UAO_SWHASH_CLUSTER_SIZE: usize = 1 << UAO_SWHASH_CLUSTER_SHIFT;
pub const UAO_SWHASH_MAXBUCKETS: usize = 256;
// 小于这个页数的对象直接用数组保存交换槽
pub const UAO_SWHASH_THRESHOLD: usize = UAO_SWHASH_CLUSTER_SIZE * 4;

// uarea（PCB + 内核栈）占用的页数
pub const UPAGES: usize = 2;

// emap 预留的虚拟地址大小
pub const UVM_EMAP_SIZE: usize = 2 * 1024 * 1024;
pub const MAXCPUS: usize = 4;

// 预读窗口
pub const RA_WINSIZE_INIT: usize = MAXPHYS;
pub const RA_WINSIZE_MAX: usize = MAXPHYS * 8;

// page daemon
pub const CLOCK_INACTIVEPCT: usize = 33;
pub const FREEMIN_MIN_BYTES: usize = 16 * 1024;
pub const FREEMIN_MAX_BYTES: usize = 256 * 1024;
pub const RESERVE_PAGEDAEMON: usize = 1;
pub const RESERVE_KERNEL: usize = 5;
