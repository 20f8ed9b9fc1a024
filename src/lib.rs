//! UVM 虚拟内存子系统的启动核心。
//!
//! 内核主初始化流程调用一次 [`uvm_init`]，它按固定顺序拉起页分配器、
//! 内核地图、pmap、早期 malloc、pager、pool、kmem、锁对象缓存、
//! loan、emap、匿名内存、uarea 和预读子系统。每一步都依赖前一步建立的
//! 不变量，任何一步失败都是致命的。
//!
//! 正常构建是 `no_std + alloc`；`cargo test` 下以 std 运行主机侧模拟，
//! 用 [`pmap::soft::SoftPmap`] 代替真实的页表层。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate bitflags;

#[macro_use]
pub mod console;
pub mod config;
pub mod error;
pub mod kern;
pub mod logging;
pub mod mm;
pub mod pmap;
pub mod sync;

pub use error::{UvmError, UvmResult};
pub use mm::init::{BootObserver, BootStep, UVM, Uvm, UvmCore, uvm_init};
