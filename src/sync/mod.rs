//! 同步原语
//!
//! 启动期单核使用 [`UPSafeCell`]；启动完成后全内核共享的队列锁用
//! `spin::Mutex`。

mod up;

pub use up::UPSafeCell;
