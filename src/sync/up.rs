//! 单处理器内部可变性

use core::cell::{RefCell, RefMut};

/// 只在单处理器、无抢占的阶段使用的可变容器。
///
/// `uvm_init` 运行时调度器和其他 CPU 都还没有启动，用 `RefCell` 的
/// 动态借用检查就足够发现重入。
pub struct UPSafeCell<T> {
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPSafeCell<T> {}

impl<T> UPSafeCell<T> {
    /// # Safety
    ///
    /// 调用者保证只在单处理器上下文中访问。
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// 独占访问，已被借出时 panic
    pub fn exclusive_access(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}
