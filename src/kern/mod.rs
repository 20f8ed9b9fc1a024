//! UVM 启动时拉起的内核分配器：早期 malloc、pool、kmem 与锁对象缓存

pub mod kmem;
pub mod lockobj;
pub mod malloc;
pub mod pool;
