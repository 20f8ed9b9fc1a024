pub mod address;
pub mod anon;
pub mod emap;
pub mod exp;
pub mod init;
pub mod kentry;
pub mod km;
pub mod loan;
pub mod map;
pub mod object;
pub mod page;
pub mod pager;
pub mod pdpolicy;
pub mod readahead;
pub mod stage;
pub mod uarea;

pub use address::{PageGeometry, PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
pub use exp::UvmExp;
pub use km::{KmCtx, KmFlags};
pub use map::{MapFlags, VmMap, VmProt};
pub use object::{ObjId, UvmObject};
pub use page::{PageId, PageOwner, PageStats, PgaFlags, PhysMem};
