use uvm::config::VM_FREELIST_DEFAULT;
use uvm::mm::{PageGeometry, PhysAddr};
use uvm::pmap::soft::SoftPmap;
use uvm::{UVM, uvm_init};

#[test]
#[should_panic(expected = "uvm_init: already initialized")]
fn global_init_runs_once() {
    let _ = uvm::logging::init();
    {
        let mut uvm = UVM.exclusive_access();
        let g = PageGeometry::new(4096).unwrap();
        uvm.uvm_setpagesize(g.size);
        let start = g.atop(0x8020_0000);
        let end = g.atop(0x8400_0000);
        uvm.uvm_page_physload(start, end, start, end, VM_FREELIST_DEFAULT)
            .unwrap();
        uvm.attach_pmap(Box::new(SoftPmap::bootstrap(g, PhysAddr(0x8000_0000), 2 << 20)));
    }
    uvm_init();
    assert!(UVM.exclusive_access().is_booted());
    assert!(uvm::console::contents().contains("step 16: uvm_ra_init"));
    uvm_init();
}
