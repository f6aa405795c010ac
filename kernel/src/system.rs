use crate::{
    block::BlockDevice,
    vm::{handle_fault, AddressSpace, TrapFrame, VmConfig, VmSystem},
};
use alloc::boxed::Box;
use kidneyos_vm_shared::paging::PageFaultErrorCode;
use once_cell::race::OnceBox;

static VM: OnceBox<VmSystem> = OnceBox::new();

/// Sets up the user frame pool and swap. Must be called once, before the
/// first user process starts.
pub fn vm_init(config: VmConfig, swap_device: Box<dyn BlockDevice>) -> &'static VmSystem {
    if VM.set(Box::new(VmSystem::new(config, swap_device))).is_err() {
        panic!("vm_init called twice");
    }
    unwrap_vm()
}

pub fn unwrap_vm() -> &'static VmSystem {
    VM.get().expect("VM not initialized.")
}

/// Entry point from the page fault exception. `fault_addr` is the value of
/// `cr2`. Returns false if the faulting process must be killed.
pub fn page_fault_handler(
    space: &AddressSpace,
    frame: &TrapFrame,
    fault_addr: usize,
    error_code: PageFaultErrorCode,
) -> bool {
    handle_fault(
        unwrap_vm(),
        space,
        frame,
        fault_addr,
        error_code.user(),
        error_code.write(),
        error_code.not_present(),
    )
}
