//! Page fault resolution: lazy loading, swap-in and stack growth.

use super::{AddressSpace, PageType, VmError, VmSystem};
use kidneyos_vm_shared::mem::{
    is_kernel_address, page_round_down, stack_limit, PAGE_FRAME_SIZE, STACK_WORD_SIZE, USER_STACK_TOP,
};
use log::{debug, trace, warn};

/// The part of the interrupted context the fault handler looks at.
#[derive(Clone, Copy, Debug)]
pub struct TrapFrame {
    pub esp: usize,
}

/// Resolves a page fault at `addr`. Returns false if the access was invalid
/// and the faulting process should be terminated.
pub fn handle_fault(
    vm: &VmSystem,
    space: &AddressSpace,
    frame: &TrapFrame,
    addr: usize,
    user: bool,
    write: bool,
    not_present: bool,
) -> bool {
    match try_handle_fault(vm, space, frame, addr, user, write, not_present) {
        Ok(()) => true,
        Err(err) => {
            warn!(
                "{:?}: unresolved fault at {addr:#x} (user={user}, write={write}, not_present={not_present}): {err}",
                space.id()
            );
            false
        }
    }
}

pub fn try_handle_fault(
    vm: &VmSystem,
    space: &AddressSpace,
    frame: &TrapFrame,
    addr: usize,
    user: bool,
    write: bool,
    not_present: bool,
) -> Result<(), VmError> {
    trace!("{:?}: fault at {addr:#x} (write={write})", space.id());
    if user && is_kernel_address(addr) {
        return Err(VmError::InvalidAddress(addr));
    }
    // A protection violation on a present page, e.g. writing a read-only one.
    if !not_present {
        return Err(VmError::InvalidAddress(addr));
    }

    let registered = space.spt().find(addr).is_some();
    if registered {
        return space.claim(vm, addr);
    }

    // A fault in the kernel leaves the kernel's stack pointer in the frame.
    let esp = if is_kernel_address(frame.esp) {
        space.saved_user_stack_pointer()
    } else {
        frame.esp
    };
    if !is_stack_access(addr, esp) {
        return Err(VmError::InvalidAddress(addr));
    }
    grow_stack(vm, space, addr)?;
    space.claim(vm, addr)
}

/// Whether a fault at `addr` with the given stack pointer looks like a push
/// onto the user stack within its size limit.
fn is_stack_access(addr: usize, esp: usize) -> bool {
    addr >= esp.saturating_sub(STACK_WORD_SIZE) && (stack_limit()..USER_STACK_TOP).contains(&addr)
}

/// Extends the stack down one page at a time until it covers `addr`.
fn grow_stack(vm: &VmSystem, space: &AddressSpace, addr: usize) -> Result<(), VmError> {
    let target = page_round_down(addr);
    while space.stack_bottom() > target {
        let va = space.stack_bottom() - PAGE_FRAME_SIZE;
        space.allocate_lazy(va, true, PageType::Stack, None)?;
        if let Err(err) = space.claim(vm, va) {
            if let Err(undo) = space.remove(vm, va) {
                warn!("{:?}: stack growth rollback of {va:#x}: {undo}", space.id());
            }
            return Err(err);
        }
        space.set_stack_bottom(va);
        debug!("{:?}: stack grown to {va:#x}", space.id());
    }
    Ok(())
}
