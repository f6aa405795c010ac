#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod vm;

pub use system::{page_fault_handler, unwrap_vm, vm_init};
pub use vm::{AddressSpace, VmConfig, VmError, VmSystem};
