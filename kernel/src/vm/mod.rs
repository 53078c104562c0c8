pub mod addr_space;
pub mod elf;
pub mod fault;
pub mod frame_cache;
pub mod memobj;
pub mod page_table;
pub mod pageout;
pub mod uaccess;
pub mod vm_area;
