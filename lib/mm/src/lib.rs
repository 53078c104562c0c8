#![no_std]

extern crate alloc;

pub mod address;
pub mod frame;
pub mod ram;
