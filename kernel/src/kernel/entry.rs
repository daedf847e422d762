// kernel/src/kernel/entry.rs
//
// exo-kernel: kernel entry glue
//
// 役割:
// - BootInfo から物理メモリと kernel root を取り出し、Kernel を組み立てて install する
// - 組み込み user プログラムを最初の環境として作り、scheduler に渡す
//
// やること:
// - logging → GDT/IDT/PIC → 物理メモリ → Kernel → env_create → sched_yield の順に呼ぶだけ
//
// やらないこと:
// - 環境管理 / trap / syscall の中身（それは Kernel の責務）

use bootloader::BootInfo;

use crate::arch::machine::X86Hal;
use crate::mm::PhysicalMemoryManager;
use crate::types::NENV;
use crate::{arch, logging};

use super::env::Env;
use super::user_program::{build_demo_image, DEMO_IMAGE_MAX};
use super::{state_ref, CpuId, Kernel};

static mut ENVS: [Env; NENV] = [Env::EMPTY; NENV];
static mut DEMO_IMAGE: [u8; DEMO_IMAGE_MAX] = [0; DEMO_IMAGE_MAX];

pub fn start(boot_info: &'static BootInfo) -> ! {
    logging::init(boot_info.physical_memory_offset);
    logging::info("exo-kernel: kernel::start()");

    arch::init();

    let mem = PhysicalMemoryManager::new(boot_info);
    logging::info_u64("free pages", crate::mm::PhysMemory::free_pages(&mem) as u64);

    // Safety: start() は BSP で一度だけ走る。以後 ENVS は Kernel だけが触る
    let envs: &'static mut [Env] = unsafe { &mut *core::ptr::addr_of_mut!(ENVS) };
    let kernel = Kernel::new(X86Hal::new(mem), X86Hal::boot_root(), envs);
    state_ref::install(kernel);

    // Safety: 同上
    let image: &'static mut [u8; DEMO_IMAGE_MAX] = unsafe { &mut *core::ptr::addr_of_mut!(DEMO_IMAGE) };
    let Some(len) = build_demo_image(image) else {
        panic!("demo image does not fit");
    };

    let dispatch = state_ref::with_kernel(|k| {
        match k.env_create(&image[..len]) {
            Ok(id) => logging::info_fmt(format_args!("created first env {}", id)),
            Err(e) => panic!("env_create: {}", e),
        }
        k.debug_check_invariants();
        k.sched_yield(CpuId::BOOT)
    });

    match dispatch {
        Some(d) => arch::follow(d),
        None => arch::halt_loop(),
    }
}
