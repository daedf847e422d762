// kernel/src/main.rs
//
// 実機イメージのエントリ。bootloader から BootInfo を受け取り kernel::entry へ渡すだけ。
// host ビルドでは空の main（コアは lib 側のテストで動かす）。

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use bootloader::{entry_point, BootInfo};

    entry_point!(kernel_main);

    fn kernel_main(boot_info: &'static BootInfo) -> ! {
        exo_kernel::kernel::entry::start(boot_info)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("exo-kernel: build for the x86_64-exo target to get a bootable image");
}
