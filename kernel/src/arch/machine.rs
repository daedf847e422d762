// kernel/src/arch/machine.rs
//
// 役割:
// - Kernel<H> が要求する Hal（PhysMemory + Platform）の実機実装。
//
// やること:
// - 物理ページ: mm::PhysicalMemoryManager に委譲
// - CR3 / invlpg / CR2: x86_64 crate の register / instruction ラッパ
// - コンソール: logging（VGA + COM1）へ出し、COM1 から読む
// - EOI: 8259 PIC
//
// やらないこと:
// - 複数 CPU の CR3 管理（起動するのは BSP だけなので cpu 引数は見ない）

use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr2, Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame as X86Frame;

use crate::arch::interrupts;
use crate::kernel::trap::print_trapframe;
use crate::kernel::{CpuId, Platform};
use crate::logging;
use crate::mem::addr::{PhysFrame, VirtAddr, PAGE_SIZE};
use crate::mm::{Page, PhysMemory, PhysicalMemoryManager};
use crate::types::TrapFrame;

pub struct X86Hal {
    mem: PhysicalMemoryManager,
}

impl X86Hal {
    pub fn new(mem: PhysicalMemoryManager) -> Self {
        X86Hal { mem }
    }

    /// 起動時の PML4（bootloader が作ったもの）
    pub fn boot_root() -> PhysFrame {
        let (frame, _) = Cr3::read();
        PhysFrame::from_index(frame.start_address().as_u64() / PAGE_SIZE)
    }
}

impl PhysMemory for X86Hal {
    fn alloc_page(&mut self) -> Option<PhysFrame> {
        self.mem.alloc_page()
    }

    fn incref(&mut self, frame: PhysFrame) -> bool {
        self.mem.incref(frame)
    }

    fn decref(&mut self, frame: PhysFrame) {
        self.mem.decref(frame)
    }

    fn ref_count(&self, frame: PhysFrame) -> u16 {
        self.mem.ref_count(frame)
    }

    fn free_pages(&self) -> usize {
        self.mem.free_pages()
    }

    fn page(&self, frame: PhysFrame) -> &Page {
        self.mem.page(frame)
    }

    fn page_mut(&mut self, frame: PhysFrame) -> &mut Page {
        self.mem.page_mut(frame)
    }
}

impl Platform for X86Hal {
    fn load_root(&mut self, _cpu: CpuId, root: PhysFrame) {
        let (current, _) = Cr3::read();
        if current.start_address().as_u64() == root.start_address().0 {
            return;
        }
        let frame = X86Frame::containing_address(x86_64::PhysAddr::new(root.start_address().0));
        // Safety: root は kernel 半分を共有する PML4（new_user がコピー済み）
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    fn invalidate_page(&mut self, root: PhysFrame, va: VirtAddr) {
        let (current, _) = Cr3::read();
        if current.start_address().as_u64() == root.start_address().0 {
            tlb::flush(x86_64::VirtAddr::new(va.0));
        }
    }

    fn fault_address(&self) -> u64 {
        Cr2::read_raw()
    }

    fn console_write(&mut self, bytes: &[u8]) {
        logging::console_write(bytes);
    }

    fn console_getc(&mut self) -> Option<u8> {
        logging::serial_try_read_byte()
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        interrupts::end_of_interrupt(irq);
    }

    fn monitor(&mut self, tf: &TrapFrame) {
        logging::info("breakpoint: no interactive monitor; resuming");
        print_trapframe(CpuId::BOOT, tf, None);
    }
}
