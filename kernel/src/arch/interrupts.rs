// kernel/src/arch/interrupts.rs
//
// 役割:
// - IDT を初期化し、全ベクタを asm の trap 入口 stub に向ける。
// - stub は TrapFrame（types::TrapFrame と同じ並び）をスタック上に組み、trap_entry に渡す。
// - 8259 PIC を IRQ_OFFSET(32) へ再配置し、timer だけ通す。
//
// 設計方針:
// - 例外も割り込みも syscall も同じ形の TrapFrame で Kernel::trap() に集める
// - int 0x30 と breakpoint だけ DPL3（user から呼べる）
// - Kernel::trap() はロック内、iretq / hlt はロック外
//
// 重要:
// - x86-interrupt ABI は汎用レジスタを見せてくれないので、入口は global_asm で書く。
// - CPU がエラーコードを積まないベクタは stub が 0 を積んで形を揃える。

use core::mem::MaybeUninit;

use x86_64::instructions::port::Port;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::arch::gdt;
use crate::kernel::{state_ref, CpuId};
use crate::logging;
use crate::types::{TrapFrame, GD_KD, IRQ_OFFSET, IRQ_TIMER, T_BRKPT, T_SYSCALL};

static mut IDT: MaybeUninit<InterruptDescriptorTable> = MaybeUninit::uninit();

// ---- trap 入口 stub ----
//
// alltraps 後のスタック（低位から）:
//   r15 .. rax (15 words), es, ds, trapno, err, rip, cs, rflags, rsp, ss

core::arch::global_asm!(
    r#"
.macro TRAP_EC name, num
.global \name
\name:
    push \num
    jmp exo_alltraps
.endm

.macro TRAP_NOEC name, num
.global \name
\name:
    push 0
    push \num
    jmp exo_alltraps
.endm

TRAP_NOEC exo_th_divide, 0
TRAP_NOEC exo_th_debug, 1
TRAP_NOEC exo_th_nmi, 2
TRAP_NOEC exo_th_brkpt, 3
TRAP_NOEC exo_th_oflow, 4
TRAP_NOEC exo_th_bound, 5
TRAP_NOEC exo_th_illop, 6
TRAP_NOEC exo_th_device, 7
TRAP_EC   exo_th_dblflt, 8
TRAP_EC   exo_th_tss, 10
TRAP_EC   exo_th_segnp, 11
TRAP_EC   exo_th_stack, 12
TRAP_EC   exo_th_gpflt, 13
TRAP_EC   exo_th_pgflt, 14
TRAP_NOEC exo_th_fperr, 16
TRAP_EC   exo_th_align, 17
TRAP_NOEC exo_th_mchk, 18
TRAP_NOEC exo_th_simderr, 19

TRAP_NOEC exo_th_irq0, 32
TRAP_NOEC exo_th_irq1, 33
TRAP_NOEC exo_th_irq2, 34
TRAP_NOEC exo_th_irq3, 35
TRAP_NOEC exo_th_irq4, 36
TRAP_NOEC exo_th_irq5, 37
TRAP_NOEC exo_th_irq6, 38
TRAP_NOEC exo_th_irq7, 39
TRAP_NOEC exo_th_irq8, 40
TRAP_NOEC exo_th_irq9, 41
TRAP_NOEC exo_th_irq10, 42
TRAP_NOEC exo_th_irq11, 43
TRAP_NOEC exo_th_irq12, 44
TRAP_NOEC exo_th_irq13, 45
TRAP_NOEC exo_th_irq14, 46
TRAP_NOEC exo_th_irq15, 47

TRAP_NOEC exo_th_syscall, 48

exo_alltraps:
    sub rsp, 16
    push rax
    push rbx
    push rcx
    push rdx
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    xor eax, eax
    mov ax, es
    mov [rsp + 120], rax
    mov ax, ds
    mov [rsp + 128], rax
    mov ax, {kdata}
    mov ds, ax
    mov es, ax
    cld
    mov rdi, rsp
    call exo_trap_entry
    ud2
"#,
    kdata = const GD_KD,
);

extern "C" {
    fn exo_th_divide();
    fn exo_th_debug();
    fn exo_th_nmi();
    fn exo_th_brkpt();
    fn exo_th_oflow();
    fn exo_th_bound();
    fn exo_th_illop();
    fn exo_th_device();
    fn exo_th_dblflt();
    fn exo_th_tss();
    fn exo_th_segnp();
    fn exo_th_stack();
    fn exo_th_gpflt();
    fn exo_th_pgflt();
    fn exo_th_fperr();
    fn exo_th_align();
    fn exo_th_mchk();
    fn exo_th_simderr();

    fn exo_th_irq0();
    fn exo_th_irq1();
    fn exo_th_irq2();
    fn exo_th_irq3();
    fn exo_th_irq4();
    fn exo_th_irq5();
    fn exo_th_irq6();
    fn exo_th_irq7();
    fn exo_th_irq8();
    fn exo_th_irq9();
    fn exo_th_irq10();
    fn exo_th_irq11();
    fn exo_th_irq12();
    fn exo_th_irq13();
    fn exo_th_irq14();
    fn exo_th_irq15();

    fn exo_th_syscall();
}

fn addr(f: unsafe extern "C" fn()) -> VirtAddr {
    VirtAddr::new(f as usize as u64)
}

/// 全 trap の Rust 側入口（exo_alltraps から call される）
#[no_mangle]
extern "C" fn exo_trap_entry(tf: *const TrapFrame) -> ! {
    // 他の CPU が panic 中なら何もしない
    if crate::panic::in_progress() {
        crate::arch::halt_loop();
    }

    // Safety: exo_alltraps が組んだスタック上の frame
    let tf = unsafe { *tf };

    let dispatch = state_ref::with_kernel(|k| k.trap(CpuId::BOOT, &tf));
    match dispatch {
        Some(d) => crate::arch::follow(d),
        None => {
            logging::error("trap before kernel state was installed");
            crate::arch::halt_loop()
        }
    }
}

pub fn init() {
    // Safety: 起動時に一度だけ。IDT は以後動かない static
    unsafe {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_addr(addr(exo_th_divide));
        idt.debug.set_handler_addr(addr(exo_th_debug));
        idt.non_maskable_interrupt.set_handler_addr(addr(exo_th_nmi));
        idt.breakpoint
            .set_handler_addr(addr(exo_th_brkpt))
            .set_privilege_level(PrivilegeLevel::Ring3);
        idt.overflow.set_handler_addr(addr(exo_th_oflow));
        idt.bound_range_exceeded.set_handler_addr(addr(exo_th_bound));
        idt.invalid_opcode.set_handler_addr(addr(exo_th_illop));
        idt.device_not_available.set_handler_addr(addr(exo_th_device));
        idt.double_fault
            .set_handler_addr(addr(exo_th_dblflt))
            .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        idt.invalid_tss.set_handler_addr(addr(exo_th_tss));
        idt.segment_not_present.set_handler_addr(addr(exo_th_segnp));
        idt.stack_segment_fault.set_handler_addr(addr(exo_th_stack));
        idt.general_protection_fault.set_handler_addr(addr(exo_th_gpflt));
        idt.page_fault.set_handler_addr(addr(exo_th_pgflt));
        idt.x87_floating_point.set_handler_addr(addr(exo_th_fperr));
        idt.alignment_check.set_handler_addr(addr(exo_th_align));
        idt.machine_check.set_handler_addr(addr(exo_th_mchk));
        idt.simd_floating_point.set_handler_addr(addr(exo_th_simderr));

        let irqs: [unsafe extern "C" fn(); 16] = [
            exo_th_irq0, exo_th_irq1, exo_th_irq2, exo_th_irq3, exo_th_irq4, exo_th_irq5,
            exo_th_irq6, exo_th_irq7, exo_th_irq8, exo_th_irq9, exo_th_irq10, exo_th_irq11,
            exo_th_irq12, exo_th_irq13, exo_th_irq14, exo_th_irq15,
        ];
        for (i, stub) in irqs.iter().enumerate() {
            idt[IRQ_OFFSET as u8 + i as u8].set_handler_addr(addr(*stub));
        }

        idt[T_SYSCALL as u8]
            .set_handler_addr(addr(exo_th_syscall))
            .set_privilege_level(PrivilegeLevel::Ring3);

        let idt: &'static InterruptDescriptorTable = (*core::ptr::addr_of_mut!(IDT)).write(idt);
        idt.load();
    }

    pic_init();
    logging::info("arch::interrupts::init: IDT loaded");
    logging::info_u64("breakpoint vector", T_BRKPT);
}

// ---- 8259 PIC ----

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

fn pic_init() {
    // Safety: 8259 の標準ポート。割り込み禁止中に一度だけ
    unsafe {
        let mut c1 = Port::<u8>::new(PIC1_CMD);
        let mut d1 = Port::<u8>::new(PIC1_DATA);
        let mut c2 = Port::<u8>::new(PIC2_CMD);
        let mut d2 = Port::<u8>::new(PIC2_DATA);

        // ICW1..ICW4
        c1.write(0x11);
        c2.write(0x11);
        d1.write(IRQ_OFFSET as u8);
        d2.write(IRQ_OFFSET as u8 + 8);
        d1.write(1 << 2);
        d2.write(2);
        d1.write(0x01);
        d2.write(0x01);

        // timer とカスケードだけ通す
        let mask = !((1u8 << IRQ_TIMER) | (1 << 2));
        d1.write(mask);
        d2.write(0xff);
    }
}

pub fn end_of_interrupt(irq: u8) {
    // Safety: EOI の書き込みだけ
    unsafe {
        if irq >= 8 {
            Port::<u8>::new(PIC2_CMD).write(PIC_EOI);
        }
        Port::<u8>::new(PIC1_CMD).write(PIC_EOI);
    }
}
