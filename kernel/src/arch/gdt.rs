// kernel/src/arch/gdt.rs
//
// 役割:
// - GDT と TSS を初期化してロードする
// - user から trap したときの ring0 スタック（TSS.rsp0）と #DF 用 IST を用意する
//
// やること:
// - セグメントを types::GD_* と同じ順（null, kcode, kdata, udata, ucode, tss）で append
//
// やらないこと:
// - AP ごとの TSS（起動するのは BSP だけ）
//
// 設計方針:
// - GDT/TSS は “ロード後に動かない” 静的領域へ固定配置
// - IST index は x86_64 crate の set_stack_index と同じ 0-based を使う

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::interrupts;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::logging;
use crate::types::{GD_KD, GD_KT, GD_TSS0, GD_UD, GD_UT};

/// #DF 用 IST（IST1）
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const RSP0_STACK_SIZE: usize = 4096 * 8;
const IST_STACK_SIZE: usize = 4096 * 4;

static INIT_DONE: AtomicBool = AtomicBool::new(false);

static mut GDT: MaybeUninit<GlobalDescriptorTable> = MaybeUninit::uninit();
static mut TSS: MaybeUninit<TaskStateSegment> = MaybeUninit::uninit();

#[repr(align(16))]
struct AlignedStack<const N: usize> {
    buf: [u8; N],
}

impl<const N: usize> AlignedStack<N> {
    fn top(&self) -> u64 {
        VirtAddr::from_ptr(self.buf.as_ptr()).as_u64() + N as u64
    }
}

static mut RSP0_STACK: AlignedStack<RSP0_STACK_SIZE> = AlignedStack {
    buf: [0; RSP0_STACK_SIZE],
};
static mut DF_IST_STACK: AlignedStack<IST_STACK_SIZE> = AlignedStack {
    buf: [0; IST_STACK_SIZE],
};

/// ring0 スタックの先頭（TSS.rsp0 と同じ値）
pub fn kernel_stack_top() -> u64 {
    // Safety: アドレスを取るだけ
    unsafe { (*core::ptr::addr_of!(RSP0_STACK)).top() }
}

pub fn init() {
    interrupts::without_interrupts(|| {
        if INIT_DONE.swap(true, Ordering::SeqCst) {
            return;
        }

        // Safety: 一度だけ実行される。GDT/TSS は以後動かない static
        unsafe {
            let mut tss = TaskStateSegment::new();
            tss.privilege_stack_table[0] = VirtAddr::new(kernel_stack_top());
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
                VirtAddr::new((*core::ptr::addr_of!(DF_IST_STACK)).top());
            let tss: &'static TaskStateSegment = (*core::ptr::addr_of_mut!(TSS)).write(tss);

            let mut gdt = GlobalDescriptorTable::new();
            let kcode = gdt.append(Descriptor::kernel_code_segment());
            let kdata = gdt.append(Descriptor::kernel_data_segment());
            let udata = gdt.append(Descriptor::user_data_segment());
            let ucode = gdt.append(Descriptor::user_code_segment());
            let tss_sel = gdt.append(Descriptor::tss_segment(tss));

            // types::GD_* と食い違っていたら起動を止める
            let idx = |sel: u16| sel & !7;
            assert_eq!(kcode.0, GD_KT);
            assert_eq!(kdata.0, GD_KD);
            assert_eq!(idx(udata.0), GD_UD);
            assert_eq!(idx(ucode.0), GD_UT);
            assert_eq!(tss_sel.0, GD_TSS0);

            let gdt: &'static GlobalDescriptorTable = (*core::ptr::addr_of_mut!(GDT)).write(gdt);
            gdt.load();

            CS::set_reg(kcode);
            DS::set_reg(kdata);
            ES::set_reg(kdata);
            SS::set_reg(kdata);
            load_tss(tss_sel);
        }

        logging::info("arch::gdt::init: GDT/TSS loaded");
        logging::info_u64("rsp0", kernel_stack_top());
    });
}
