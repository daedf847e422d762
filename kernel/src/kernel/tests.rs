// kernel/src/kernel/tests.rs
//
// Kernel コアの振る舞いテスト。hosted::Machine の上で trap / syscall / fault を起こして確認する。

use crate::error::Error;
use crate::hosted::{Fault, Machine};
use crate::mem::addr::{PhysAddr, PAGE_SIZE};
use crate::mem::layout::{USTACKTOP, UTEXT, UTOP, UVPT_PML4_INDEX, UXSTACKTOP};
use crate::mem::paging::{PageFlags, Pte};
use crate::mm::PhysMemory;
use crate::types::{
    sysno, EnvId, EnvStatus, FaultCode, TrapFrame, FL_IF, FL_IOPL_MASK, GD_KD, GD_KT, GD_UD, GD_UT,
    IRQ_KBD, IRQ_SPURIOUS, IRQ_TIMER, RPL_USER, T_BRKPT, T_GPFLT, T_PGFLT, UTRAPFRAME_SIZE,
};

use super::elf::{write_image, SegmentSpec, PF_R, PF_W};
use super::env::next_env_id;
use super::user_program::{build_demo_image, CODE_LEN, DEMO_IMAGE_MAX, DEMO_MESSAGE};
use super::{CpuId, CpuStatus, LogEvent};

const PU: u64 = PageFlags::PRESENT.bits() | PageFlags::USER.bits();
const PUW: u64 = PU | PageFlags::WRITABLE.bits();

const UPCALL: u64 = UTEXT + 0x100;
const SCRATCH: u64 = 0x90_0000;
const UNMAPPED: u64 = 0x1000_0000;

fn demo_image() -> Vec<u8> {
    let mut buf = vec![0u8; DEMO_IMAGE_MAX];
    let n = build_demo_image(&mut buf).expect("demo image fits");
    buf.truncate(n);
    buf
}

fn machine() -> Machine {
    Machine::new(256, 8)
}

/// デモイメージの環境を n 個作る（まだ走らせない）
fn create_envs(m: &mut Machine, n: usize) -> Vec<EnvId> {
    let image = demo_image();
    (0..n).map(|_| m.create(&image).expect("env_create")).collect()
}

fn boot_one(m: &mut Machine) -> EnvId {
    let id = create_envs(m, 1)[0];
    assert_eq!(m.schedule(), Some(id));
    id
}

fn sys(m: &mut Machine, no: u64, args: [u64; 5]) -> i64 {
    m.syscall(no, args).ret()
}

fn has_event(m: &Machine, ev: LogEvent) -> bool {
    m.kernel.events().any(|e| e == ev)
}

fn frame_bytes(tf: &TrapFrame) -> Vec<u8> {
    // Safety: TrapFrame は u64 だけの repr(C)
    let bytes = unsafe {
        core::slice::from_raw_parts(tf as *const TrapFrame as *const u8, core::mem::size_of::<TrapFrame>())
    };
    bytes.to_vec()
}

/// 例外スタックと upcall を設定済みの環境を 1 つ走らせる
fn boot_with_upcall(m: &mut Machine) -> EnvId {
    let id = boot_one(m);
    assert_eq!(sys(m, sysno::PAGE_ALLOC, [0, UXSTACKTOP - PAGE_SIZE, PUW, 0, 0]), 0);
    assert_eq!(sys(m, sysno::ENV_SET_PGFAULT_UPCALL, [0, UPCALL, 0, 0, 0]), 0);
    id
}

// ─────────────────────────────────────────────
// 環境テーブル
// ─────────────────────────────────────────────

#[test]
fn env_ids_advance_generation_on_slot_reuse() {
    let mut m = machine();

    let idx = m.kernel.env_alloc(EnvId(0)).expect("alloc");
    assert_eq!(idx, 0);
    let first = m.kernel.envs().get(idx).id;
    assert_eq!(first, EnvId(0x1000));

    m.kernel.env_free(CpuId::BOOT, idx);
    let again = m.kernel.env_alloc(EnvId(0)).expect("alloc");
    assert_eq!(again, 0);
    let second = m.kernel.envs().get(again).id;

    assert_eq!(second, EnvId(0x2000));
    assert_eq!(m.kernel.envs().resolve(first, None, false), Err(Error::BadEnv));
    assert_eq!(m.kernel.envs().resolve(second, None, false), Ok(0));
}

#[test]
fn env_id_generation_wraps_to_first_generation() {
    let old = EnvId(0x7fff_f000 | 5);
    assert_eq!(next_env_id(old, 5), EnvId(0x1005));
    assert_eq!(next_env_id(EnvId(0), 3), EnvId(0x1003));
}

#[test]
fn resolve_with_checkperm_allows_self_and_direct_children() {
    let mut m = machine();
    let parent = m.kernel.env_alloc(EnvId(0)).expect("alloc");
    let parent_id = m.kernel.envs().get(parent).id;
    let child = m.kernel.env_alloc(parent_id).expect("alloc");
    let child_id = m.kernel.envs().get(child).id;
    let other = m.kernel.env_alloc(EnvId(0)).expect("alloc");
    let other_id = m.kernel.envs().get(other).id;

    let envs = m.kernel.envs();
    assert_eq!(envs.resolve(child_id, Some(parent), true), Ok(child));
    assert_eq!(envs.resolve(parent_id, Some(parent), true), Ok(parent));
    assert_eq!(envs.resolve(EnvId(0), Some(child), true), Ok(child));
    assert_eq!(envs.resolve(other_id, Some(parent), true), Err(Error::BadEnv));
    assert_eq!(envs.resolve(parent_id, Some(child), true), Err(Error::BadEnv));
    assert_eq!(envs.resolve(other_id, Some(parent), false), Ok(other));
    assert_eq!(envs.resolve(EnvId(0), None, false), Err(Error::BadEnv));
}

#[test]
fn env_alloc_reports_full_table_without_leaking_pages() {
    let mut m = Machine::new(64, 2);
    m.kernel.env_alloc(EnvId(0)).expect("alloc");
    m.kernel.env_alloc(EnvId(0)).expect("alloc");

    let free_before = m.hal().free_pages();
    assert_eq!(m.kernel.env_alloc(EnvId(0)), Err(Error::NoFreeEnv));
    assert_eq!(m.hal().free_pages(), free_before);
    assert!(m.kernel.debug_check_invariants());
}

#[test]
fn env_alloc_without_memory_keeps_slot_free() {
    // プールは kernel root の 2 枚だけ
    let mut m = Machine::new(2, 4);
    assert_eq!(m.kernel.env_alloc(EnvId(0)), Err(Error::NoMem));
    assert_eq!(m.kernel.envs().free_len(), 4);
    assert_eq!(m.kernel.envs().free_head(), Some(0));
}

#[test]
fn env_free_returns_every_page_to_the_pool() {
    let mut m = machine();
    let baseline = m.hal().free_pages();

    let id = create_envs(&mut m, 1)[0];
    assert!(m.hal().free_pages() < baseline);
    assert!(m.kernel.translate(id, UTEXT).is_some());

    m.kernel.env_free(CpuId::BOOT, id.index());
    assert_eq!(m.hal().free_pages(), baseline);
    assert!(has_event(&m, LogEvent::EnvFreed(id)));
    assert!(m.kernel.debug_check_invariants());
}

#[test]
fn new_env_shares_kernel_half_and_maps_itself_at_uvpt() {
    let mut m = machine();
    let id = create_envs(&mut m, 1)[0];
    let root = m.kernel.env(id).and_then(|e| e.space).expect("space").root();

    let kern = *m.hal().page(m.kernel.kern_root()).entries();
    let mine = *m.hal().page(root).entries();
    assert_eq!(&mine[256..], &kern[256..]);

    let slot = Pte(mine[UVPT_PML4_INDEX]);
    assert_eq!(slot.frame(), root);
    assert!(slot.flags().contains(PageFlags::PRESENT | PageFlags::USER));
    assert!(!slot.flags().contains(PageFlags::WRITABLE));
}

// ─────────────────────────────────────────────
// ローダ
// ─────────────────────────────────────────────

fn image_with(entry: u64, segs: &[SegmentSpec<'_>]) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let n = write_image(&mut buf, entry, segs).expect("image fits");
    buf.truncate(n);
    buf
}

#[test]
fn load_image_without_magic_loads_nothing() {
    let mut m = machine();
    let idx = m.kernel.env_alloc(EnvId(0)).expect("alloc");

    assert_eq!(m.kernel.load_image(idx, b"definitely not an executable"), Ok(()));
    assert_eq!(m.kernel.envs().get(idx).tf.rip, 0);
}

#[test]
fn load_image_copies_data_and_zero_fills_the_rest() {
    let mut m = machine();
    let idx = m.kernel.env_alloc(EnvId(0)).expect("alloc");
    let id = m.kernel.envs().get(idx).id;

    let image = image_with(
        SCRATCH + 0x10,
        &[SegmentSpec {
            vaddr: SCRATCH + 0x10,
            data: &[1, 2, 3],
            memsz: 2 * PAGE_SIZE,
            flags: PF_R | PF_W,
        }],
    );
    // 前の住人のゴミが残っていても 0 で埋まること
    m.kernel.region_alloc(idx, SCRATCH, PAGE_SIZE).expect("region");
    m.kernel.copy_to_user(idx, SCRATCH + 0x20, &[0xaa; 16]).expect("dirty");

    m.kernel.load_image(idx, &image).expect("load");

    let mut head = [0u8; 3];
    m.kernel.copy_from_user(idx, SCRATCH + 0x10, &mut head).expect("read");
    assert_eq!(head, [1, 2, 3]);

    let mut rest = [0xffu8; 64];
    m.kernel.copy_from_user(idx, SCRATCH + 0x13, &mut rest).expect("read");
    assert!(rest.iter().all(|&b| b == 0));

    assert!(m.kernel.translate(id, SCRATCH + 2 * PAGE_SIZE).is_some());
    assert!(m.kernel.translate(id, USTACKTOP - PAGE_SIZE).is_some());
    assert_eq!(m.kernel.envs().get(idx).tf.rip, SCRATCH + 0x10);
}

#[test]
fn load_image_rejects_filesz_larger_than_memsz_before_copying() {
    let mut m = machine();
    let idx = m.kernel.env_alloc(EnvId(0)).expect("alloc");
    let id = m.kernel.envs().get(idx).id;

    let image = image_with(
        UTEXT,
        &[
            SegmentSpec {
                vaddr: SCRATCH,
                data: &[7; 8],
                memsz: 8,
                flags: PF_R,
            },
            SegmentSpec {
                vaddr: UTEXT,
                data: &[0x90; 64],
                memsz: 16,
                flags: PF_R,
            },
        ],
    );

    assert_eq!(m.kernel.load_image(idx, &image), Err(Error::Inval));
    assert!(m.kernel.translate(id, SCRATCH).is_none());
    assert!(m.kernel.translate(id, UTEXT).is_none());
}

#[test]
fn load_image_rejects_segment_reaching_past_utop() {
    let mut m = machine();
    let idx = m.kernel.env_alloc(EnvId(0)).expect("alloc");

    let image = image_with(
        UTEXT,
        &[SegmentSpec {
            vaddr: UTOP - PAGE_SIZE,
            data: &[],
            memsz: 2 * PAGE_SIZE,
            flags: PF_R,
        }],
    );
    assert_eq!(m.kernel.load_image(idx, &image), Err(Error::Inval));
}

#[test]
fn env_create_frees_the_env_when_loading_fails() {
    let mut m = machine();
    let baseline = m.hal().free_pages();
    let image = image_with(
        UTEXT,
        &[SegmentSpec {
            vaddr: UTEXT,
            data: &[0; 32],
            memsz: 8,
            flags: PF_R,
        }],
    );

    assert_eq!(m.create(&image), Err(Error::Inval));
    assert_eq!(m.kernel.envs().free_len(), 8);
    assert_eq!(m.hal().free_pages(), baseline);
}

// ─────────────────────────────────────────────
// 組み込みプログラム
// ─────────────────────────────────────────────

#[test]
fn demo_program_prints_yields_and_exits() {
    let mut m = machine();
    let id = boot_one(&mut m);
    assert_eq!(m.regs().rip, UTEXT);
    assert_eq!(m.regs().rsp, USTACKTOP);
    assert_eq!(m.regs().cs, (GD_UT | RPL_USER) as u64);

    let mut text = vec![0u8; DEMO_MESSAGE.len()];
    m.load(UTEXT + CODE_LEN as u64, &mut text).expect("text mapped");
    assert_eq!(text, DEMO_MESSAGE);

    // lea / mov / int 0x30 の代わり
    let msg = UTEXT + CODE_LEN as u64;
    assert_eq!(sys(&mut m, sysno::CPUTS, [msg, DEMO_MESSAGE.len() as u64, 0, 0, 0]), 0);
    assert_eq!(m.console_text(), "hello from user space\n");

    assert_eq!(sys(&mut m, sysno::YIELD, [0; 5]), 0);
    assert_eq!(m.current(), Some(id));

    sys(&mut m, sysno::ENV_DESTROY, [0; 5]);
    assert!(!m.is_alive(id));
    assert_eq!(m.current(), None);
    assert!(has_event(&m, LogEvent::EnvDestroyed(id)));
    assert!(has_event(&m, LogEvent::CpuIdle(0)));
    assert_eq!(m.hal().loaded_root(CpuId::BOOT), Some(m.kernel.kern_root()));
}

// ─────────────────────────────────────────────
// scheduler
// ─────────────────────────────────────────────

#[test]
fn timer_rotates_round_robin_from_the_slot_after_current() {
    let mut m = machine();
    let ids = create_envs(&mut m, 3);

    assert_eq!(m.schedule(), Some(ids[0]));
    m.interrupt(IRQ_TIMER);
    assert_eq!(m.current(), Some(ids[1]));
    assert_eq!(m.status(ids[0]), Some(EnvStatus::Runnable));
    m.interrupt(IRQ_TIMER);
    assert_eq!(m.current(), Some(ids[2]));
    m.interrupt(IRQ_TIMER);
    assert_eq!(m.current(), Some(ids[0]));

    assert_eq!(m.hal().eois, vec![0, 0, 0]);
    assert!(m.kernel.debug_check_invariants());
}

#[test]
fn yield_keeps_the_only_env_running() {
    let mut m = machine();
    let id = boot_one(&mut m);
    let runs = m.kernel.env(id).map(|e| e.runs);

    assert_eq!(sys(&mut m, sysno::YIELD, [0; 5]), 0);
    assert_eq!(m.current(), Some(id));
    assert_eq!(m.kernel.env(id).map(|e| e.runs), runs.map(|r| r + 1));
}

#[test]
fn cpu_halts_when_nothing_is_runnable_and_wakes_on_interrupt() {
    let mut m = machine();
    assert_eq!(m.schedule(), None);
    assert_eq!(m.kernel.cpu(CpuId::BOOT).status, CpuStatus::Halted);
    assert_eq!(m.hal().loaded_root(CpuId::BOOT), Some(m.kernel.kern_root()));
    assert!(has_event(&m, LogEvent::CpuIdle(0)));

    let id = create_envs(&mut m, 1)[0];
    m.interrupt(IRQ_TIMER);
    assert_eq!(m.current(), Some(id));
    assert_eq!(m.kernel.cpu(CpuId::BOOT).status, CpuStatus::Started);
}

// ─────────────────────────────────────────────
// 割り込み / 例外
// ─────────────────────────────────────────────

#[test]
fn device_interrupts_are_acknowledged_but_spurious_ones_are_not() {
    let mut m = machine();
    let id = boot_one(&mut m);

    m.interrupt(IRQ_SPURIOUS);
    assert!(m.hal().eois.is_empty());
    assert_eq!(m.current(), Some(id));

    m.interrupt(IRQ_KBD);
    assert_eq!(m.hal().eois, vec![IRQ_KBD as u8]);
    assert_eq!(m.current(), Some(id));
}

#[test]
fn breakpoint_enters_monitor_and_resumes() {
    let mut m = machine();
    let id = boot_one(&mut m);

    m.trap(T_BRKPT, 0);
    assert_eq!(m.hal().monitor_calls, 1);
    assert_eq!(m.current(), Some(id));
}

#[test]
fn unexpected_user_exception_destroys_only_that_env() {
    let mut m = machine();
    let ids = create_envs(&mut m, 2);
    assert_eq!(m.schedule(), Some(ids[0]));

    m.trap(T_GPFLT, 0);
    assert!(!m.is_alive(ids[0]));
    assert_eq!(m.current(), Some(ids[1]));
}

#[test]
#[should_panic(expected = "unhandled trap in kernel")]
fn unexpected_kernel_exception_is_fatal() {
    let mut m = machine();
    m.trap(T_GPFLT, 0);
}

#[test]
#[should_panic(expected = "kernel page fault")]
fn kernel_page_fault_is_fatal() {
    let mut m = machine();
    m.hal_mut().fault_va = 0xdead_0000;
    m.trap(T_PGFLT, 0);
}

// ─────────────────────────────────────────────
// page fault upcall
// ─────────────────────────────────────────────

#[test]
fn page_fault_pushes_utrapframe_at_top_of_exception_stack() {
    let mut m = machine();
    let id = boot_with_upcall(&mut m);

    let fault = m.read_u64(UNMAPPED);
    let expected = UXSTACKTOP - UTRAPFRAME_SIZE;
    assert_eq!(fault, Err(Fault::Upcall { utf_va: expected }));
    assert_eq!(m.regs().rip, UPCALL);
    assert_eq!(m.regs().rsp, expected);

    let utf = m.read_utrapframe().expect("utf readable");
    assert_eq!(utf.fault_va, UNMAPPED);
    assert_eq!(utf.err, FaultCode::USER.bits());
    assert_eq!(utf.rip, UTEXT);
    assert_eq!(utf.rsp, USTACKTOP);

    assert!(has_event(
        &m,
        LogEvent::PageFaultUpcall {
            env: id,
            fault_va: UNMAPPED,
            utf_va: expected
        }
    ));
}

#[test]
fn recursive_fault_leaves_one_word_gap_below_previous_frame() {
    let mut m = machine();
    boot_with_upcall(&mut m);

    let Err(Fault::Upcall { utf_va: first }) = m.read_u64(UNMAPPED) else {
        panic!("first fault should upcall");
    };
    let Err(Fault::Upcall { utf_va: second }) = m.read_u64(UNMAPPED + PAGE_SIZE) else {
        panic!("nested fault should upcall");
    };

    assert_eq!(second, first - 8 - UTRAPFRAME_SIZE);
    let utf = m.read_utrapframe().expect("utf readable");
    assert_eq!(utf.rsp, first);
    assert_eq!(utf.rip, UPCALL);
}

#[test]
fn write_to_read_only_page_reports_protection_and_write() {
    let mut m = machine();
    boot_with_upcall(&mut m);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PU, 0, 0]), 0);

    assert_eq!(m.read_u64(SCRATCH), Ok(0));
    assert!(matches!(m.write_u64(SCRATCH, 1), Err(Fault::Upcall { .. })));

    let utf = m.read_utrapframe().expect("utf readable");
    assert_eq!(
        utf.err,
        (FaultCode::USER | FaultCode::WRITE | FaultCode::PROTECTION).bits()
    );
    assert_eq!(utf.fault_va, SCRATCH);
}

#[test]
fn returning_from_upcall_restores_trap_time_state() {
    let mut m = machine();
    boot_with_upcall(&mut m);
    m.regs_mut().regs.r12 = 0x1234;

    assert!(matches!(m.read_u64(UNMAPPED), Err(Fault::Upcall { .. })));
    let utf = m.read_utrapframe().expect("utf readable");
    assert_eq!(utf.regs.r12, 0x1234);

    // handler: ページを用意して戻る
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, UNMAPPED, PUW, 0, 0]), 0);
    m.resume_from_upcall(&utf);

    assert_eq!(m.regs().rip, UTEXT);
    assert_eq!(m.regs().rsp, USTACKTOP);
    assert_eq!(m.regs().regs.r12, 0x1234);
    assert_eq!(m.read_u64(UNMAPPED), Ok(0));
}

#[test]
fn fault_without_upcall_destroys_env() {
    let mut m = machine();
    let id = boot_one(&mut m);

    assert_eq!(m.read_u64(UNMAPPED), Err(Fault::Killed));
    assert!(!m.is_alive(id));
    assert!(has_event(&m, LogEvent::UserFaultKilled { env: id, fault_va: UNMAPPED }));
}

#[test]
fn fault_with_unmapped_exception_stack_destroys_env() {
    let mut m = machine();
    let id = boot_one(&mut m);
    assert_eq!(sys(&mut m, sysno::ENV_SET_PGFAULT_UPCALL, [0, UPCALL, 0, 0, 0]), 0);

    assert_eq!(m.read_u64(UNMAPPED), Err(Fault::Killed));
    assert!(!m.is_alive(id));
}

#[test]
fn exception_stack_overflow_destroys_env() {
    let mut m = machine();
    let id = boot_with_upcall(&mut m);
    m.regs_mut().rsp = UXSTACKTOP - PAGE_SIZE + 100;

    assert_eq!(m.read_u64(UNMAPPED), Err(Fault::Killed));
    assert!(!m.is_alive(id));
}

#[test]
fn clearing_the_upcall_makes_faults_fatal_again() {
    let mut m = machine();
    let id = boot_with_upcall(&mut m);
    assert_eq!(sys(&mut m, sysno::ENV_SET_PGFAULT_UPCALL, [0, 0, 0, 0, 0]), 0);
    assert_eq!(m.kernel.env(id).and_then(|e| e.pgfault_upcall), None);

    assert_eq!(m.read_u64(UNMAPPED), Err(Fault::Killed));
}

// ─────────────────────────────────────────────
// syscall 引数検査
// ─────────────────────────────────────────────

#[test]
fn unknown_syscall_number_is_invalid_and_harmless() {
    let mut m = machine();
    let id = boot_one(&mut m);
    assert_eq!(sys(&mut m, 99, [0; 5]), Error::Inval.code() as i64);
    assert_eq!(m.current(), Some(id));
}

#[test]
fn getenvid_and_cgetc() {
    let mut m = machine();
    let id = boot_one(&mut m);
    assert_eq!(sys(&mut m, sysno::GETENVID, [0; 5]), id.0 as i64);

    assert_eq!(sys(&mut m, sysno::CGETC, [0; 5]), 0);
    m.hal_mut().input.push_back(b'q');
    assert_eq!(sys(&mut m, sysno::CGETC, [0; 5]), b'q' as i64);
}

#[test]
fn cputs_with_bad_buffer_fails_without_killing_the_caller() {
    let mut m = machine();
    let id = boot_one(&mut m);

    assert_eq!(sys(&mut m, sysno::CPUTS, [0x10, 4, 0, 0, 0]), Error::Inval.code() as i64);
    // 後半だけ範囲外
    let tail = USTACKTOP - 4;
    assert_eq!(sys(&mut m, sysno::CPUTS, [tail, 16, 0, 0, 0]), Error::Inval.code() as i64);
    // kernel 空間
    assert_eq!(
        sys(&mut m, sysno::CPUTS, [0xffff_8000_0000_0000, 8, 0, 0, 0]),
        Error::Inval.code() as i64
    );

    assert!(m.console_text().is_empty());
    assert_eq!(m.current(), Some(id));
}

#[test]
fn page_alloc_validates_address_and_permissions() {
    let mut m = machine();
    let id = boot_one(&mut m);
    let inval = Error::Inval.code() as i64;

    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, UTOP, PUW, 0, 0]), inval);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH + 8, PUW, 0, 0]), inval);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PageFlags::PRESENT.bits(), 0, 0]), inval);
    assert_eq!(
        sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PUW | PageFlags::NO_CACHE.bits(), 0, 0]),
        inval
    );
    assert!(m.kernel.translate(id, SCRATCH).is_none());

    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PUW | PageFlags::COW.bits(), 0, 0]), 0);
    assert!(m.kernel.translate(id, SCRATCH).is_some());
}

#[test]
fn page_alloc_replaces_an_existing_mapping_with_a_zeroed_page() {
    let mut m = machine();
    let id = boot_one(&mut m);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PUW, 0, 0]), 0);
    m.write_u64(SCRATCH, 0x55).expect("writable");
    let old = m.kernel.translate(id, SCRATCH);

    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PUW, 0, 0]), 0);
    assert_ne!(m.kernel.translate(id, SCRATCH), old);
    assert_eq!(m.read_u64(SCRATCH), Ok(0));
}

#[test]
fn handles_outside_the_family_are_rejected() {
    let mut m = machine();
    let ids = create_envs(&mut m, 2);
    assert_eq!(m.schedule(), Some(ids[0]));
    let bad = Error::BadEnv.code() as i64;

    let stranger = ids[1].to_reg();
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [stranger, SCRATCH, PUW, 0, 0]), bad);
    assert_eq!(sys(&mut m, sysno::ENV_DESTROY, [stranger, 0, 0, 0, 0]), bad);
    assert_eq!(sys(&mut m, sysno::ENV_SET_STATUS, [stranger, 4, 0, 0, 0]), bad);
    assert_eq!(sys(&mut m, sysno::PAGE_UNMAP, [0x7777_7000, SCRATCH, 0, 0, 0]), bad);
    assert!(m.is_alive(ids[1]));
}

#[test]
fn page_map_shares_frames_but_never_upgrades_to_writable() {
    let mut m = machine();
    let id = boot_one(&mut m);
    let other = SCRATCH + PAGE_SIZE;
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PU, 0, 0]), 0);

    assert_eq!(
        sys(&mut m, sysno::PAGE_MAP, [0, SCRATCH, 0, other, PUW]),
        Error::Inval.code() as i64
    );
    assert_eq!(sys(&mut m, sysno::PAGE_MAP, [0, SCRATCH, 0, other, PU]), 0);
    assert_eq!(m.kernel.translate(id, other), m.kernel.translate(id, SCRATCH));

    assert_eq!(
        sys(&mut m, sysno::PAGE_MAP, [0, UNMAPPED, 0, other, PU]),
        Error::Inval.code() as i64
    );
}

#[test]
fn page_map_fails_cleanly_when_the_share_count_is_saturated() {
    let mut m = machine();
    let id = boot_one(&mut m);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PU, 0, 0]), 0);
    let pa = m.kernel.translate(id, SCRATCH).expect("mapped");
    let frame = PhysAddr(pa).frame();
    // 上限まで残り 1 つになるよう直接積む
    while m.hal().ref_count(frame) < u16::MAX - 1 {
        assert!(m.hal_mut().incref(frame));
    }

    let (a, b) = (SCRATCH + PAGE_SIZE, SCRATCH + 2 * PAGE_SIZE);
    assert_eq!(sys(&mut m, sysno::PAGE_MAP, [0, SCRATCH, 0, a, PU]), 0);
    assert_eq!(m.hal().ref_count(frame), u16::MAX);

    let nomem = Error::NoMem.code() as i64;
    assert_eq!(sys(&mut m, sysno::PAGE_MAP, [0, SCRATCH, 0, b, PU]), nomem);
    assert_eq!(m.kernel.translate(id, b), None);
    assert_eq!(m.hal().ref_count(frame), u16::MAX);
    assert_eq!(m.current(), Some(id));

    // 1 つ外せばまた共有できる
    assert_eq!(sys(&mut m, sysno::PAGE_UNMAP, [0, a, 0, 0, 0]), 0);
    assert_eq!(sys(&mut m, sysno::PAGE_MAP, [0, SCRATCH, 0, b, PU]), 0);
    assert_eq!(m.kernel.translate(id, b), Some(pa));
    assert!(m.kernel.debug_check_invariants());
}

#[test]
fn handles_with_stray_upper_bits_are_rejected() {
    let mut m = machine();
    let parent = boot_one(&mut m);
    let child = EnvId(sys(&mut m, sysno::EXOFORK, [0; 5]) as i32);
    let bad = Error::BadEnv.code() as i64;

    // 下位 32 bit だけなら「自分」と child に読める
    let as_self = 1u64 << 32;
    let as_child = (1u64 << 32) | child.to_reg();
    assert_eq!(sys(&mut m, sysno::ENV_DESTROY, [as_self, 0, 0, 0, 0]), bad);
    assert_eq!(sys(&mut m, sysno::ENV_DESTROY, [as_child, 0, 0, 0, 0]), bad);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [as_child, SCRATCH, PUW, 0, 0]), bad);
    assert_eq!(m.current(), Some(parent));
    assert!(m.is_alive(child));
    assert_eq!(m.kernel.translate(child, SCRATCH), None);
}

#[test]
fn page_unmap_is_idempotent() {
    let mut m = machine();
    let id = boot_one(&mut m);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PUW, 0, 0]), 0);

    assert_eq!(sys(&mut m, sysno::PAGE_UNMAP, [0, SCRATCH, 0, 0, 0]), 0);
    assert!(m.kernel.translate(id, SCRATCH).is_none());
    assert_eq!(sys(&mut m, sysno::PAGE_UNMAP, [0, SCRATCH, 0, 0, 0]), 0);
    assert_eq!(
        sys(&mut m, sysno::PAGE_UNMAP, [0, SCRATCH + 1, 0, 0, 0]),
        Error::Inval.code() as i64
    );
}

#[test]
fn exofork_creates_a_suspended_copy_that_sees_zero() {
    let mut m = machine();
    let parent = boot_one(&mut m);
    m.regs_mut().regs.r13 = 77;

    let r = sys(&mut m, sysno::EXOFORK, [0; 5]);
    assert!(r > 0);
    let child = EnvId(r as i32);
    assert_eq!(m.current(), Some(parent));

    let c = *m.kernel.env(child).expect("child exists");
    assert_eq!(c.status, EnvStatus::NotRunnable);
    assert_eq!(c.parent_id, parent);
    assert_eq!(c.tf.regs.rax, 0);
    assert_eq!(c.tf.regs.r13, 77);
    assert_eq!(c.tf.rip, m.regs().rip);
    assert!(m.kernel.translate(child, UTEXT).is_none());
}

#[test]
fn exofork_reports_full_table() {
    let mut m = Machine::new(256, 1);
    boot_one(&mut m);
    assert_eq!(sys(&mut m, sysno::EXOFORK, [0; 5]), Error::NoFreeEnv.code() as i64);
}

#[test]
fn env_set_status_accepts_only_runnable_and_not_runnable() {
    let mut m = machine();
    boot_one(&mut m);
    let child = EnvId(sys(&mut m, sysno::EXOFORK, [0; 5]) as i32);

    for bad in [EnvStatus::Free, EnvStatus::Dying, EnvStatus::Running] {
        assert_eq!(
            sys(&mut m, sysno::ENV_SET_STATUS, [child.to_reg(), bad as u64, 0, 0, 0]),
            Error::Inval.code() as i64
        );
    }
    assert_eq!(
        sys(&mut m, sysno::ENV_SET_STATUS, [child.to_reg(), 99, 0, 0, 0]),
        Error::Inval.code() as i64
    );

    let runnable = EnvStatus::Runnable as u64;
    assert_eq!(sys(&mut m, sysno::ENV_SET_STATUS, [child.to_reg(), runnable, 0, 0, 0]), 0);
    assert_eq!(m.status(child), Some(EnvStatus::Runnable));
}

#[test]
fn set_trapframe_forces_user_privilege() {
    let mut m = machine();
    boot_one(&mut m);
    let child = EnvId(sys(&mut m, sysno::EXOFORK, [0; 5]) as i32);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PUW, 0, 0]), 0);

    let forged = TrapFrame {
        rip: 0x12_3000,
        rsp: 0x7000,
        cs: GD_KT as u64,
        ss: GD_KD as u64,
        ds: GD_KD as u64,
        es: GD_KD as u64,
        rflags: u64::MAX,
        trapno: T_PGFLT,
        err: 3,
        ..TrapFrame::zeroed()
    };
    m.store(SCRATCH, &frame_bytes(&forged)).expect("store");

    assert_eq!(sys(&mut m, sysno::ENV_SET_TRAPFRAME, [child.to_reg(), SCRATCH, 0, 0, 0]), 0);

    let tf = m.kernel.env(child).expect("child").tf;
    let user_data = (GD_UD | RPL_USER) as u64;
    assert_eq!(tf.cs, (GD_UT | RPL_USER) as u64);
    assert_eq!((tf.ss, tf.ds, tf.es), (user_data, user_data, user_data));
    assert_eq!(tf.rflags & FL_IOPL_MASK, 0);
    assert_ne!(tf.rflags & FL_IF, 0);
    assert_eq!(tf.rflags, 0x4_0fd7);
    assert_eq!((tf.rip, tf.rsp), (0x12_3000, 0x7000));
    assert_eq!((tf.trapno, tf.err), (0, 0));
}

#[test]
fn set_trapframe_rejects_kernel_addresses() {
    let mut m = machine();
    boot_one(&mut m);
    let child = EnvId(sys(&mut m, sysno::EXOFORK, [0; 5]) as i32);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PUW, 0, 0]), 0);

    let forged = TrapFrame {
        rip: 0xffff_8000_0010_0000,
        ..TrapFrame::new_user(USTACKTOP)
    };
    m.store(SCRATCH, &frame_bytes(&forged)).expect("store");
    let before = m.kernel.env(child).expect("child").tf;

    assert_eq!(
        sys(&mut m, sysno::ENV_SET_TRAPFRAME, [child.to_reg(), SCRATCH, 0, 0, 0]),
        Error::Inval.code() as i64
    );
    assert_eq!(m.kernel.env(child).expect("child").tf, before);
}

#[test]
fn parent_can_destroy_its_child() {
    let mut m = machine();
    let parent = boot_one(&mut m);
    let child = EnvId(sys(&mut m, sysno::EXOFORK, [0; 5]) as i32);

    assert_eq!(sys(&mut m, sysno::ENV_DESTROY, [child.to_reg(), 0, 0, 0, 0]), 0);
    assert!(!m.is_alive(child));
    assert_eq!(m.current(), Some(parent));
}

// ─────────────────────────────────────────────
// 複数 CPU
// ─────────────────────────────────────────────

#[test]
fn destroying_an_env_running_elsewhere_defers_to_its_cpu() {
    let mut m = machine();
    let parent = boot_one(&mut m);
    let child = EnvId(sys(&mut m, sysno::EXOFORK, [0; 5]) as i32);
    let runnable = EnvStatus::Runnable as u64;
    assert_eq!(sys(&mut m, sysno::ENV_SET_STATUS, [child.to_reg(), runnable, 0, 0, 0]), 0);

    let ap = CpuId(1);
    m.select_cpu(ap);
    assert_eq!(m.schedule(), Some(child));

    m.select_cpu(CpuId::BOOT);
    assert_eq!(sys(&mut m, sysno::ENV_DESTROY, [child.to_reg(), 0, 0, 0, 0]), 0);
    assert_eq!(m.status(child), Some(EnvStatus::Dying));
    assert!(has_event(&m, LogEvent::EnvMarkedDying(child)));
    assert!(!has_event(&m, LogEvent::EnvFreed(child)));
    assert!(m.kernel.debug_check_invariants());

    // AP の次の trap 入口で回収される
    m.select_cpu(ap);
    m.interrupt(IRQ_TIMER);
    assert!(!m.is_alive(child));
    assert!(has_event(&m, LogEvent::EnvFreed(child)));
    assert_eq!(m.current(), None);
    assert_eq!(m.hal().loaded_root(ap), Some(m.kernel.kern_root()));

    m.select_cpu(CpuId::BOOT);
    assert_eq!(m.current(), Some(parent));
    assert!(m.kernel.debug_check_invariants());
}

#[test]
fn an_env_running_on_one_cpu_is_never_picked_by_another() {
    let mut m = machine();
    let id = boot_one(&mut m);

    m.select_cpu(CpuId(1));
    assert_eq!(m.schedule(), None);
    assert_eq!(m.kernel.cpu(CpuId(1)).status, CpuStatus::Halted);

    m.select_cpu(CpuId::BOOT);
    assert_eq!(m.current(), Some(id));
}

/// BOOT で親が exofork し、子を AP で走らせる。戻ったときの選択 CPU は BOOT。
fn child_running_on(m: &mut Machine, ap: CpuId) -> (EnvId, EnvId) {
    let parent = boot_one(m);
    let child = EnvId(sys(m, sysno::EXOFORK, [0; 5]) as i32);
    let runnable = EnvStatus::Runnable as u64;
    assert_eq!(sys(m, sysno::ENV_SET_STATUS, [child.to_reg(), runnable, 0, 0, 0]), 0);

    m.select_cpu(ap);
    assert_eq!(m.schedule(), Some(child));
    m.select_cpu(CpuId::BOOT);
    (parent, child)
}

#[test]
fn marking_a_running_env_runnable_does_not_let_another_cpu_take_it() {
    let mut m = machine();
    let ap = CpuId(1);
    let (parent, child) = child_running_on(&mut m, ap);
    let runnable = EnvStatus::Runnable as u64;

    assert_eq!(sys(&mut m, sysno::ENV_SET_STATUS, [child.to_reg(), runnable, 0, 0, 0]), 0);
    assert_eq!(m.status(child), Some(EnvStatus::Running));

    assert_eq!(sys(&mut m, sysno::YIELD, [0; 5]), 0);
    assert_eq!(m.current(), Some(parent));
    m.interrupt(IRQ_TIMER);
    assert_eq!(m.current(), Some(parent));

    let child_idx = m.kernel.envs().resolve(child, None, false).expect("child");
    assert_eq!(m.kernel.cpu(ap).cur, Some(child_idx));
    assert!(m.kernel.debug_check_invariants());
}

#[test]
fn scheduler_skips_another_cpus_current_even_if_marked_runnable() {
    let mut m = machine();
    let ap = CpuId(1);
    let (parent, child) = child_running_on(&mut m, ap);

    m.kernel.env_mut(child).expect("child").status = EnvStatus::Runnable;
    m.interrupt(IRQ_TIMER);
    assert_eq!(m.current(), Some(parent));
}

#[test]
fn a_dying_env_stays_dying_whatever_status_is_requested() {
    let mut m = machine();
    let ap = CpuId(1);
    let (_parent, child) = child_running_on(&mut m, ap);

    assert_eq!(sys(&mut m, sysno::ENV_DESTROY, [child.to_reg(), 0, 0, 0, 0]), 0);
    assert_eq!(m.status(child), Some(EnvStatus::Dying));
    for status in [EnvStatus::Runnable, EnvStatus::NotRunnable] {
        let req = [child.to_reg(), status as u64, 0, 0, 0];
        assert_eq!(sys(&mut m, sysno::ENV_SET_STATUS, req), 0);
        assert_eq!(m.status(child), Some(EnvStatus::Dying));
    }

    m.select_cpu(ap);
    m.interrupt(IRQ_TIMER);
    assert!(!m.is_alive(child));
    assert_eq!(m.current(), None);
    assert!(m.kernel.debug_check_invariants());
}

#[test]
fn stopping_an_env_running_elsewhere_takes_effect_at_its_next_trap() {
    let mut m = machine();
    let ap = CpuId(1);
    let (_parent, child) = child_running_on(&mut m, ap);
    let not_runnable = EnvStatus::NotRunnable as u64;
    let runnable = EnvStatus::Runnable as u64;

    assert_eq!(sys(&mut m, sysno::ENV_SET_STATUS, [child.to_reg(), not_runnable, 0, 0, 0]), 0);
    assert_eq!(m.status(child), Some(EnvStatus::NotRunnable));
    assert!(m.kernel.debug_check_invariants());

    m.select_cpu(ap);
    m.interrupt(IRQ_TIMER);
    assert_eq!(m.current(), None);
    assert_eq!(m.status(child), Some(EnvStatus::NotRunnable));

    m.select_cpu(CpuId::BOOT);
    assert_eq!(sys(&mut m, sysno::ENV_SET_STATUS, [child.to_reg(), runnable, 0, 0, 0]), 0);
    m.select_cpu(ap);
    assert_eq!(m.schedule(), Some(child));
    assert!(m.kernel.debug_check_invariants());
}

#[test]
fn destroying_a_stopped_env_still_on_another_cpu_is_deferred() {
    let mut m = machine();
    let ap = CpuId(1);
    let (parent, child) = child_running_on(&mut m, ap);
    let child_root = m.hal().loaded_root(ap);
    let not_runnable = EnvStatus::NotRunnable as u64;

    assert_eq!(sys(&mut m, sysno::ENV_SET_STATUS, [child.to_reg(), not_runnable, 0, 0, 0]), 0);
    assert_eq!(sys(&mut m, sysno::ENV_DESTROY, [child.to_reg(), 0, 0, 0, 0]), 0);
    assert_eq!(m.status(child), Some(EnvStatus::Dying));
    assert!(has_event(&m, LogEvent::EnvMarkedDying(child)));
    assert!(!has_event(&m, LogEvent::EnvFreed(child)));
    // AP はまだ子の address space の上にいる
    assert_eq!(m.hal().loaded_root(ap), child_root);
    assert!(m.kernel.env(child).and_then(|e| e.space).is_some());
    assert!(m.kernel.debug_check_invariants());

    m.select_cpu(ap);
    m.interrupt(IRQ_TIMER);
    assert!(!m.is_alive(child));
    assert!(has_event(&m, LogEvent::EnvFreed(child)));
    assert_eq!(m.current(), None);
    assert_eq!(m.hal().loaded_root(ap), Some(m.kernel.kern_root()));

    m.select_cpu(CpuId::BOOT);
    assert_eq!(m.current(), Some(parent));
    assert!(m.kernel.debug_check_invariants());
}

// ─────────────────────────────────────────────
// IPC
// ─────────────────────────────────────────────

/// 2 つ作り、1 つ目が yield して 2 つ目が recv(dst) で眠ったところまで進める
fn receiver_waiting(m: &mut Machine, dst: u64) -> (EnvId, EnvId) {
    let ids = create_envs(m, 2);
    let (sender, receiver) = (ids[0], ids[1]);
    assert_eq!(m.schedule(), Some(sender));
    assert_eq!(sys(m, sysno::YIELD, [0; 5]), 0);
    assert_eq!(m.current(), Some(receiver));

    m.syscall(sysno::IPC_RECV, [dst, 0, 0, 0, 0]);
    assert_eq!(m.status(receiver), Some(EnvStatus::NotRunnable));
    assert_eq!(m.current(), Some(sender));
    (sender, receiver)
}

#[test]
fn send_to_env_that_is_not_receiving_fails() {
    let mut m = machine();
    let ids = create_envs(&mut m, 2);
    assert_eq!(m.schedule(), Some(ids[0]));

    assert_eq!(
        sys(&mut m, sysno::IPC_TRY_SEND, [ids[1].to_reg(), 1, UTOP, 0, 0]),
        Error::IpcNotRecv.code() as i64
    );
    assert_eq!(
        sys(&mut m, sysno::IPC_TRY_SEND, [0x7777_7000, 1, UTOP, 0, 0]),
        Error::BadEnv.code() as i64
    );
}

#[test]
fn value_is_delivered_in_registers_and_wakes_receiver() {
    let mut m = machine();
    let (sender, receiver) = receiver_waiting(&mut m, UTOP);

    assert_eq!(sys(&mut m, sysno::IPC_TRY_SEND, [receiver.to_reg(), 42, UTOP, 0, 0]), 0);

    let r = *m.kernel.env(receiver).expect("receiver");
    assert_eq!(r.status, EnvStatus::Runnable);
    assert!(!r.ipc_recving);
    assert_eq!((r.ipc_from, r.ipc_value, r.ipc_perm), (sender, 42, PageFlags::empty()));
    assert!(has_event(
        &m,
        LogEvent::IpcDelivered {
            from: sender,
            to: receiver,
            value: 42
        }
    ));

    assert_eq!(sys(&mut m, sysno::YIELD, [0; 5]), 0);
    assert_eq!(m.current(), Some(receiver));
    let regs = m.regs().regs;
    assert_eq!((regs.rax, regs.rdx, regs.rcx, regs.rbx), (0, 42, sender.to_reg(), 0));
}

#[test]
fn only_the_first_of_two_senders_is_delivered() {
    let mut m = machine();
    let ids = create_envs(&mut m, 3);
    assert_eq!(m.schedule(), Some(ids[0]));
    assert_eq!(sys(&mut m, sysno::YIELD, [0; 5]), 0);
    assert_eq!(sys(&mut m, sysno::YIELD, [0; 5]), 0);
    assert_eq!(m.current(), Some(ids[2]));
    m.syscall(sysno::IPC_RECV, [UTOP, 0, 0, 0, 0]);
    assert_eq!(m.current(), Some(ids[0]));

    assert_eq!(sys(&mut m, sysno::IPC_TRY_SEND, [ids[2].to_reg(), 1, UTOP, 0, 0]), 0);
    assert_eq!(sys(&mut m, sysno::YIELD, [0; 5]), 0);
    assert_eq!(m.current(), Some(ids[1]));
    assert_eq!(
        sys(&mut m, sysno::IPC_TRY_SEND, [ids[2].to_reg(), 2, UTOP, 0, 0]),
        Error::IpcNotRecv.code() as i64
    );
    assert_eq!(m.kernel.env(ids[2]).map(|e| e.ipc_value), Some(1));
}

#[test]
fn page_is_mapped_into_receiver_with_requested_perm() {
    let mut m = machine();
    let dst = 0xa0_0000;
    let (sender, receiver) = receiver_waiting(&mut m, dst);

    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PUW, 0, 0]), 0);
    m.store(SCRATCH, b"ping").expect("store");
    assert_eq!(sys(&mut m, sysno::IPC_TRY_SEND, [receiver.to_reg(), 7, SCRATCH, PU, 0]), 0);

    assert_eq!(m.kernel.translate(receiver, dst), m.kernel.translate(sender, SCRATCH));
    let r = *m.kernel.env(receiver).expect("receiver");
    assert_eq!(r.ipc_perm, PageFlags::PRESENT | PageFlags::USER);
    assert_eq!(r.tf.regs.rbx, PU);

    assert_eq!(sys(&mut m, sysno::YIELD, [0; 5]), 0);
    assert_eq!(m.current(), Some(receiver));
    let mut got = [0u8; 4];
    m.load(dst, &mut got).expect("mapped");
    assert_eq!(&got, b"ping");
    assert!(matches!(m.store(dst, b"pong"), Err(Fault::Killed)));
}

#[test]
fn page_is_not_sent_when_receiver_did_not_ask_for_one() {
    let mut m = machine();
    let (_, receiver) = receiver_waiting(&mut m, UTOP);
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PUW, 0, 0]), 0);

    assert_eq!(sys(&mut m, sysno::IPC_TRY_SEND, [receiver.to_reg(), 7, SCRATCH, PU, 0]), 0);
    let r = *m.kernel.env(receiver).expect("receiver");
    assert_eq!(r.ipc_perm, PageFlags::empty());
    assert_eq!(r.tf.regs.rbx, 0);
}

#[test]
fn send_rejects_bad_page_arguments_and_keeps_receiver_waiting() {
    let mut m = machine();
    let (_, receiver) = receiver_waiting(&mut m, 0xa0_0000);
    let inval = Error::Inval.code() as i64;
    let to = receiver.to_reg();
    assert_eq!(sys(&mut m, sysno::PAGE_ALLOC, [0, SCRATCH, PU, 0, 0]), 0);

    assert_eq!(sys(&mut m, sysno::IPC_TRY_SEND, [to, 1, SCRATCH, PUW, 0]), inval);
    assert_eq!(sys(&mut m, sysno::IPC_TRY_SEND, [to, 1, SCRATCH + 4, PU, 0]), inval);
    assert_eq!(sys(&mut m, sysno::IPC_TRY_SEND, [to, 1, UNMAPPED, PU, 0]), inval);
    assert_eq!(sys(&mut m, sysno::IPC_TRY_SEND, [to, 1, SCRATCH, 1 << 5, 0]), inval);

    let r = *m.kernel.env(receiver).expect("receiver");
    assert!(r.ipc_recving);
    assert_eq!(r.status, EnvStatus::NotRunnable);
}

#[test]
fn recv_rejects_unaligned_destination_without_sleeping() {
    let mut m = machine();
    let id = boot_one(&mut m);

    assert_eq!(
        sys(&mut m, sysno::IPC_RECV, [SCRATCH + 1, 0, 0, 0, 0]),
        Error::Inval.code() as i64
    );
    assert_eq!(m.current(), Some(id));
    assert_eq!(m.kernel.env(id).map(|e| e.ipc_recving), Some(false));
}

#[test]
fn lone_receiver_leaves_the_cpu_idle() {
    let mut m = machine();
    let id = boot_one(&mut m);
    m.syscall(sysno::IPC_RECV, [UTOP, 0, 0, 0, 0]);

    assert_eq!(m.current(), None);
    assert_eq!(m.status(id), Some(EnvStatus::NotRunnable));
    assert!(m.kernel.debug_check_invariants());
}

#[test]
fn event_log_keeps_only_the_newest_entries() {
    let mut m = machine();
    let id = boot_one(&mut m);
    m.kernel.clear_events();

    for _ in 0..300 {
        m.interrupt(IRQ_TIMER);
    }
    let events: Vec<_> = m.kernel.events().collect();
    assert_eq!(events.len(), 256);
    assert!(events.iter().all(|e| *e == LogEvent::EnvRun { cpu: 0, env: id }));
}
